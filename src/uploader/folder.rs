//! 文件夹扫描模块
//!
//! 源目录下的每个子目录对应一个设施批次：
//! - 子目录名作为实体 ID 和显示名
//! - 子目录内（递归）的常规文件组成该批次的文件列表
//! - 源目录根部的散落文件不属于任何设施，忽略

use crate::uploader::asset::{format_bytes, Asset};
use crate::uploader::hasher::ContentHasher;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 一个设施的待上传文件
#[derive(Debug, Clone)]
pub struct FacilityBatch {
    pub entity_id: String,
    pub label: String,
    /// 按路径排序
    pub files: Vec<PathBuf>,
    pub total_size: u64,
}

impl FacilityBatch {
    /// 读取全部文件
    pub async fn load_assets(&self) -> Result<Vec<Asset>> {
        let mut assets = Vec::with_capacity(self.files.len());
        for path in &self.files {
            assets.push(Asset::from_path(path).await?);
        }
        Ok(assets)
    }

    /// 按内容指纹去除重复文件（保留路径排序靠前的一份），返回移除数量
    ///
    /// 出错时批次保持不变
    pub async fn dedup_by_content(&mut self) -> Result<usize> {
        let mut seen = HashSet::with_capacity(self.files.len());
        let mut kept = Vec::with_capacity(self.files.len());
        let mut removed_size = 0u64;
        let mut removed = 0;

        for path in &self.files {
            let fingerprint = ContentHasher::fingerprint_file(path).await?;
            if seen.insert(fingerprint) {
                kept.push(path.clone());
                continue;
            }

            removed_size += tokio::fs::metadata(path)
                .await
                .with_context(|| format!("读取文件元数据失败: {}", path.display()))?
                .len();
            removed += 1;
            debug!("跳过重复文件: {}", path.display());
        }

        self.files = kept;
        self.total_size = self.total_size.saturating_sub(removed_size);
        if removed > 0 {
            info!("设施 {} 去除 {} 个重复文件", self.entity_id, removed);
        }
        Ok(removed)
    }
}

/// 扫描配置
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 单文件大小上限（字节），超过则跳过
    pub max_file_size: Option<u64>,
    /// 跳过隐藏文件和目录（以 . 开头）
    pub skip_hidden: bool,
}

/// 文件夹扫描器
#[derive(Debug, Clone, Default)]
pub struct FolderScanner {
    options: ScanOptions,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

impl FolderScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self { options }
    }

    /// 扫描源目录，返回按实体 ID 排序的设施批次（空目录不产生批次）
    pub fn scan_batches<P: AsRef<Path>>(&self, root: P) -> Result<Vec<FacilityBatch>> {
        let root = root.as_ref();

        if !root.exists() {
            anyhow::bail!("扫描路径不存在: {}", root.display());
        }
        if !root.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", root.display());
        }

        info!("开始扫描源目录: {}", root.display());

        let mut batches = Vec::new();
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("读取目录失败: {}", root.display()))?;

        for entry in entries {
            let entry = entry.with_context(|| format!("读取目录条目失败: {}", root.display()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if self.options.skip_hidden && name.starts_with('.') {
                debug!("跳过隐藏目录: {}", path.display());
                continue;
            }
            if !path.is_dir() {
                debug!("忽略源目录根部文件: {}", path.display());
                continue;
            }

            let files = self.scan_files(&path)?;
            if files.is_empty() {
                warn!("设施目录为空，跳过: {}", path.display());
                continue;
            }

            let total_size = files.iter().map(|(_, size)| *size).sum();
            batches.push(FacilityBatch {
                entity_id: name.clone(),
                label: name,
                files: files.into_iter().map(|(p, _)| p).collect(),
                total_size,
            });
        }

        batches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        info!(
            "源目录扫描完成: {} 个设施, {} 个文件, 总大小 {}",
            batches.len(),
            batches.iter().map(|b| b.files.len()).sum::<usize>(),
            format_bytes(batches.iter().map(|b| b.total_size).sum())
        );

        Ok(batches)
    }

    /// 递归列出目录下的常规文件
    pub fn scan_files(&self, dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(dir)
            .follow_links(self.options.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !skip_hidden || !is_hidden(e));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| format!("遍历目录失败: {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let size = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                .len();

            if let Some(max) = self.options.max_file_size {
                if size > max {
                    warn!(
                        "跳过超大文件: {} ({})",
                        entry.path().display(),
                        format_bytes(size)
                    );
                    continue;
                }
            }

            files.push((entry.into_path(), size));
        }

        Ok(files)
    }
}
