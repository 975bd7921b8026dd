// 上传资源与元数据
//
// Asset 持有文件内容（Bytes，克隆只增加引用计数），
// UploadMetadata 是透传给存储端的字符串键值表

use crate::error::PipelineError;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// 单个文件的元数据键：文件名
pub const META_FILE_NAME: &str = "fileName";
/// 单个文件的元数据键：文件序号（从 1 开始）
pub const META_FILE_INDEX: &str = "fileIndex";
/// 单个文件的元数据键：内容指纹
pub const META_CONTENT_HASH: &str = "contentHash";

/// 待上传的二进制资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// 逻辑文件名
    pub name: String,
    /// MIME 类型
    pub content_type: String,
    /// 文件内容
    pub data: Bytes,
}

impl Asset {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// 从本地文件读取，按扩展名推断 MIME 类型
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取文件失败: {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .with_context(|| format!("无效的文件名: {}", path.display()))?;

        Ok(Self::new(name, content_type_for_path(path), data))
    }

    /// 字节大小
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// 是否为图片
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// 不含内容的描述信息（用于快照）
    pub fn descriptor(&self) -> AssetDescriptor {
        AssetDescriptor {
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            size: self.size(),
        }
    }
}

/// 资源描述（快照中只暴露描述，不暴露内容）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// 根据扩展名推断 MIME 类型
pub fn content_type_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "pdf" => "application/pdf",
        "hwp" => "application/x-hwp",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// 上传元数据（只允许字符串值）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadMetadata(BTreeMap<String, String>);

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 对象构建
    ///
    /// 非字符串值直接拒绝，不做隐式转换
    pub fn from_json(value: &serde_json::Value) -> std::result::Result<Self, PipelineError> {
        let object = value
            .as_object()
            .ok_or_else(|| PipelineError::InvalidJob("元数据必须是 JSON 对象".to_string()))?;

        let mut map = BTreeMap::new();
        for (key, value) in object {
            match value {
                serde_json::Value::String(s) => {
                    map.insert(key.clone(), s.clone());
                }
                other => {
                    return Err(PipelineError::InvalidJob(format!(
                        "元数据字段 {} 不是字符串: {}",
                        key, other
                    )));
                }
            }
        }
        Ok(Self(map))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// 合并单文件字段（fileName / fileIndex），返回新的元数据
    pub fn for_file(&self, file_name: &str, index: usize) -> Self {
        self.clone()
            .with(META_FILE_NAME, file_name)
            .with(META_FILE_INDEX, (index + 1).to_string())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UploadMetadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
