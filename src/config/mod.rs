// 配置管理模块

use crate::uploader::chunk::DEFAULT_CHUNK_SIZE;
use crate::uploader::estimator::{BandwidthClass, DEFAULT_CONCURRENCY};
use crate::uploader::normalizer::NormalizeConstraints;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 同时处理的任务数上限的取值范围
pub const MIN_CONCURRENT_JOBS: usize = 1;
pub const MAX_CONCURRENT_JOBS: usize = 8;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传调度配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 图片压缩配置
    #[serde(default)]
    pub normalize: NormalizeConstraints,
    /// 存储端配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 没有网络信号时的并发任务数
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// 同时处理的任务数上限（1-8），与网络估算值取较小者
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// 任务内每块并发传输的文件数
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 是否在上传前压缩图片
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    /// 准入被拒后的重试间隔（毫秒）
    #[serde(default = "default_admission_retry_ms")]
    pub admission_retry_ms: u64,
    /// 进度通知节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
    /// 是否在元数据中附带内容指纹（contentHash）
    #[serde(default = "default_true")]
    pub attach_content_hash: bool,
    /// 网络错误 / 超时的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 固定网络类型（"4g" / "3g" / "2g" / "slow-2g"），不设置时按实测吞吐估算
    #[serde(default)]
    pub assumed_connection: Option<String>,
    /// 扫描文件夹时是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default = "default_true")]
    pub skip_hidden_files: bool,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_concurrent_jobs() -> usize {
    MAX_CONCURRENT_JOBS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_admission_retry_ms() -> u64 {
    100
}

fn default_progress_throttle_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    2
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            chunk_size: default_chunk_size(),
            compression_enabled: true,
            admission_retry_ms: default_admission_retry_ms(),
            progress_throttle_ms: default_progress_throttle_ms(),
            attach_content_hash: true,
            max_retries: default_max_retries(),
            assumed_connection: None,
            skip_hidden_files: true,
        }
    }
}

impl UploadConfig {
    /// 固定网络类型对应的带宽等级
    pub fn assumed_bandwidth(&self) -> Option<BandwidthClass> {
        self.assumed_connection
            .as_deref()
            .and_then(BandwidthClass::from_effective_type)
    }
}

/// 存储端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    /// 写入本地目录
    #[default]
    Local,
    /// multipart POST 到上传接口
    Http,
}

/// 存储端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub backend: TransferBackend,
    /// 本地存储目录（backend = local）
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// 上传接口地址（backend = http）
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// 单文件请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 完成结果记录文件（JSON Lines），不设置时只打印日志
    #[serde(default)]
    pub results_file: Option<PathBuf>,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3000/api/upload-supabase".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            backend: TransferBackend::default(),
            local_root: default_local_root(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            results_file: None,
        }
    }
}

impl AppConfig {
    /// 检查配置取值
    pub fn validate(&self) -> Result<()> {
        let upload = &self.upload;
        if !(MIN_CONCURRENT_JOBS..=MAX_CONCURRENT_JOBS).contains(&upload.max_concurrent_jobs) {
            anyhow::bail!(
                "max_concurrent_jobs 必须在 {}-{} 之间，当前为 {}",
                MIN_CONCURRENT_JOBS,
                MAX_CONCURRENT_JOBS,
                upload.max_concurrent_jobs
            );
        }
        if upload.default_concurrency == 0 {
            anyhow::bail!("default_concurrency 必须大于 0");
        }
        if upload.chunk_size == 0 {
            anyhow::bail!("chunk_size 必须大于 0");
        }
        if let Some(conn) = &upload.assumed_connection {
            if upload.assumed_bandwidth().is_none() {
                anyhow::bail!("无法识别的网络类型: {}", conn);
            }
        }

        let normalize = &self.normalize;
        if !(0.0..=1.0).contains(&normalize.quality) || normalize.quality == 0.0 {
            anyhow::bail!("quality 必须在 (0, 1] 之间，当前为 {}", normalize.quality);
        }
        if normalize.max_width == 0 || normalize.max_height == 0 {
            anyhow::bail!("max_width / max_height 必须大于 0");
        }

        if self.transfer.backend == TransferBackend::Http && self.transfer.endpoint.trim().is_empty()
        {
            anyhow::bail!("backend = http 时必须配置 endpoint");
        }
        if self.transfer.timeout_secs == 0 {
            anyhow::bail!("timeout_secs 必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 文件不存在时写出默认配置，方便修改
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::normalizer::TargetFormat;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload.chunk_size, 4);
        assert_eq!(config.upload.default_concurrency, 4);
        assert_eq!(config.upload.max_retries, 2);
        assert_eq!(config.normalize.max_width, 1920);
        assert_eq!(config.normalize.target_format, TargetFormat::Jpeg);
        assert_eq!(config.normalize.max_output_bytes, 2 * 1024 * 1024);
        assert_eq!(config.transfer.backend, TransferBackend::Local);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            max_concurrent_jobs = 2
            assumed_connection = "3g"

            [normalize]
            quality = 0.6
            target_format = "webp"

            [transfer]
            backend = "http"
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.max_concurrent_jobs, 2);
        assert_eq!(config.upload.chunk_size, 4);
        assert_eq!(config.upload.assumed_bandwidth(), Some(BandwidthClass::Standard));
        assert_eq!(config.normalize.target_format, TargetFormat::Webp);
        assert_eq!(config.normalize.max_height, 1920);
        assert_eq!(config.transfer.backend, TransferBackend::Http);
        assert_eq!(config.transfer.timeout_secs, 120);
        assert!(config.log.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.upload.max_concurrent_jobs = 9;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.assumed_connection = Some("5g-ultra".into());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.normalize.quality = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");

        let mut config = AppConfig::default();
        config.upload.chunk_size = 6;
        config.transfer.results_file = Some(PathBuf::from("out/results.jsonl"));
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.upload.chunk_size, 6);
        assert_eq!(
            loaded.transfer.results_file,
            Some(PathBuf::from("out/results.jsonl"))
        );
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config.upload.chunk_size, 4);
        assert!(path.exists());
    }
}
