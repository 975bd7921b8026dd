// 传输原语
//
// 流水线只通过 TransferPrimitive trait 与存储端交互：
// 提交字节 + 元数据 -> 成功回执或错误，过程中可以回调进度
//
// 内置两种实现：
// - LocalDirTransfer: 写入本地存储目录（按实体分子目录）
// - HttpTransfer: multipart POST 到上传接口，流式发送并回报进度

use crate::error::TransferError;
use crate::uploader::asset::{Asset, UploadMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 进度回调 (已发送字节, 总字节)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 进度回报的块大小
pub const PROGRESS_BLOCK_SIZE: usize = 64 * 1024;

/// 单文件传输请求
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: String,
    pub entity_id: String,
    /// 在任务文件列表中的下标
    pub file_index: usize,
    pub asset: Asset,
    /// 已合并单文件字段的元数据
    pub metadata: UploadMetadata,
    /// 任务取消令牌
    pub cancel: CancellationToken,
}

/// 传输回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    /// 存储端位置（路径 / URL）
    pub remote_location: Option<String>,
    pub bytes_sent: u64,
}

/// 传输原语
///
/// 实现方自行负责超时，必须最终返回（成功或失败）
#[async_trait]
pub trait TransferPrimitive: Send + Sync {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferReceipt, TransferError>;

    /// 名称（日志用）
    fn name(&self) -> &str {
        "transfer"
    }
}

/// 把文件名中的路径分隔符等字符替换掉，防止写出存储目录
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_blocks(data: &Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(PROGRESS_BLOCK_SIZE)
        .map(|start| data.slice(start..(start + PROGRESS_BLOCK_SIZE).min(data.len())))
        .collect()
}

// =====================================================
// 本地目录
// =====================================================

/// 写入本地存储目录
///
/// 布局：`<root>/<entity_id>/<job_id>/<序号>_<文件名>`
#[derive(Debug, Clone)]
pub struct LocalDirTransfer {
    root: PathBuf,
}

impl LocalDirTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_path(&self, request: &TransferRequest) -> PathBuf {
        self.root
            .join(sanitize_file_name(&request.entity_id))
            .join(&request.job_id)
            .join(format!(
                "{}_{}",
                request.file_index + 1,
                sanitize_file_name(&request.asset.name)
            ))
    }
}

#[async_trait]
impl TransferPrimitive for LocalDirTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferReceipt, TransferError> {
        let target = self.target_path(&request);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // 先写临时文件，完成后再重命名；任何一步失败都删除临时文件
        let part_path = target.with_extension("part");
        let written = match write_part(&part_path, &target, &request, &on_progress).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&part_path).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("删除临时文件失败: {:?}, 错误: {}", part_path, remove_err);
                    }
                }
                return Err(e);
            }
        };

        debug!(
            "文件已写入本地存储: {} -> {:?}",
            request.asset.name, target
        );

        Ok(TransferReceipt {
            remote_location: Some(target.to_string_lossy().to_string()),
            bytes_sent: written,
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// 分块写入临时文件并重命名为目标文件，返回写入字节数
async fn write_part(
    part_path: &Path,
    target: &Path,
    request: &TransferRequest,
    on_progress: &ProgressCallback,
) -> Result<u64, TransferError> {
    let total = request.asset.size();
    let mut file = tokio::fs::File::create(part_path).await?;
    let mut written = 0u64;

    for block in split_blocks(&request.asset.data) {
        if request.cancel.is_cancelled() {
            return Err(TransferError::Canceled);
        }
        file.write_all(&block).await?;
        written += block.len() as u64;
        on_progress(written, total);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(part_path, target).await?;
    Ok(written)
}

// =====================================================
// HTTP
// =====================================================

/// 上传接口响应
#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    files: Vec<serde_json::Value>,
    #[serde(default, rename = "uploadedFiles")]
    uploaded_files: Vec<serde_json::Value>,
}

impl UploadResponse {
    fn location(&self) -> Option<String> {
        self.files
            .iter()
            .chain(self.uploaded_files.iter())
            .find_map(|f| {
                ["url", "filePath", "path"]
                    .iter()
                    .find_map(|key| f.get(*key).and_then(|v| v.as_str()))
                    .map(|s| s.to_string())
            })
    }
}

/// multipart POST 上传
///
/// 表单字段：`file` + 元数据中的每个键值
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransfer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    fn build_form(
        request: &TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<multipart::Form, TransferError> {
        let total = request.asset.size();
        let mut sent = 0u64;
        let stream = futures::stream::iter(split_blocks(&request.asset.data)).map(move |block| {
            sent += block.len() as u64;
            on_progress(sent, total);
            Ok::<Bytes, std::io::Error>(block)
        });

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(request.asset.name.clone())
            .mime_str(&request.asset.content_type)
            .map_err(|e| TransferError::Rejected {
                status: None,
                message: format!("无效的 MIME 类型: {}", e),
            })?;

        let mut form = multipart::Form::new().part("file", part);
        for (key, value) in request.metadata.iter() {
            form = form.text(key.clone(), value.clone());
        }
        Ok(form)
    }

    async fn send(
        &self,
        request: &TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferReceipt, TransferError> {
        let form = Self::build_form(request, on_progress)?;

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        debug!(
            "上传响应: file={}, status={}, body={}",
            request.asset.name, status, body
        );

        let parsed: UploadResponse =
            serde_json::from_str(&body).map_err(|e| TransferError::Rejected {
                status: Some(status.as_u16()),
                message: if status.is_success() {
                    format!("响应解析失败: {}", e)
                } else {
                    format!("HTTP {}: {}", status.as_u16(), body.trim())
                },
            })?;

        if !status.is_success() || !parsed.success {
            let message = parsed
                .message
                .clone()
                .or_else(|| parsed.error.clone())
                .unwrap_or_else(|| format!("HTTP {}: 上传失败", status.as_u16()));
            warn!("上传被拒绝: file={}, {}", request.asset.name, message);
            return Err(TransferError::Rejected {
                status: Some(status.as_u16()),
                message,
            });
        }

        Ok(TransferReceipt {
            remote_location: parsed.location(),
            bytes_sent: request.asset.size(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout(e.to_string())
    } else {
        TransferError::Network(e.to_string())
    }
}

#[async_trait]
impl TransferPrimitive for HttpTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferReceipt, TransferError> {
        let cancel = request.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Canceled),
            result = self.send(&request, on_progress) => result,
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
