//! 错误类型定义
//!
//! - `PipelineError`: enqueue 等入口同步返回的错误
//! - `TransferError`: 单文件传输错误，只记录在该文件的结果中
//! - `NormalizationError`: 单文件压缩错误，回退到原始文件
//! - `JobFailure`: 任务级终止错误（取消 / 流水线故障）

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 入口错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// 任务参数不合法（空文件列表、缺少实体 ID 等），任务不会被创建
    #[error("无效的上传任务: {0}")]
    InvalidJob(String),

    /// 调度器已关闭，不再接受新任务
    #[error("上传调度器已关闭")]
    Closed,
}

/// 单文件传输错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("传输超时: {0}")]
    Timeout(String),

    /// 存储端拒绝（HTTP 非 2xx 或响应 success=false）
    #[error("存储端拒绝上传 (status={status:?}): {message}")]
    Rejected { status: Option<u16>, message: String },

    #[error("IO 错误: {0}")]
    Io(String),

    #[error("传输已取消")]
    Canceled,
}

impl TransferError {
    /// 是否值得重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_) | TransferError::Timeout(_))
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}

/// 单文件压缩错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("图片解码失败: {0}")]
    Decode(String),

    #[error("图片编码失败: {0}")]
    Encode(String),

    /// 压缩线程异常退出（panic 或被取消）
    #[error("压缩线程异常: {0}")]
    Worker(String),
}

/// 任务级失败类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 流水线故障（全部文件压缩失败、驱动任务 panic、调度器关闭）
    PipelineFault,
    /// 用户取消
    Canceled,
}

/// 任务级失败
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn canceled() -> Self {
        Self {
            kind: FailureKind::Canceled,
            message: "canceled".to_string(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::PipelineFault,
            message: message.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == FailureKind::Canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(TransferError::Network("reset".into()).is_retryable());
        assert!(TransferError::Timeout("30s".into()).is_retryable());
        assert!(!TransferError::Canceled.is_retryable());
        assert!(!TransferError::Rejected {
            status: Some(413),
            message: "too large".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_job_failure_kinds() {
        let canceled = JobFailure::canceled();
        assert!(canceled.is_canceled());
        assert_eq!(canceled.message, "canceled");

        let fault = JobFailure::fault("全部文件压缩失败");
        assert!(!fault.is_canceled());
        assert_eq!(fault.kind, FailureKind::PipelineFault);
    }
}
