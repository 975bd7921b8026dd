// Facility Upload Pipeline
// 设施资料上传流水线：压缩、自适应并发调度、分块传输、进度事件

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 进度事件模块
pub mod events;

// 日志模块
pub mod logging;

// 上传流水线模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::{FailureKind, JobFailure, PipelineError, TransferError};
pub use events::{QueueStats, Subscription};
pub use uploader::{
    Asset, JobSnapshot, NormalizeConstraints, UploadJobStatus, UploadMetadata, UploadScheduler,
};
