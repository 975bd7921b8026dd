// 上传流水线模块
//
// 数据流：
// 调度器准入 -> 引擎驱动任务 -> 压缩（normalizer）+ 指纹（hasher）
// -> 分块并行传输（chunk + transfer）-> 完成落地（sink）
//
// 并发控制：
// - 任务级：调度器按网络估算（estimator）与配置上限取较小值
// - 文件级：任务内按固定块大小分块，块内全部并行，块间串行

pub mod asset;
pub mod chunk;
pub mod engine;
pub mod estimator;
pub mod folder;
pub mod hasher;
pub mod job;
pub mod normalizer;
pub mod scheduler;
pub mod sink;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use asset::{format_bytes, Asset, AssetDescriptor, UploadMetadata};
pub use chunk::{ChunkedTransfer, DEFAULT_CHUNK_SIZE};
pub use engine::{JobEngine, JobHandle, JobObserver};
pub use estimator::{
    BandwidthClass, ConcurrencyEstimator, NetworkQualitySource, SharedQuality, StaticQuality,
    ThroughputMonitor,
};
pub use folder::{FacilityBatch, FolderScanner, ScanOptions};
pub use hasher::ContentHasher;
pub use job::{FileResult, JobSnapshot, UploadJob, UploadJobStatus};
pub use normalizer::{
    AssetNormalizer, NormalizationReport, NormalizeConstraints, NormalizeOutcome, TargetFormat,
};
pub use scheduler::{SchedulerBuilder, UploadScheduler};
pub use sink::{CompletionSink, JsonLinesSink, LogSink};
pub use transfer::{HttpTransfer, LocalDirTransfer, TransferPrimitive};
