// 分块并行传输
//
// 文件列表按顺序切成固定大小的块（默认 4 个文件一块）：
// - 块内所有文件并发传输
// - 整块结束后才开始下一块
// - 结果与输入顺序一一对应
// - 单文件失败只记录在该文件的结果里，不影响同块和后续块
//
// 可重试错误（网络 / 超时）按指数退避重试

use crate::error::TransferError;
use crate::uploader::asset::{Asset, UploadMetadata};
use crate::uploader::estimator::ThroughputMonitor;
use crate::uploader::job::{FileResult, TRANSFER_PHASE_CAP, TRANSFER_PHASE_START};
use crate::uploader::normalizer::NormalizationReport;
use crate::uploader::transfer::{ProgressCallback, TransferPrimitive, TransferRequest};
use futures::future::join_all;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 默认块大小（每块文件数）
pub const DEFAULT_CHUNK_SIZE: usize = 4;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 单文件进度的精度（百万分之一）
const FRACTION_SCALE: u32 = 1_000_000;

/// 计算指数退避延迟
pub fn calculate_backoff_delay(retry_count: u32) -> Duration {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
}

/// 把 [0, len) 按 chunk_size 切成连续区间
pub fn partition(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

/// 传输阶段进度映射到任务进度：30 -> 99
pub fn transfer_phase_progress(fraction: f64) -> u8 {
    let fraction = fraction.clamp(0.0, 1.0);
    let span = (100 - TRANSFER_PHASE_START) as f64;
    let progress = TRANSFER_PHASE_START as f64 + (fraction * span).floor();
    (progress as u8).min(TRANSFER_PHASE_CAP)
}

/// 待传输的文件（已压缩）
#[derive(Debug, Clone)]
pub struct PreparedFile {
    /// 在任务文件列表中的下标
    pub index: usize,
    pub asset: Asset,
    /// 已合并单文件字段的元数据
    pub metadata: UploadMetadata,
    pub normalization: Option<NormalizationReport>,
}

/// 传输阶段整体进度回调，参数为 0-1 的比例
pub type FractionCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// 按文件汇总的传输进度
///
/// 每个文件占 1/N，文件内按已发送字节计算
#[derive(Debug)]
struct ProgressTracker {
    fractions: Vec<AtomicU32>,
}

impl ProgressTracker {
    fn new(files: usize) -> Self {
        Self {
            fractions: (0..files).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// 更新某个文件的进度（只增不减）
    fn update(&self, slot: usize, loaded: u64, total: u64) {
        let fraction = if total == 0 {
            FRACTION_SCALE
        } else {
            ((loaded.min(total) as f64 / total as f64) * FRACTION_SCALE as f64) as u32
        };
        if let Some(cell) = self.fractions.get(slot) {
            cell.fetch_max(fraction, Ordering::Relaxed);
        }
    }

    fn finish(&self, slot: usize) {
        if let Some(cell) = self.fractions.get(slot) {
            cell.store(FRACTION_SCALE, Ordering::Relaxed);
        }
    }

    fn overall(&self) -> f64 {
        if self.fractions.is_empty() {
            return 1.0;
        }
        let sum: u64 = self
            .fractions
            .iter()
            .map(|f| f.load(Ordering::Relaxed) as u64)
            .sum();
        sum as f64 / (self.fractions.len() as u64 * FRACTION_SCALE as u64) as f64
    }
}

/// 单个任务的传输上下文
#[derive(Clone)]
pub struct TransferContext {
    pub job_id: String,
    pub entity_id: String,
    pub cancel: CancellationToken,
    pub on_fraction: FractionCallback,
}

/// 分块并行传输引擎
#[derive(Clone)]
pub struct ChunkedTransfer {
    primitive: Arc<dyn TransferPrimitive>,
    chunk_size: usize,
    max_retries: u32,
    monitor: Option<Arc<ThroughputMonitor>>,
}

impl ChunkedTransfer {
    pub fn new(primitive: Arc<dyn TransferPrimitive>, chunk_size: usize) -> Self {
        Self {
            primitive,
            chunk_size: chunk_size.max(1),
            max_retries: 0,
            monitor: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 每次成功传输后把吞吐记录到监视器
    pub fn with_monitor(mut self, monitor: Arc<ThroughputMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 传输全部文件，返回与输入顺序一致的结果
    pub async fn run(&self, ctx: &TransferContext, files: Vec<PreparedFile>) -> Vec<FileResult> {
        let total = files.len();
        let tracker = Arc::new(ProgressTracker::new(total));
        let chunks = partition(total, self.chunk_size);
        let mut results = Vec::with_capacity(total);

        debug!(
            "开始分块传输: job={}, 文件数={}, 块数={}, 块大小={}, 后端={}",
            ctx.job_id,
            total,
            chunks.len(),
            self.chunk_size,
            self.primitive.name()
        );

        for (chunk_no, range) in chunks.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                break;
            }

            let chunk_futures = files[range.clone()]
                .iter()
                .zip(range.clone())
                .map(|(file, slot)| self.transfer_one(ctx, file.clone(), slot, tracker.clone()));

            let chunk_results = join_all(chunk_futures).await;
            let failed = chunk_results.iter().filter(|r| !r.success).count();
            debug!(
                "块 {} 完成: job={}, 文件 {:?}, 失败 {}",
                chunk_no + 1,
                ctx.job_id,
                range,
                failed
            );
            results.extend(chunk_results);
        }

        results
    }

    async fn transfer_one(
        &self,
        ctx: &TransferContext,
        file: PreparedFile,
        slot: usize,
        tracker: Arc<ProgressTracker>,
    ) -> FileResult {
        let on_progress: ProgressCallback = {
            let tracker = tracker.clone();
            let on_fraction = ctx.on_fraction.clone();
            Arc::new(move |loaded, total| {
                tracker.update(slot, loaded, total);
                on_fraction(tracker.overall());
            })
        };

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let request = TransferRequest {
                job_id: ctx.job_id.clone(),
                entity_id: ctx.entity_id.clone(),
                file_index: file.index,
                asset: file.asset.clone(),
                metadata: file.metadata.clone(),
                cancel: ctx.cancel.clone(),
            };

            let started = Instant::now();
            match self.primitive.transfer(request, on_progress.clone()).await {
                Ok(receipt) => {
                    if let Some(monitor) = &self.monitor {
                        monitor.record(receipt.bytes_sent, started.elapsed());
                    }
                    break Ok(receipt);
                }
                Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                    let delay = calculate_backoff_delay(attempts - 1);
                    warn!(
                        "文件传输失败，{}ms 后重试 ({}/{}): job={}, file={}, 错误: {}",
                        delay.as_millis(),
                        attempts,
                        self.max_retries,
                        ctx.job_id,
                        file.asset.name,
                        e
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break Err(TransferError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        tracker.finish(slot);
        (ctx.on_fraction)(tracker.overall());

        match outcome {
            Ok(receipt) => {
                debug!(
                    "文件传输成功: job={}, file={}, attempts={}",
                    ctx.job_id, file.asset.name, attempts
                );
                FileResult {
                    index: file.index,
                    file_name: file.asset.name,
                    success: true,
                    remote_location: receipt.remote_location,
                    error: None,
                    attempts,
                    normalization: file.normalization,
                }
            }
            Err(e) => {
                warn!(
                    "文件传输失败: job={}, file={}, 错误: {}",
                    ctx.job_id, file.asset.name, e
                );
                FileResult {
                    index: file.index,
                    file_name: file.asset.name,
                    success: false,
                    remote_location: None,
                    error: Some(e.to_string()),
                    attempts,
                    normalization: file.normalization,
                }
            }
        }
    }
}
