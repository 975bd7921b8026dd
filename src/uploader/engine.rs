// 任务驱动引擎
//
// 一个任务由一个驱动 future 从开始执行到终止状态：
// 1. queued -> normalizing：逐个压缩文件（阻塞线程池），进度 10 -> 30
// 2. 全部文件压缩出错 -> failed (pipeline_fault)
// 3. normalizing -> transferring：分块并行传输，进度 30 -> 99
// 4. transferring -> completed：写入结果，进度 100，交给 CompletionSink
//
// 取消：驱动 future 与任务的 CancellationToken 做 select，取消后整个 future 被丢弃，
// 在途传输的结果不会写回任务

use crate::error::{JobFailure, NormalizationError};
use crate::events::{NotifyKind, ProgressThrottler};
use crate::uploader::asset::{format_bytes, Asset, META_CONTENT_HASH};
use crate::uploader::chunk::{
    transfer_phase_progress, ChunkedTransfer, PreparedFile, TransferContext,
};
use crate::uploader::hasher::ContentHasher;
use crate::uploader::job::{
    JobSnapshot, UploadJob, UploadJobStatus, NORMALIZE_PHASE_START, TRANSFER_PHASE_START,
};
use crate::uploader::normalizer::{AssetNormalizer, NormalizationReport, NormalizeOutcome};
use crate::uploader::sink::CompletionSink;
use futures::StreamExt;
use parking_lot::{ReentrantMutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 任务状态变化的接收方（调度器实现）
pub trait JobObserver: Send + Sync {
    fn job_changed(&self, snapshot: &JobSnapshot, kind: NotifyKind);
}

/// 任务句柄
///
/// 任务状态只通过 `apply` 修改：修改成功才会通知，
/// 同一任务的通知按修改顺序串行送达
pub struct JobHandle {
    job: RwLock<UploadJob>,
    cancel: CancellationToken,
    emit_lock: ReentrantMutex<()>,
    throttler: ProgressThrottler,
}

impl JobHandle {
    pub fn new(job: UploadJob, throttle_ms: u64) -> Self {
        Self {
            job: RwLock::new(job),
            cancel: CancellationToken::new(),
            emit_lock: ReentrantMutex::new(()),
            throttler: ProgressThrottler::with_millis(throttle_ms),
        }
    }

    pub fn id(&self) -> String {
        self.job.read().id.clone()
    }

    pub fn status(&self) -> UploadJobStatus {
        self.job.read().status
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.read().snapshot()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 只读访问任务
    pub fn read<R>(&self, f: impl FnOnce(&UploadJob) -> R) -> R {
        f(&self.job.read())
    }

    pub fn lock_read(&self) -> RwLockReadGuard<'_, UploadJob> {
        self.job.read()
    }

    /// 在通知锁内执行（与 `apply` 的通知互斥）
    pub fn with_emit_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.emit_lock.lock();
        f()
    }

    /// 修改任务并通知观察者
    ///
    /// `f` 返回 false 表示状态机拒绝了修改，此时不通知
    pub fn apply(
        &self,
        observer: &dyn JobObserver,
        kind: NotifyKind,
        f: impl FnOnce(&mut UploadJob) -> bool,
    ) -> bool {
        let _guard = self.emit_lock.lock();

        let snapshot = {
            let mut job = self.job.write();
            if !f(&mut job) {
                return false;
            }
            if kind.is_throttled() && !self.throttler.should_emit() {
                return true;
            }
            job.snapshot()
        };

        observer.job_changed(&snapshot, kind);
        true
    }
}

/// 单个文件的准备结果
struct PreparedAsset {
    asset: Asset,
    report: Option<NormalizationReport>,
    content_hash: Option<String>,
}

/// 任务驱动引擎
pub struct JobEngine {
    normalizer: AssetNormalizer,
    transfer: ChunkedTransfer,
    compression_enabled: AtomicBool,
    attach_content_hash: bool,
    sink: Option<Arc<dyn CompletionSink>>,
    /// 完成回调等后台任务
    tasks: TaskTracker,
}

impl JobEngine {
    pub fn new(normalizer: AssetNormalizer, transfer: ChunkedTransfer) -> Self {
        Self {
            normalizer,
            transfer,
            compression_enabled: AtomicBool::new(true),
            attach_content_hash: false,
            sink: None,
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_compression(self, enabled: bool) -> Self {
        self.compression_enabled.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_content_hash(mut self, enabled: bool) -> Self {
        self.attach_content_hash = enabled;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 运行期开关压缩，只影响之后开始的任务
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.compression_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled.load(Ordering::SeqCst)
    }

    /// 引擎派生的后台任务（完成回调），调度器的任务驱动也登记在这里
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// 执行任务直到终止状态或被取消
    pub async fn run(&self, handle: Arc<JobHandle>, observer: Arc<dyn JobObserver>) {
        let cancel = handle.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("任务已取消，停止执行: job={}", handle.id());
            }
            _ = self.drive(handle.clone(), observer) => {}
        }
    }

    async fn drive(&self, handle: Arc<JobHandle>, observer: Arc<dyn JobObserver>) {
        let (job_id, entity_id, entity_label, files, metadata) = handle.read(|job| {
            (
                job.id.clone(),
                job.entity_id.clone(),
                job.entity_label.clone(),
                job.files.clone(),
                job.metadata.clone(),
            )
        });

        if !handle.apply(observer.as_ref(), NotifyKind::StateChanged, |j| {
            j.mark_normalizing()
        }) {
            return;
        }

        info!(
            "🚀 开始处理上传任务: job={}, entity={} ({}), 文件数={}",
            job_id,
            entity_label,
            entity_id,
            files.len()
        );

        // 1. 压缩
        let compress = self.compression_enabled();
        let total = files.len();
        let mut prepared_assets = Vec::with_capacity(total);
        let mut stream = futures::stream::iter(files.into_iter().map(|asset| self.prepare(asset, compress)))
            .buffered(self.transfer.chunk_size());

        while let Some(prepared) = stream.next().await {
            prepared_assets.push(prepared);
            let done = prepared_assets.len();
            let span = (TRANSFER_PHASE_START - NORMALIZE_PHASE_START) as usize;
            let progress = NORMALIZE_PHASE_START as usize + done * span / total.max(1);
            handle.apply(observer.as_ref(), NotifyKind::Progress, |j| {
                j.advance_progress(progress as u8)
            });
        }
        drop(stream);

        let faults = prepared_assets
            .iter()
            .filter(|p| p.report.as_ref().map(|r| r.is_fault()).unwrap_or(false))
            .count();

        if total > 0 && faults == total {
            error!("全部文件压缩失败，任务终止: job={}, 文件数={}", job_id, total);
            handle.apply(observer.as_ref(), NotifyKind::StateChanged, |j| {
                j.mark_failed(JobFailure::fault(format!("全部 {} 个文件压缩失败", total)))
            });
            return;
        }

        if compress {
            log_compression_summary(&job_id, &prepared_assets, faults);
        }

        let prepared: Vec<PreparedFile> = prepared_assets
            .into_iter()
            .enumerate()
            .map(|(index, p)| {
                let mut file_metadata = metadata.for_file(&p.asset.name, index);
                if let Some(hash) = p.content_hash {
                    file_metadata.insert(META_CONTENT_HASH, hash);
                }
                PreparedFile {
                    index,
                    asset: p.asset,
                    metadata: file_metadata,
                    normalization: p.report,
                }
            })
            .collect();

        // 2. 传输
        if !handle.apply(observer.as_ref(), NotifyKind::StateChanged, |j| {
            j.mark_transferring()
        }) {
            return;
        }

        let on_fraction = {
            let handle = handle.clone();
            let observer = observer.clone();
            Arc::new(move |fraction: f64| {
                let progress = transfer_phase_progress(fraction);
                handle.apply(observer.as_ref(), NotifyKind::Progress, |j| {
                    j.advance_progress(progress)
                });
            })
        };

        let ctx = TransferContext {
            job_id: job_id.clone(),
            entity_id: entity_id.clone(),
            cancel: handle.cancel.clone(),
            on_fraction,
        };
        let results = self.transfer.run(&ctx, prepared).await;

        if handle.cancel.is_cancelled() {
            return;
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;

        // 3. 完成
        if !handle.apply(observer.as_ref(), NotifyKind::StateChanged, |j| {
            j.mark_completed(results)
        }) {
            return;
        }

        if failed > 0 {
            warn!(
                "上传任务完成（部分失败）: job={}, 成功 {}, 失败 {}",
                job_id, succeeded, failed
            );
        } else {
            info!("✅ 上传任务完成: job={}, 文件数={}", job_id, succeeded);
        }

        if let Some(sink) = &self.sink {
            let sink = sink.clone();
            let snapshot = handle.snapshot();
            self.tasks.spawn(async move {
                if let Err(e) = sink.on_job_completed(snapshot).await {
                    warn!("任务结果持久化失败: {:#}", e);
                }
            });
        }
    }

    /// 压缩 + 指纹，放到阻塞线程池执行
    async fn prepare(&self, asset: Asset, compress: bool) -> PreparedAsset {
        let attach_hash = self.attach_content_hash;
        if !attach_hash && (!compress || !asset.is_image()) {
            let report = compress.then(|| self.normalizer.normalize(&asset).report);
            return PreparedAsset {
                asset,
                report,
                content_hash: None,
            };
        }

        let normalizer = compress.then(|| self.normalizer.clone());
        let source = asset.clone();
        let work = move || {
            let (asset, report) = match &normalizer {
                Some(n) => {
                    let out = n.normalize(&asset);
                    (out.asset, Some(out.report))
                }
                None => (asset, None),
            };
            let content_hash = attach_hash.then(|| ContentHasher::fingerprint(&asset));
            PreparedAsset {
                asset,
                report,
                content_hash,
            }
        };

        match tokio::task::spawn_blocking(work).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let err = NormalizationError::Worker(e.to_string());
                warn!("压缩线程异常，使用原始文件: {}, 错误: {}", source.name, err);
                let out = AssetNormalizer::fallback_for(&source, &err);
                PreparedAsset {
                    content_hash: attach_hash.then(|| ContentHasher::fingerprint(&out.asset)),
                    report: Some(out.report),
                    asset: out.asset,
                }
            }
        }
    }
}

fn log_compression_summary(job_id: &str, prepared: &[PreparedAsset], faults: usize) {
    let reports: Vec<&NormalizationReport> =
        prepared.iter().filter_map(|p| p.report.as_ref()).collect();
    let original: u64 = reports.iter().map(|r| r.original_size).sum();
    let output: u64 = reports.iter().map(|r| r.output_size).sum();
    let reencoded = reports
        .iter()
        .filter(|r| matches!(r.outcome, NormalizeOutcome::Reencoded { .. }))
        .count();

    let saved = original.saturating_sub(output);
    let saved_percent = if original > 0 {
        saved as f64 * 100.0 / original as f64
    } else {
        0.0
    };

    info!(
        "🔧 压缩统计: job={}, 重新编码 {}/{}, 出错 {}, {} -> {} (节省 {}, {:.1}%)",
        job_id,
        reencoded,
        reports.len(),
        faults,
        format_bytes(original),
        format_bytes(output),
        format_bytes(saved),
        saved_percent
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::uploader::asset::{UploadMetadata, META_FILE_INDEX, META_FILE_NAME};
    use crate::uploader::normalizer::tests::noisy_png;
    use crate::uploader::normalizer::NormalizeConstraints;
    use crate::uploader::testing::MockTransfer;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(UploadJobStatus, u8, NotifyKind)>>,
    }

    impl JobObserver for Recorder {
        fn job_changed(&self, snapshot: &JobSnapshot, kind: NotifyKind) {
            self.events
                .lock()
                .push((snapshot.status, snapshot.progress, kind));
        }
    }

    fn engine(mock: Arc<MockTransfer>, max_output_bytes: u64) -> JobEngine {
        let constraints = NormalizeConstraints {
            max_output_bytes,
            ..Default::default()
        };
        JobEngine::new(
            AssetNormalizer::new(constraints),
            ChunkedTransfer::new(mock, 4),
        )
    }

    fn handle(files: Vec<Asset>) -> Arc<JobHandle> {
        Arc::new(JobHandle::new(
            UploadJob::new("fac-1", "1번 시설", files, UploadMetadata::new().with("category", "before")),
            0,
        ))
    }

    #[tokio::test]
    async fn test_three_small_files_complete_in_one_chunk() {
        let mock = Arc::new(MockTransfer::new().with_delay(Duration::from_millis(10)));
        let engine = engine(mock.clone(), 2 * 1024 * 1024);
        let files: Vec<Asset> = (0..3)
            .map(|i| Asset::new(format!("p{}.jpg", i), "image/jpeg", vec![i as u8; 50 * 1024]))
            .collect();
        let originals = files.clone();
        let handle = handle(files);
        let recorder = Arc::new(Recorder::default());

        engine.run(handle.clone(), recorder.clone()).await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, UploadJobStatus::Completed);
        assert_eq!(snap.progress, 100);
        assert_eq!(snap.success_count(), 3);
        assert_eq!(mock.max_in_flight(), 3);

        // 小于阈值的图片原样传输
        let mut requests = mock.requests();
        requests.sort_by_key(|r| r.file_index);
        for (req, original) in requests.iter().zip(&originals) {
            assert_eq!(req.asset.data, original.data);
            assert_eq!(req.metadata.get("category"), Some("before"));
            assert_eq!(req.metadata.get(META_FILE_NAME), Some(original.name.as_str()));
        }
        assert_eq!(requests[2].metadata.get(META_FILE_INDEX), Some("3"));

        // 通知中的进度单调不减，状态按顺序前进
        let events = recorder.events.lock();
        let progress: Vec<u8> = events.iter().map(|e| e.1).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        let states: Vec<UploadJobStatus> = events
            .iter()
            .filter(|e| e.2 == NotifyKind::StateChanged)
            .map(|e| e.0)
            .collect();
        assert_eq!(
            states,
            vec![
                UploadJobStatus::Normalizing,
                UploadJobStatus::Transferring,
                UploadJobStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_corrupt_image_is_transferred_as_original() {
        let mock = Arc::new(MockTransfer::new());
        let engine = engine(mock.clone(), 64);
        let broken = Asset::new("broken.jpg", "image/jpeg", b"garbage-bytes".repeat(20));
        let good = Asset::new("ok.png", "image/png", noisy_png(120, 120));
        let handle = handle(vec![broken.clone(), good]);

        engine.run(handle.clone(), Arc::new(Recorder::default())).await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, UploadJobStatus::Completed);
        let results = snap.results.unwrap();
        assert!(results[0].normalization.as_ref().unwrap().is_fault());
        assert!(!results[1].normalization.as_ref().unwrap().is_fault());

        let requests = mock.requests();
        let sent = requests.iter().find(|r| r.file_index == 0).unwrap();
        assert_eq!(sent.asset.data, broken.data);
    }

    #[tokio::test]
    async fn test_all_files_fault_fails_job() {
        let mock = Arc::new(MockTransfer::new());
        let engine = engine(mock.clone(), 64);
        let handle = handle(vec![
            Asset::new("a.jpg", "image/jpeg", b"not-an-image".repeat(20)),
            Asset::new("b.jpg", "image/jpeg", b"also-not-an-image".repeat(20)),
        ]);

        engine.run(handle.clone(), Arc::new(Recorder::default())).await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, UploadJobStatus::Failed);
        assert_eq!(snap.error.unwrap().kind, FailureKind::PipelineFault);
        assert!(snap.results.is_none());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_content_hash_attached() {
        let mock = Arc::new(MockTransfer::new());
        let engine = engine(mock.clone(), 2 * 1024 * 1024).with_content_hash(true);
        let asset = Asset::new("doc.pdf", "application/pdf", b"%PDF".to_vec());
        let handle = handle(vec![asset.clone()]);

        engine.run(handle, Arc::new(Recorder::default())).await;

        let requests = mock.requests();
        assert_eq!(
            requests[0].metadata.get(META_CONTENT_HASH),
            Some(ContentHasher::fingerprint(&asset).as_str())
        );
    }

    #[tokio::test]
    async fn test_compression_disabled_sends_original() {
        let mock = Arc::new(MockTransfer::new());
        let engine = engine(mock.clone(), 64).with_compression(false);
        let image = Asset::new("big.png", "image/png", noisy_png(200, 200));
        let handle = handle(vec![image.clone()]);

        engine.run(handle.clone(), Arc::new(Recorder::default())).await;

        let results = handle.snapshot().results.unwrap();
        assert!(results[0].normalization.is_none());
        assert_eq!(mock.requests()[0].asset.data, image.data);
    }

    #[tokio::test]
    async fn test_cancel_abandons_transfers() {
        let mock = Arc::new(MockTransfer::new().with_delay(Duration::from_secs(30)));
        let engine = Arc::new(engine(mock, 2 * 1024 * 1024));
        let handle = handle(vec![Asset::new("a.pdf", "application/pdf", vec![0u8; 10])]);
        let recorder = Arc::new(Recorder::default());

        let task = {
            let engine = engine.clone();
            let handle = handle.clone();
            let recorder = recorder.clone();
            tokio::spawn(async move { engine.run(handle, recorder).await })
        };

        // 等待进入传输阶段
        for _ in 0..100 {
            if handle.status() == UploadJobStatus::Transferring {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.status(), UploadJobStatus::Transferring);

        handle.apply(recorder.as_ref(), NotifyKind::StateChanged, |j| {
            j.mark_failed(JobFailure::canceled())
        });
        handle.cancel_token().cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("driver should stop promptly")
            .unwrap();

        let snap = handle.snapshot();
        assert_eq!(snap.status, UploadJobStatus::Failed);
        assert!(snap.error.unwrap().is_canceled());
        assert!(snap.progress < 100);
        assert!(snap.results.is_none());
    }
}
