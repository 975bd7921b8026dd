// 上传调度器
//
// 职责：
// - 维护 等待 / 活跃 / 已结束 三个集合（同一把锁，迁移是原子的）
// - 准入：每次准入前重新估算并发上限，优先文件数最少的任务（相同时先入队者优先）
// - 活跃数达到上限时等待：任一任务结束或 admission_retry 到期后重试
// - 每个任务由一个驱动 task 执行，panic 会被转成任务级故障
// - 取消 / 关闭 / 订阅 / 统计

use crate::config::{UploadConfig, MAX_CONCURRENT_JOBS, MIN_CONCURRENT_JOBS};
use crate::error::{JobFailure, PipelineError};
use crate::events::{
    GlobalListener, JobListener, NotifyKind, ProgressBus, ProgressThrottler, QueueStats,
    Subscription,
};
use crate::uploader::asset::{Asset, UploadMetadata};
use crate::uploader::chunk::ChunkedTransfer;
use crate::uploader::engine::{JobEngine, JobHandle, JobObserver};
use crate::uploader::estimator::{
    ConcurrencyEstimator, NetworkQualitySource, StaticQuality, ThroughputMonitor,
};
use crate::uploader::job::{JobSnapshot, UploadJob};
use crate::uploader::normalizer::{AssetNormalizer, NormalizeConstraints};
use crate::uploader::sink::CompletionSink;
use crate::uploader::transfer::TransferPrimitive;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 等待队列中的条目
#[derive(Debug, Clone)]
struct QueuedEntry {
    id: String,
    file_count: usize,
}

/// 三个集合，任务 ID 只会出现在其中一个
#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<QueuedEntry>,
    active: HashSet<String>,
    finished: Vec<String>,
}

impl QueueState {
    /// 文件数最少的等待任务（相同时取最早入队的）
    fn next_candidate(&self) -> Option<usize> {
        self.waiting
            .iter()
            .enumerate()
            .min_by_key(|(pos, entry)| (entry.file_count, *pos))
            .map(|(pos, _)| pos)
    }
}

struct SchedulerInner {
    jobs: DashMap<String, Arc<JobHandle>>,
    queue: Mutex<QueueState>,
    wakeup: Notify,
    bus: ProgressBus,
    estimator: ConcurrencyEstimator,
    engine: Arc<JobEngine>,
    /// 并发任务数上限（1-8）
    max_concurrent_jobs: AtomicUsize,
    /// 最近一次准入时采样的上限
    last_ceiling: AtomicUsize,
    admission_retry: Duration,
    progress_throttle_ms: u64,
    global_throttler: ProgressThrottler,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl JobObserver for SchedulerInner {
    fn job_changed(&self, snapshot: &JobSnapshot, kind: NotifyKind) {
        self.bus.notify(snapshot);

        if self.bus.global_listener_count() == 0 {
            return;
        }
        if !kind.is_throttled() || self.global_throttler.should_emit() {
            self.bus.notify_global(&self.stats());
        }
    }
}

impl SchedulerInner {
    fn stats(&self) -> QueueStats {
        let handles: Vec<Arc<JobHandle>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        QueueStats::collect(handles.iter().map(|h| h.lock_read()))
    }

    fn handle(&self, job_id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.get(job_id).map(|h| h.value().clone())
    }

    /// 当前并发上限：网络估算值与配置上限取较小者
    fn ceiling(&self) -> usize {
        let estimate = self.estimator.estimate();
        let cap = self.max_concurrent_jobs.load(Ordering::SeqCst);
        estimate.min(cap).max(1)
    }

    /// 在容量允许时准入等待中的任务
    fn admit_ready(self: &Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            // 每次准入都重新采样
            let ceiling = self.ceiling();
            let previous = self.last_ceiling.swap(ceiling, Ordering::SeqCst);
            if previous != ceiling {
                debug!("并发上限变化: {} -> {}", previous, ceiling);
            }

            let entry = {
                let mut queue = self.queue.lock();
                if queue.waiting.is_empty() {
                    return;
                }
                if queue.active.len() >= ceiling {
                    debug!(
                        "活跃任务已达上限 ({}/{}), 等待 {} 个任务",
                        queue.active.len(),
                        ceiling,
                        queue.waiting.len()
                    );
                    return;
                }
                let entry = match queue.next_candidate().and_then(|pos| queue.waiting.remove(pos)) {
                    Some(entry) => entry,
                    None => return,
                };
                queue.active.insert(entry.id.clone());
                entry
            };

            match self.handle(&entry.id) {
                Some(handle) => {
                    info!(
                        "准入上传任务: job={}, 文件数={}, 并发上限={}",
                        entry.id, entry.file_count, ceiling
                    );
                    self.spawn_driver(handle);
                }
                None => {
                    warn!("等待队列中的任务已不存在: {}", entry.id);
                    self.queue.lock().active.remove(&entry.id);
                }
            }
        }
    }

    /// 启动任务驱动，并监督其退出
    fn spawn_driver(self: &Arc<Self>, handle: Arc<JobHandle>) {
        let inner = self.clone();
        self.engine.tasks().spawn(async move {
            let job_id = handle.id();

            let driver = {
                let engine = inner.engine.clone();
                let handle = handle.clone();
                let observer: Arc<dyn JobObserver> = inner.clone();
                tokio::spawn(async move { engine.run(handle, observer).await })
            };

            if let Err(e) = driver.await {
                if e.is_panic() {
                    error!("任务驱动 panic: job={}", job_id);
                } else {
                    warn!("任务驱动被中止: job={}", job_id);
                }
            }

            // 驱动退出时仍未终止的任务（panic / 被中止）标记为流水线故障
            if !handle.status().is_terminal() {
                handle.apply(inner.as_ref(), NotifyKind::StateChanged, |j| {
                    j.mark_failed(JobFailure::fault("任务驱动异常退出"))
                });
            }

            inner.finish(&job_id);
        });
    }

    /// 活跃 -> 已结束
    fn finish(&self, job_id: &str) {
        {
            let mut queue = self.queue.lock();
            if queue.active.remove(job_id) {
                queue.finished.push(job_id.to_string());
            }
        }
        self.wakeup.notify_one();
    }
}

/// 准入协调循环
///
/// 只持有弱引用，调度器全部句柄释放后自动退出
async fn run_coordinator(inner: Weak<SchedulerInner>) {
    loop {
        let Some(scheduler) = inner.upgrade() else {
            break;
        };

        scheduler.admit_ready();

        tokio::select! {
            _ = scheduler.shutdown.cancelled() => break,
            _ = scheduler.wakeup.notified() => {}
            _ = tokio::time::sleep(scheduler.admission_retry) => {}
        }
    }
    debug!("上传调度协调循环已退出");
}

/// 调度器构建器
pub struct SchedulerBuilder {
    primitive: Arc<dyn TransferPrimitive>,
    upload: UploadConfig,
    constraints: NormalizeConstraints,
    quality: Option<Arc<dyn NetworkQualitySource>>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, upload: &UploadConfig) -> Self {
        self.upload = upload.clone();
        self
    }

    pub fn normalize(mut self, constraints: NormalizeConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// 指定网络质量信号源（默认按实测吞吐估算）
    pub fn quality_source(mut self, source: Arc<dyn NetworkQualitySource>) -> Self {
        self.quality = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 构建并启动调度器（需要在 tokio 运行时内调用）
    pub fn build(self) -> UploadScheduler {
        let upload = self.upload;
        let monitor = Arc::new(ThroughputMonitor::new());

        let quality: Arc<dyn NetworkQualitySource> = match (self.quality, upload.assumed_bandwidth()) {
            (Some(source), _) => source,
            (None, Some(class)) => Arc::new(StaticQuality(Some(class))),
            (None, None) => monitor.clone(),
        };

        let transfer = ChunkedTransfer::new(self.primitive, upload.chunk_size)
            .with_max_retries(upload.max_retries)
            .with_monitor(monitor);

        let mut engine = JobEngine::new(AssetNormalizer::new(self.constraints), transfer)
            .with_compression(upload.compression_enabled)
            .with_content_hash(upload.attach_content_hash);
        if let Some(sink) = self.sink {
            engine = engine.with_sink(sink);
        }

        let max_jobs = upload
            .max_concurrent_jobs
            .clamp(MIN_CONCURRENT_JOBS, MAX_CONCURRENT_JOBS);

        let inner = Arc::new(SchedulerInner {
            jobs: DashMap::new(),
            queue: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            bus: ProgressBus::new(),
            estimator: ConcurrencyEstimator::new(quality, upload.default_concurrency),
            engine: Arc::new(engine),
            max_concurrent_jobs: AtomicUsize::new(max_jobs),
            last_ceiling: AtomicUsize::new(0),
            admission_retry: Duration::from_millis(upload.admission_retry_ms.max(1)),
            progress_throttle_ms: upload.progress_throttle_ms,
            global_throttler: ProgressThrottler::with_millis(upload.progress_throttle_ms),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_coordinator(Arc::downgrade(&inner)));

        info!(
            "上传调度器已启动: 块大小={}, 并发上限={}, 默认并发={}, 压缩={}",
            upload.chunk_size, max_jobs, upload.default_concurrency, upload.compression_enabled
        );

        UploadScheduler { inner }
    }
}

/// 上传调度器
///
/// 克隆得到的是同一个调度器的句柄
#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<SchedulerInner>,
}

impl UploadScheduler {
    pub fn builder(primitive: Arc<dyn TransferPrimitive>) -> SchedulerBuilder {
        SchedulerBuilder {
            primitive,
            upload: UploadConfig::default(),
            constraints: NormalizeConstraints::default(),
            quality: None,
            sink: None,
        }
    }

    /// 使用默认配置创建
    pub fn new(primitive: Arc<dyn TransferPrimitive>) -> Self {
        Self::builder(primitive).build()
    }

    /// 提交上传任务
    ///
    /// 同步返回任务 ID，不等待任何 I/O
    pub fn enqueue(
        &self,
        entity_id: &str,
        entity_label: &str,
        files: Vec<Asset>,
        metadata: UploadMetadata,
    ) -> Result<String, PipelineError> {
        if entity_id.trim().is_empty() {
            return Err(PipelineError::InvalidJob("缺少实体 ID".to_string()));
        }
        if files.is_empty() {
            return Err(PipelineError::InvalidJob("文件列表为空".to_string()));
        }
        if let Some(pos) = files.iter().position(|f| f.name.trim().is_empty()) {
            return Err(PipelineError::InvalidJob(format!(
                "第 {} 个文件缺少文件名",
                pos + 1
            )));
        }

        let job = UploadJob::new(entity_id, entity_label, files, metadata);
        let job_id = job.id.clone();
        let file_count = job.file_count();
        let handle = Arc::new(JobHandle::new(job, self.inner.progress_throttle_ms));

        {
            let mut queue = self.inner.queue.lock();
            // 与 close() 在同一把锁下检查，避免关闭后入队
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(PipelineError::Closed);
            }
            self.inner.jobs.insert(job_id.clone(), handle.clone());
            queue.waiting.push_back(QueuedEntry {
                id: job_id.clone(),
                file_count,
            });
        }

        info!(
            "上传任务已入队: job={}, entity={} ({}), 文件数={}",
            job_id, entity_label, entity_id, file_count
        );

        self.inner
            .job_changed(&handle.snapshot(), NotifyKind::StateChanged);
        self.inner.wakeup.notify_one();

        Ok(job_id)
    }

    /// 取消任务
    ///
    /// 任务不存在或已终止时返回 false
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(handle) = self.inner.handle(job_id) else {
            return false;
        };

        // 排队中的任务直接移到已结束集合
        {
            let mut queue = self.inner.queue.lock();
            if let Some(pos) = queue.waiting.iter().position(|e| e.id == job_id) {
                queue.waiting.remove(pos);
                queue.finished.push(job_id.to_string());
            }
        }

        let changed = handle.apply(self.inner.as_ref(), NotifyKind::StateChanged, |j| {
            j.mark_failed(JobFailure::canceled())
        });
        handle.cancel_token().cancel();

        if changed {
            info!("上传任务已取消: job={}", job_id);
        }
        changed
    }

    /// 订阅任务快照，订阅时立即收到当前快照
    pub fn subscribe(&self, job_id: &str, listener: JobListener) -> Subscription {
        match self.inner.handle(job_id) {
            Some(handle) => handle.with_emit_lock(|| {
                let subscription = self.inner.bus.subscribe(job_id, listener.clone());
                let snapshot = handle.snapshot();
                if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                    warn!("任务监听者 panic: job={}", job_id);
                }
                subscription
            }),
            None => self.inner.bus.subscribe(job_id, listener),
        }
    }

    /// 订阅队列统计，订阅时立即收到当前统计
    pub fn subscribe_global(&self, listener: GlobalListener) -> Subscription {
        let subscription = self.inner.bus.subscribe_global(listener.clone());
        let stats = self.stats();
        if catch_unwind(AssertUnwindSafe(|| listener(&stats))).is_err() {
            warn!("全局监听者 panic");
        }
        subscription
    }

    /// 以 channel 方式接收任务快照，任务终止后 channel 关闭
    pub fn watch(&self, job_id: &str) -> mpsc::UnboundedReceiver<JobSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.handle(job_id).is_none() {
            return rx;
        }

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_listener = slot.clone();
        let subscription = self.subscribe(
            job_id,
            Arc::new(move |snapshot: &JobSnapshot| {
                let receiver_gone = tx.send(snapshot.clone()).is_err();
                if receiver_gone || snapshot.is_terminal() {
                    if let Some(sub) = slot_in_listener.lock().take() {
                        sub.unsubscribe();
                    }
                }
            }),
        );

        // 订阅时任务已经终止：监听者已收到最终快照，直接取消订阅
        let terminal = self
            .inner
            .handle(job_id)
            .map(|h| h.status().is_terminal())
            .unwrap_or(true);
        if terminal {
            subscription.unsubscribe();
        } else {
            *slot.lock() = Some(subscription);
            // 存入前任务恰好终止的情况
            if self
                .inner
                .handle(job_id)
                .map(|h| h.status().is_terminal())
                .unwrap_or(true)
            {
                if let Some(sub) = slot.lock().take() {
                    sub.unsubscribe();
                }
            }
        }

        rx
    }

    /// 等待任务终止，返回最终快照；任务不存在时返回 None
    pub async fn wait_for(&self, job_id: &str) -> Option<JobSnapshot> {
        let mut rx = self.watch(job_id);
        while let Some(snapshot) = rx.recv().await {
            if snapshot.is_terminal() {
                return Some(snapshot);
            }
        }
        // channel 提前关闭（任务被清理）时返回当前快照
        self.job(job_id).filter(|s| s.is_terminal())
    }

    /// 队列统计
    pub fn stats(&self) -> QueueStats {
        self.inner.stats()
    }

    /// 任务快照
    pub fn job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.handle(job_id).map(|h| h.snapshot())
    }

    /// 全部任务快照（按入队时间排序）
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> =
            self.inner.jobs.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// 运行期修改并发任务数上限（1-8），超出范围返回 false
    pub fn set_max_concurrency(&self, max: usize) -> bool {
        if !(MIN_CONCURRENT_JOBS..=MAX_CONCURRENT_JOBS).contains(&max) {
            warn!("无效的并发任务数上限: {}", max);
            return false;
        }
        let old = self.inner.max_concurrent_jobs.swap(max, Ordering::SeqCst);
        info!("并发任务数上限: {} -> {}", old, max);
        self.inner.wakeup.notify_one();
        true
    }

    /// 运行期开关图片压缩，只影响之后开始的任务
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.inner.engine.set_compression_enabled(enabled);
        info!("图片压缩已{}", if enabled { "启用" } else { "关闭" });
    }

    /// 当前并发上限（网络估算值与配置上限的较小者）
    pub fn concurrency_ceiling(&self) -> usize {
        self.inner.ceiling()
    }

    pub fn active_count(&self) -> usize {
        self.inner.queue.lock().active.len()
    }

    /// 清除已结束的任务，返回清除数量
    pub fn clear_finished(&self) -> usize {
        let finished = std::mem::take(&mut self.inner.queue.lock().finished);
        for job_id in &finished {
            self.inner.jobs.remove(job_id);
            self.inner.bus.remove_job(job_id);
        }
        if !finished.is_empty() {
            info!("清除了 {} 个已结束的上传任务", finished.len());
            self.inner
                .bus
                .notify_global(&self.inner.stats());
        }
        finished.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// 关闭调度器
    ///
    /// 不再接受新任务；排队和处理中的任务以流水线故障结束
    pub fn close(&self) {
        let (waiting, active) = {
            let mut queue = self.inner.queue.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let waiting: Vec<String> = queue.waiting.drain(..).map(|e| e.id).collect();
            queue.finished.extend(waiting.iter().cloned());
            let active: Vec<String> = queue.active.iter().cloned().collect();
            (waiting, active)
        };

        for job_id in waiting.iter().chain(active.iter()) {
            if let Some(handle) = self.inner.handle(job_id) {
                handle.apply(self.inner.as_ref(), NotifyKind::StateChanged, |j| {
                    j.mark_failed(JobFailure::fault("调度器已关闭"))
                });
                handle.cancel_token().cancel();
            }
        }

        self.inner.shutdown.cancel();
        info!(
            "上传调度器已关闭: 中止排队任务 {} 个, 处理中任务 {} 个",
            waiting.len(),
            active.len()
        );
    }

    /// 关闭调度器并等待后台任务退出
    ///
    /// 返回时所有任务驱动都已退出，已完成任务的 CompletionSink 回调都已执行完毕
    pub async fn shutdown(&self) {
        self.close();
        let tasks = self.inner.engine.tasks();
        tasks.close();
        tasks.wait().await;
        debug!("上传调度器后台任务已全部退出");
    }
}

impl std::fmt::Debug for UploadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadScheduler")
            .field("jobs", &self.inner.jobs.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
