//! 进度总线
//!
//! - 任务监听者：按任务 ID 注册，接收该任务的快照
//! - 全局监听者：接收队列统计
//!
//! 通知是同步的；监听者 panic 会被捕获并记录，不会影响调度器

use crate::events::types::QueueStats;
use crate::uploader::job::JobSnapshot;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// 任务监听者
pub type JobListener = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;
/// 全局监听者
pub type GlobalListener = Arc<dyn Fn(&QueueStats) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    job_listeners: DashMap<String, Vec<(u64, JobListener)>>,
    global_listeners: RwLock<Vec<(u64, GlobalListener)>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, target: &SubscriptionTarget, id: u64) {
        match target {
            SubscriptionTarget::Job(job_id) => {
                let now_empty = match self.job_listeners.get_mut(job_id) {
                    Some(mut listeners) => {
                        listeners.retain(|(lid, _)| *lid != id);
                        listeners.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.job_listeners
                        .remove_if(job_id, |_, listeners| listeners.is_empty());
                }
            }
            SubscriptionTarget::Global => {
                self.global_listeners.write().retain(|(lid, _)| *lid != id);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum SubscriptionTarget {
    Job(String),
    Global,
}

/// 订阅句柄
///
/// drop 不会取消订阅，需要显式调用 `unsubscribe()`
pub struct Subscription {
    bus: Weak<BusInner>,
    target: SubscriptionTarget,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// 取消订阅（可重复调用）
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.target, self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// 进度总线
#[derive(Clone, Default)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscription(&self, target: SubscriptionTarget, id: u64) -> Subscription {
        Subscription {
            bus: Arc::downgrade(&self.inner),
            target,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// 注册任务监听者
    pub fn subscribe(&self, job_id: &str, listener: JobListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .job_listeners
            .entry(job_id.to_string())
            .or_default()
            .push((id, listener));
        self.subscription(SubscriptionTarget::Job(job_id.to_string()), id)
    }

    /// 注册全局监听者
    pub fn subscribe_global(&self, listener: GlobalListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.global_listeners.write().push((id, listener));
        self.subscription(SubscriptionTarget::Global, id)
    }

    /// 推送任务快照
    pub fn notify(&self, snapshot: &JobSnapshot) {
        // 先复制出监听者列表，回调期间不持有 DashMap 的锁
        let listeners: Vec<JobListener> = match self.inner.job_listeners.get(&snapshot.id) {
            Some(entry) => entry.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                warn!("任务监听者 panic: job={}", snapshot.id);
            }
        }
    }

    /// 推送队列统计
    pub fn notify_global(&self, stats: &QueueStats) {
        let listeners: Vec<GlobalListener> = self
            .inner
            .global_listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(stats))).is_err() {
                warn!("全局监听者 panic");
            }
        }
    }

    /// 移除某个任务的全部监听者
    pub fn remove_job(&self, job_id: &str) {
        self.inner.job_listeners.remove(job_id);
    }

    pub fn job_listener_count(&self, job_id: &str) -> usize {
        self.inner
            .job_listeners
            .get(job_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn global_listener_count(&self) -> usize {
        self.inner.global_listeners.read().len()
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("jobs_with_listeners", &self.inner.job_listeners.len())
            .field("global_listeners", &self.global_listener_count())
            .finish()
    }
}
