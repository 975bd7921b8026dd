// 测试用传输原语
//
// 可按文件名配置延迟、固定失败、前 N 次网络错误，并统计并发数

use crate::error::TransferError;
use crate::uploader::transfer::{ProgressCallback, TransferPrimitive, TransferReceipt, TransferRequest};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MockTransfer {
    delay: Duration,
    delays: HashMap<String, Duration>,
    fail_names: HashSet<String>,
    flaky_remaining: DashMap<String, u32>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransferRequest>>,
}

impl MockTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_delay_for(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    /// 该文件总是被存储端拒绝
    pub fn fail_on(mut self, name: &str) -> Self {
        self.fail_names.insert(name.to_string());
        self
    }

    /// 该文件前 times 次返回网络错误
    pub fn flaky(self, name: &str, times: u32) -> Self {
        self.flaky_remaining.insert(name.to_string(), times);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }

    async fn simulate(
        &self,
        request: &TransferRequest,
        on_progress: &ProgressCallback,
    ) -> Result<TransferReceipt, TransferError> {
        let name = &request.asset.name;
        let total = request.asset.size();
        let delay = self.delays.get(name).copied().unwrap_or(self.delay);

        on_progress(total / 2, total);
        if !delay.is_zero() {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(TransferError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(mut remaining) = self.flaky_remaining.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransferError::Network("connection reset".to_string()));
            }
        }

        if self.fail_names.contains(name) {
            return Err(TransferError::Rejected {
                status: Some(500),
                message: format!("rejected {}", name),
            });
        }

        on_progress(total, total);
        Ok(TransferReceipt {
            remote_location: Some(format!("mock/{}/{}", request.entity_id, name)),
            bytes_sent: total,
        })
    }
}

#[async_trait]
impl TransferPrimitive for MockTransfer {
    async fn transfer(
        &self,
        request: TransferRequest,
        on_progress: ProgressCallback,
    ) -> Result<TransferReceipt, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.simulate(&request, &on_progress).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        "mock"
    }
}
