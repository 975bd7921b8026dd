//! 进度通知节流器
//!
//! 控制单个任务进度通知的频率，状态变更不经过节流

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;

/// 进度通知节流器
///
/// 使用原子操作，多个文件的进度回调可以并发调用 `should_emit()`
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布的时间戳（纳秒，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now_nanos = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now_nanos.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 进程内单调时钟（纳秒，从 1 开始）
    fn current_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        (start.elapsed().as_nanos() as u64).max(1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);

        // 第一次总是发布
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);
        assert!(throttler.should_emit());

        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let throttler = ProgressThrottler::with_millis(0);
        for _ in 0..10 {
            // 同一纳秒内的 CAS 也会成功（值相同）
            assert!(throttler.should_emit());
        }
    }

    #[test]
    fn test_concurrent_callers_emit_once() {
        let throttler = Arc::new(ProgressThrottler::with_millis(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = throttler.clone();
                thread::spawn(move || t.should_emit())
            })
            .collect();

        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|e| *e)
            .count();
        assert_eq!(emitted, 1);
    }
}
