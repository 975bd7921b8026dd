// 并发度估算
//
// 根据网络质量信号给出建议的任务并发数：
// - High (4g)          -> 6
// - Standard (3g)      -> 4
// - Constrained (2g)   -> 3
// - Minimal (slow-2g)  -> 2
// - 无信号             -> 配置的默认值
//
// 每次准入前重新计算，不做缓存；只影响新准入的任务

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 默认并发数（无网络信号时）
pub const DEFAULT_CONCURRENCY: usize = 4;

/// EWMA 平滑系数（新样本权重）
const EWMA_ALPHA: f64 = 0.3;

/// 开始分级前需要的最少样本数
const MIN_SAMPLES: u32 = 3;

/// 带宽分级阈值（kbps），与浏览器 effectiveType 的划分一致
const SLOW_2G_MAX_KBPS: f64 = 50.0;
const TWO_G_MAX_KBPS: f64 = 70.0;
const THREE_G_MAX_KBPS: f64 = 700.0;

/// 带宽等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthClass {
    Minimal,
    Constrained,
    Standard,
    High,
}

impl BandwidthClass {
    /// 建议的并发数
    pub fn recommended_concurrency(&self) -> usize {
        match self {
            BandwidthClass::High => 6,
            BandwidthClass::Standard => 4,
            BandwidthClass::Constrained => 3,
            BandwidthClass::Minimal => 2,
        }
    }

    /// 从 effectiveType 字符串解析（"4g" / "3g" / "2g" / "slow-2g"）
    pub fn from_effective_type(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "4g" | "wifi" | "ethernet" => Some(BandwidthClass::High),
            "3g" => Some(BandwidthClass::Standard),
            "2g" => Some(BandwidthClass::Constrained),
            "slow-2g" => Some(BandwidthClass::Minimal),
            _ => None,
        }
    }

    /// 按实测吞吐分级
    pub fn from_kbps(kbps: f64) -> Self {
        if kbps < SLOW_2G_MAX_KBPS {
            BandwidthClass::Minimal
        } else if kbps < TWO_G_MAX_KBPS {
            BandwidthClass::Constrained
        } else if kbps < THREE_G_MAX_KBPS {
            BandwidthClass::Standard
        } else {
            BandwidthClass::High
        }
    }
}

/// 网络质量信号源
pub trait NetworkQualitySource: Send + Sync {
    /// 当前带宽等级，无信号时返回 None
    fn bandwidth_class(&self) -> Option<BandwidthClass>;
}

/// 固定信号
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticQuality(pub Option<BandwidthClass>);

impl NetworkQualitySource for StaticQuality {
    fn bandwidth_class(&self) -> Option<BandwidthClass> {
        self.0
    }
}

/// 外部可更新的信号（例如由宿主程序定期写入）
#[derive(Debug, Clone, Default)]
pub struct SharedQuality {
    inner: Arc<RwLock<Option<BandwidthClass>>>,
}

impl SharedQuality {
    pub fn new(initial: Option<BandwidthClass>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn set(&self, class: Option<BandwidthClass>) {
        *self.inner.write() = class;
    }

    /// 按 effectiveType 字符串更新，无法识别时清空信号
    pub fn set_effective_type(&self, value: &str) {
        self.set(BandwidthClass::from_effective_type(value));
    }
}

impl NetworkQualitySource for SharedQuality {
    fn bandwidth_class(&self) -> Option<BandwidthClass> {
        *self.inner.read()
    }
}

#[derive(Debug, Default)]
struct ThroughputState {
    ewma_kbps: f64,
    samples: u32,
}

/// 基于实测传输速度的信号源
///
/// 每个文件传输完成后记录一次 (字节数, 耗时)，EWMA 平滑后分级
#[derive(Debug, Default)]
pub struct ThroughputMonitor {
    state: Mutex<ThroughputState>,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次传输
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if bytes == 0 || secs <= 0.0 {
            return;
        }
        let kbps = bytes as f64 * 8.0 / 1000.0 / secs;

        let mut state = self.state.lock();
        state.ewma_kbps = if state.samples == 0 {
            kbps
        } else {
            EWMA_ALPHA * kbps + (1.0 - EWMA_ALPHA) * state.ewma_kbps
        };
        state.samples = state.samples.saturating_add(1);

        debug!(
            "吞吐采样: {:.1} kbps, EWMA {:.1} kbps ({} 个样本)",
            kbps, state.ewma_kbps, state.samples
        );
    }

    /// 平滑后的吞吐（kbps），样本不足时返回 None
    pub fn ewma_kbps(&self) -> Option<f64> {
        let state = self.state.lock();
        (state.samples >= MIN_SAMPLES).then_some(state.ewma_kbps)
    }

    pub fn sample_count(&self) -> u32 {
        self.state.lock().samples
    }
}

impl NetworkQualitySource for ThroughputMonitor {
    fn bandwidth_class(&self) -> Option<BandwidthClass> {
        self.ewma_kbps().map(BandwidthClass::from_kbps)
    }
}

/// 并发度估算器
#[derive(Clone)]
pub struct ConcurrencyEstimator {
    source: Arc<dyn NetworkQualitySource>,
    default_concurrency: usize,
}

impl ConcurrencyEstimator {
    pub fn new(source: Arc<dyn NetworkQualitySource>, default_concurrency: usize) -> Self {
        Self {
            source,
            default_concurrency: default_concurrency.max(1),
        }
    }

    /// 当前建议并发数（>= 1）
    pub fn estimate(&self) -> usize {
        self.source
            .bandwidth_class()
            .map(|c| c.recommended_concurrency())
            .unwrap_or(self.default_concurrency)
    }
}

impl std::fmt::Debug for ConcurrencyEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyEstimator")
            .field("class", &self.source.bandwidth_class())
            .field("default_concurrency", &self.default_concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_better_network_never_lowers_concurrency() {
        let ordered = [
            BandwidthClass::Minimal,
            BandwidthClass::Constrained,
            BandwidthClass::Standard,
            BandwidthClass::High,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].recommended_concurrency() <= pair[1].recommended_concurrency());
        }
    }

    #[test]
    fn test_effective_type_parsing() {
        assert_eq!(BandwidthClass::from_effective_type("4g"), Some(BandwidthClass::High));
        assert_eq!(BandwidthClass::from_effective_type(" 3G "), Some(BandwidthClass::Standard));
        assert_eq!(
            BandwidthClass::from_effective_type("slow-2g"),
            Some(BandwidthClass::Minimal)
        );
        assert_eq!(BandwidthClass::from_effective_type("unknown"), None);
    }

    #[test]
    fn test_no_signal_uses_default() {
        let estimator = ConcurrencyEstimator::new(Arc::new(StaticQuality(None)), 4);
        assert_eq!(estimator.estimate(), 4);
        // 默认值下限为 1
        let estimator = ConcurrencyEstimator::new(Arc::new(StaticQuality(None)), 0);
        assert_eq!(estimator.estimate(), 1);
    }

    #[test]
    fn test_shared_quality_updates_estimate() {
        let shared = SharedQuality::new(None);
        let estimator = ConcurrencyEstimator::new(Arc::new(shared.clone()), 4);
        assert_eq!(estimator.estimate(), 4);

        shared.set_effective_type("4g");
        assert_eq!(estimator.estimate(), 6);

        shared.set_effective_type("slow-2g");
        assert_eq!(estimator.estimate(), 2);

        shared.set(None);
        assert_eq!(estimator.estimate(), 4);
    }

    #[test]
    fn test_throughput_monitor_needs_samples() {
        let monitor = ThroughputMonitor::new();
        // 1 MB/s = 8000 kbps
        monitor.record(1_000_000, Duration::from_secs(1));
        monitor.record(1_000_000, Duration::from_secs(1));
        assert_eq!(monitor.bandwidth_class(), None);

        monitor.record(1_000_000, Duration::from_secs(1));
        assert_eq!(monitor.bandwidth_class(), Some(BandwidthClass::High));

        // 零耗时样本被忽略
        monitor.record(10, Duration::ZERO);
        assert_eq!(monitor.sample_count(), 3);
    }

    #[test]
    fn test_throughput_monitor_degrades() {
        let monitor = ThroughputMonitor::new();
        // 4 KB/s = 32 kbps
        for _ in 0..MIN_SAMPLES {
            monitor.record(4_000, Duration::from_secs(1));
        }
        assert_eq!(monitor.bandwidth_class(), Some(BandwidthClass::Minimal));

        let estimator = ConcurrencyEstimator::new(Arc::new(monitor), 4);
        assert_eq!(estimator.estimate(), 2);
    }
}
