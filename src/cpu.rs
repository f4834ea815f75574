//! CPU 使用率采样
//!
//! 使用率以千分比表示（0..=1000），与 `cpu-usage` 响应 header 中的数值一致。
//! 采样在后台按固定周期进行，调用路径上只读取最近一次的结果。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

/// 默认采样周期
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

const PROC_STAT: &str = "/proc/stat";

/// 尚无有效样本
const UNKNOWN: u64 = u64::MAX;

/// CPU 使用率来源
pub trait CpuSampler: Send + Sync {
    /// 当前 CPU 使用率（千分比），不可用时返回 `None`
    fn usage(&self) -> Option<u64>;
}

/// 周期性读取 `/proc/stat`，以相邻两次采样之间的差值计算 CPU 使用率
///
/// 首次调用 `usage` 时在当前 tokio 运行时上启动采样任务，sampler 被丢弃后任务随之退出。
/// 第一个采样周期结束前 `usage` 返回 `None`。
#[derive(Debug, Clone)]
pub struct ProcStatSampler {
    inner: Arc<SamplerState>,
}

#[derive(Debug)]
struct SamplerState {
    usage: AtomicU64,
    interval: Duration,
    started: Once,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            inner: Arc::new(SamplerState {
                usage: AtomicU64::new(UNKNOWN),
                interval,
                started: Once::new(),
            }),
        }
    }

    fn ensure_started(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        self.inner.started.call_once(|| {
            handle.spawn(sample_loop(Arc::downgrade(&self.inner)));
        });
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for ProcStatSampler {
    fn usage(&self) -> Option<u64> {
        self.ensure_started();
        match self.inner.usage.load(Ordering::Relaxed) {
            UNKNOWN => None,
            usage => Some(usage),
        }
    }
}

async fn sample_loop(state: Weak<SamplerState>) {
    let Some(interval) = state.upgrade().map(|state| state.interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut previous = None;

    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            debug!("CPU sampler dropped, stop sampling");
            return;
        };
        let current = match tokio::fs::read_to_string(PROC_STAT).await {
            Ok(content) => parse_proc_stat(&content),
            Err(err) => {
                debug!(?err, "CPU usage unavailable, stop sampling");
                return;
            }
        };
        let Some(current) = current else {
            continue;
        };
        if let Some(usage) = previous.and_then(|previous| usage_between(previous, current)) {
            state.usage.store(usage, Ordering::Relaxed);
        }
        previous = Some(current);
    }
}

/// 解析 `/proc/stat` 首行的汇总 CPU 时间
fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

fn usage_between(previous: CpuTimes, current: CpuTimes) -> Option<u64> {
    let total = current.total.checked_sub(previous.total)?;
    let idle = current.idle.checked_sub(previous.idle)?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(idle)).min(total) * 1000 / total)
}
