//! 指标收集模块
//!
//! 按 {调用类型, 服务名, 方法, 对端/目标, 结果} 记录调用次数与耗时直方图。
//! 指标写入失败只记录 debug 日志，不影响调用本身。

use std::sync::OnceLock;

use parking_lot::Mutex;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::context::{CallKind, Side};
use crate::error::Result;

const SERVER_LABELS: &[&str] = &["type", "method", "peer"];
const CLIENT_LABELS: &[&str] = &["type", "name", "method", "peer"];

/// 耗时直方图的桶（秒）
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();
/// 串行化默认 registry 上的注册，注册与写入 `GLOBAL` 在同一临界区内完成
static GLOBAL_INIT: Mutex<()> = parking_lot::const_mutex(());

/// 指标收集器
///
/// prometheus 的 counter / histogram 内部为原子操作，可被任意并发调用共享。
#[derive(Clone)]
pub struct MetricsCollector {
    pub server_handle_total: IntCounterVec,
    pub server_handle_seconds: HistogramVec,
    pub client_handle_total: IntCounterVec,
    pub client_handle_seconds: HistogramVec,
}

impl MetricsCollector {
    /// 创建收集器并注册到给定 registry
    pub fn new(registry: &Registry) -> Result<Self> {
        let collector = Self::unregistered()?;
        registry.register(Box::new(collector.server_handle_total.clone()))?;
        registry.register(Box::new(collector.server_handle_seconds.clone()))?;
        registry.register(Box::new(collector.client_handle_total.clone()))?;
        registry.register(Box::new(collector.client_handle_seconds.clone()))?;
        Ok(collector)
    }

    /// 创建未注册的收集器
    pub fn unregistered() -> Result<Self> {
        let with_code = |labels: &[&'static str]| {
            let mut labels = labels.to_vec();
            labels.push("code");
            labels
        };

        Ok(Self {
            server_handle_total: IntCounterVec::new(
                Opts::new("flare_server_handle_total", "Total number of handled server calls"),
                &with_code(SERVER_LABELS),
            )?,
            server_handle_seconds: HistogramVec::new(
                HistogramOpts::new("flare_server_handle_seconds", "Server call latency in seconds")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                SERVER_LABELS,
            )?,
            client_handle_total: IntCounterVec::new(
                Opts::new("flare_client_handle_total", "Total number of client calls"),
                &with_code(CLIENT_LABELS),
            )?,
            client_handle_seconds: HistogramVec::new(
                HistogramOpts::new("flare_client_handle_seconds", "Client call latency in seconds")
                    .buckets(LATENCY_BUCKETS.to_vec()),
                CLIENT_LABELS,
            )?,
        })
    }

    /// 进程级收集器，注册到 prometheus 默认 registry
    pub fn global() -> Result<&'static MetricsCollector> {
        if let Some(collector) = GLOBAL.get() {
            return Ok(collector);
        }
        let _init = GLOBAL_INIT.lock();
        if let Some(collector) = GLOBAL.get() {
            return Ok(collector);
        }
        let collector = Self::new(prometheus::default_registry())?;
        Ok(GLOBAL.get_or_init(|| collector))
    }

    /// 记录一次调用
    ///
    /// 服务端调用的 `peer` 为调用方应用名，客户端调用的 `peer` 为目标地址；
    /// `service_name` 仅用于客户端调用。
    pub fn record(
        &self,
        kind: CallKind,
        service_name: &str,
        method: &str,
        peer: &str,
        outcome: &str,
        elapsed_seconds: f64,
    ) {
        let call_type = kind.call_type.as_str();
        let (counter, histogram) = match kind.side {
            Side::Server => (
                self.server_handle_total
                    .get_metric_with_label_values(&[call_type, method, peer, outcome]),
                self.server_handle_seconds
                    .get_metric_with_label_values(&[call_type, method, peer]),
            ),
            Side::Client => (
                self.client_handle_total.get_metric_with_label_values(&[
                    call_type,
                    service_name,
                    method,
                    peer,
                    outcome,
                ]),
                self.client_handle_seconds
                    .get_metric_with_label_values(&[call_type, service_name, method, peer]),
            ),
        };

        match counter {
            Ok(counter) => counter.inc(),
            Err(err) => debug!(?err, method, "Failed to record call counter"),
        }
        match histogram {
            Ok(histogram) => histogram.observe(elapsed_seconds),
            Err(err) => debug!(?err, method, "Failed to record call latency"),
        }
    }
}
