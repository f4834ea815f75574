//! 进程级日志与追踪初始化

use anyhow::Context as _;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 日志输出配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `RUST_LOG` 未设置时使用的过滤规则
    pub level: String,
    /// 以 JSON 格式输出（生产环境）
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 初始化 tracing 订阅者、`log` 桥接与 W3C 追踪上下文传播
///
/// 进程内只能调用一次，重复调用返回错误。
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        tracing::subscriber::set_global_default(registry.with(tracing_subscriber::fmt::layer().json()))
            .context("failed to install json subscriber")?;
    } else {
        tracing::subscriber::set_global_default(registry.with(tracing_subscriber::fmt::layer()))
            .context("failed to install subscriber")?;
    }
    tracing_log::LogTracer::init().context("failed to bridge log records")?;

    global::set_text_map_propagator(TraceContextPropagator::new());
    Ok(())
}
