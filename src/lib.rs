//! Flare RPC Interceptor
//!
//! 面向 gRPC 调用的可组合拦截器链，为客户端与服务端的一元/流式调用附加：
//! 指标、分布式追踪、访问日志、panic 恢复、默认超时，以及可配置 header 的透传。
//!
//! ```rust,no_run
//! use flare_rpc_interceptor::{CallContext, CallType, CompositeInterceptor, InterceptorConfig, Metadata, handler_fn};
//!
//! # async fn run() -> Result<(), tonic::Status> {
//! let composite = CompositeInterceptor::new(InterceptorConfig::default().with_app_name("order-svc"));
//! let chain = composite.server_unary::<String, String>();
//!
//! let ctx = CallContext::server(CallType::Unary, "/pkg.Svc/Echo", Metadata::new(), None);
//! let handler = handler_fn(|_ctx: CallContext, req: String| async move { Ok(req) });
//! let _reply = chain.call(ctx, "hello".to_string(), &handler).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod cpu;
pub mod error;
pub mod interceptor;
pub mod logging;
pub mod metrics;
pub mod propagation;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use config::InterceptorConfig;
pub use context::{CallContext, CallDescriptor, CallKind, CallType, Metadata, ResponseHeaders, Side};
pub use cpu::{CpuSampler, ProcStatSampler};
pub use error::{InterceptorError, OutcomeClass, Result};
pub use interceptor::{
    CompositeInterceptor, Handler, Interceptor, InterceptorChain, Next, handler_fn,
};
pub use logging::{AccessRecord, AccessSink, FieldSet, FieldValue, MemorySink, Severity, TracingSink};
pub use metrics::MetricsCollector;
pub use propagation::{HeaderRegistry, PropagatedHeaders, set_propagated_headers};
pub use telemetry::TelemetryConfig;
