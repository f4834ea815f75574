use std::fmt::Debug;
use std::sync::Arc;

use opentelemetry::global::BoxedTracer;
use tracing::warn;

use super::logging::render_debug;
use super::{
    AccessLogInterceptor, DeadlineInterceptor, HeaderInterceptor, Interceptor, InterceptorChain,
    MetricsInterceptor, RecoveryInterceptor, TraceInterceptor,
};
use crate::config::InterceptorConfig;
use crate::context::CallKind;
use crate::cpu::{CpuSampler, ProcStatSampler};
use crate::logging::{AccessSink, TracingSink};
use crate::metrics::MetricsCollector;
use crate::propagation::{self, HeaderRegistry};

/// 组合拦截器
///
/// 按固定顺序构建四种调用的拦截器链（由外到内）：
///
/// - 服务端一元/流式：trace → metrics → header → access log → recovery
/// - 客户端一元：trace → metrics → deadline → header → access log
/// - 客户端流式：trace → metrics → header → access log
///
/// trace 与 metrics 可通过配置关闭；其余拦截器总是存在。
pub struct CompositeInterceptor {
    config: Arc<InterceptorConfig>,
    metrics: Option<MetricsCollector>,
    tracer: Option<Arc<BoxedTracer>>,
    sink: Arc<dyn AccessSink>,
    registry: Arc<HeaderRegistry>,
    cpu: Arc<dyn CpuSampler>,
}

impl CompositeInterceptor {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: None,
            tracer: None,
            sink: Arc::new(TracingSink),
            registry: propagation::global(),
            cpu: Arc::new(ProcStatSampler::new()),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    /// 使用指定的指标收集器（默认为进程级收集器）
    pub fn with_metrics(mut self, collector: MetricsCollector) -> Self {
        self.metrics = Some(collector);
        self
    }

    /// 使用指定的 tracer（默认每次调用取全局 tracer）
    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Some(Arc::new(tracer));
        self
    }

    pub fn with_sink(mut self, sink: impl AccessSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// 使用指定的透传 header 注册表（默认为进程级注册表）
    pub fn with_registry(mut self, registry: Arc<HeaderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cpu_sampler(mut self, sampler: impl CpuSampler + 'static) -> Self {
        self.cpu = Arc::new(sampler);
        self
    }

    /// 服务端一元调用链
    pub fn server_unary<Req, Resp>(&self) -> InterceptorChain<Req, Resp>
    where
        Req: Debug + Send + 'static,
        Resp: Debug + Send + 'static,
    {
        let access = self
            .access_log()
            .with_payloads(render_debug::<Req>, render_debug::<Resp>);
        self.build(CallKind::SERVER_UNARY, access)
    }

    /// 服务端流式调用链，`Req` 为服务端流对象
    pub fn server_stream<Req, Resp>(&self) -> InterceptorChain<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.build(CallKind::SERVER_STREAM, self.access_log())
    }

    /// 客户端一元调用链
    pub fn client_unary<Req, Resp>(&self) -> InterceptorChain<Req, Resp>
    where
        Req: Debug + Send + 'static,
        Resp: Debug + Send + 'static,
    {
        let access = self
            .access_log()
            .with_payloads(render_debug::<Req>, render_debug::<Resp>);
        self.build(CallKind::CLIENT_UNARY, access)
    }

    /// 客户端流式调用链，`Resp` 为客户端流对象
    pub fn client_stream<Req, Resp>(&self) -> InterceptorChain<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.build(CallKind::CLIENT_STREAM, self.access_log())
    }

    fn access_log<Req, Resp>(&self) -> AccessLogInterceptor<Req, Resp> {
        AccessLogInterceptor::new(self.config.clone(), self.registry.clone(), self.sink.clone())
    }

    fn metrics_interceptor(&self) -> Option<MetricsInterceptor> {
        let collector = match &self.metrics {
            Some(collector) => collector.clone(),
            None => match MetricsCollector::global() {
                Ok(collector) => collector.clone(),
                Err(err) => {
                    warn!(?err, "Metrics interceptor disabled: collector unavailable");
                    return None;
                }
            },
        };
        Some(
            MetricsInterceptor::new(collector)
                .with_client_labels(&self.config.service_name, &self.config.target),
        )
    }

    fn build<Req, Resp>(
        &self,
        kind: CallKind,
        access: AccessLogInterceptor<Req, Resp>,
    ) -> InterceptorChain<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let mut chain: Vec<Arc<dyn Interceptor<Req, Resp>>> = Vec::with_capacity(6);

        if self.config.enable_trace_interceptor {
            let trace = match &self.tracer {
                Some(tracer) => TraceInterceptor::with_tracer(tracer.clone()),
                None => TraceInterceptor::new(),
            };
            chain.push(Arc::new(trace));
        }
        if self.config.enable_metric_interceptor {
            if let Some(metrics) = self.metrics_interceptor() {
                chain.push(Arc::new(metrics));
            }
        }
        if kind == CallKind::CLIENT_UNARY {
            chain.push(Arc::new(DeadlineInterceptor::new(self.config.read_timeout())));
        }
        chain.push(Arc::new(
            HeaderInterceptor::new(self.registry.clone(), &self.config.app_name, self.cpu.clone())
                .with_cpu_usage_request(self.config.enable_cpu_usage),
        ));
        chain.push(Arc::new(access));
        if kind.is_server() {
            chain.push(Arc::new(RecoveryInterceptor::new()));
        }

        InterceptorChain::new(kind, chain)
    }
}

impl Default for CompositeInterceptor {
    fn default() -> Self {
        Self::new(InterceptorConfig::default())
    }
}
