//! 指标拦截器

use async_trait::async_trait;
use tokio::time::Instant;
use tonic::Status;

use super::{Interceptor, Next};
use crate::context::CallContext;
use crate::error::outcome_label;
use crate::metrics::MetricsCollector;

/// 指标拦截器
///
/// 服务端以调用方应用名为 peer 标签，客户端以目标地址为 peer 标签。
#[derive(Clone)]
pub struct MetricsInterceptor {
    collector: MetricsCollector,
    service_name: String,
    default_target: String,
}

impl MetricsInterceptor {
    pub fn new(collector: MetricsCollector) -> Self {
        Self {
            collector,
            service_name: String::new(),
            default_target: String::new(),
        }
    }

    /// 客户端指标的服务名与默认目标地址
    pub fn with_client_labels(
        mut self,
        service_name: impl Into<String>,
        default_target: impl Into<String>,
    ) -> Self {
        self.service_name = service_name.into();
        self.default_target = default_target.into();
        self
    }

    fn peer_label(&self, ctx: &CallContext) -> String {
        if ctx.kind().is_server() {
            ctx.peer_app()
        } else {
            ctx.target()
                .filter(|target| !target.is_empty())
                .unwrap_or(&self.default_target)
                .to_string()
        }
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for MetricsInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        let kind = ctx.kind();
        let method = ctx.method().to_string();
        let peer = self.peer_label(&ctx);
        let start = Instant::now();

        let result = next.run(ctx, req).await;

        self.collector.record(
            kind,
            &self.service_name,
            &method,
            &peer,
            outcome_label(result.as_ref().err()),
            start.elapsed().as_secs_f64(),
        );
        result
    }
}
