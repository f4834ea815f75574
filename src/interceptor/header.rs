//! header 透传与 CPU 负载信号
//!
//! - 服务端：把已注册的透传 header 从 incoming metadata 写入上下文值；
//!   调用方请求 CPU 负载且采样值大于 0 时，在响应 header 中附带 `cpu-usage`。
//! - 客户端：把已注册 header 的上下文值（缺失时取 incoming metadata）写入 outgoing metadata，
//!   并附带本进程的 `app`，按配置附带 `enable-cpu-usage: true`。

use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;
use tracing::error;

use super::{Interceptor, Next};
use crate::context::{APP_HEADER, CPU_USAGE_HEADER, CallContext, ENABLE_CPU_USAGE_HEADER};
use crate::cpu::CpuSampler;
use crate::propagation::HeaderRegistry;

/// header 拦截器
#[derive(Clone)]
pub struct HeaderInterceptor {
    registry: Arc<HeaderRegistry>,
    app_name: String,
    request_cpu_usage: bool,
    cpu: Arc<dyn CpuSampler>,
}

impl HeaderInterceptor {
    pub fn new(registry: Arc<HeaderRegistry>, app_name: impl Into<String>, cpu: Arc<dyn CpuSampler>) -> Self {
        Self {
            registry,
            app_name: app_name.into(),
            request_cpu_usage: false,
            cpu,
        }
    }

    /// 客户端是否向服务端请求 CPU 负载
    pub fn with_cpu_usage_request(mut self, enable: bool) -> Self {
        self.request_cpu_usage = enable;
        self
    }

    fn inbound(&self, mut ctx: CallContext) -> CallContext {
        let headers = self.registry.snapshot();
        for key in headers.iter() {
            if let Some(value) = ctx.incoming().get(key).map(str::to_string) {
                ctx = ctx.with_value(key, value);
            }
        }

        if ctx.incoming().get(ENABLE_CPU_USAGE_HEADER) == Some("true") {
            if let Some(usage) = self.cpu.usage().filter(|usage| *usage > 0) {
                if let Err(err) = ctx
                    .response_headers()
                    .set(CPU_USAGE_HEADER, &usage.to_string())
                {
                    error!(?err, method = %ctx.method(), "Failed to set cpu usage header");
                }
            }
        }
        ctx
    }

    fn outbound(&self, mut ctx: CallContext) -> CallContext {
        let headers = self.registry.snapshot();
        for key in headers.iter() {
            if ctx.value(key).is_none() {
                if let Some(value) = ctx.incoming().get(key).map(str::to_string) {
                    ctx = ctx.with_value(key, value);
                }
            }
            if let Some(value) = ctx.value(key).map(str::to_string) {
                ctx = ctx.append_outgoing(key, &value);
            }
        }

        ctx = ctx.append_outgoing(APP_HEADER, &self.app_name);
        if self.request_cpu_usage {
            ctx = ctx.append_outgoing(ENABLE_CPU_USAGE_HEADER, "true");
        }
        ctx
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for HeaderInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "header"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        let ctx = if ctx.kind().is_server() {
            self.inbound(ctx)
        } else {
            self.outbound(ctx)
        };
        next.run(ctx, req).await
    }
}
