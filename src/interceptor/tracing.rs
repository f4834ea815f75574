//! 追踪拦截器
//!
//! 服务端从 incoming metadata 中提取上游追踪上下文，客户端把当前追踪上下文注入 outgoing metadata；
//! 两端都为本次调用开启 span，并在任何退出路径上结束它。

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{SpanBuilder, SpanKind, Status as SpanStatus, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tonic::Status;

use super::{Interceptor, Next};
use crate::context::metadata::{MetadataExtractor, MetadataInjector};
use crate::context::CallContext;

/// 默认 tracer 的名称
pub const TRACER_NAME: &str = "flare-rpc-interceptor";

/// 追踪拦截器
///
/// 未指定 tracer 时，每次调用从全局 tracer provider 获取，
/// 因此链构建之后才安装的 provider 同样生效。
#[derive(Clone, Default)]
pub struct TraceInterceptor {
    tracer: Option<Arc<BoxedTracer>>,
}

impl TraceInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracer(tracer: Arc<BoxedTracer>) -> Self {
        Self {
            tracer: Some(tracer),
        }
    }

    fn start_span(&self, ctx: &CallContext) -> Context {
        let kind = ctx.kind();
        let parent = if kind.is_server() {
            global::get_text_map_propagator(|propagator| {
                propagator.extract_with_context(ctx.trace_context(), &MetadataExtractor(ctx.incoming()))
            })
        } else {
            ctx.trace_context().clone()
        };

        let builder = SpanBuilder::from_name(ctx.method().to_string())
            .with_kind(if kind.is_server() {
                SpanKind::Server
            } else {
                SpanKind::Client
            })
            .with_attributes(vec![
                KeyValue::new("rpc.system", "grpc"),
                KeyValue::new("rpc.method", ctx.method().to_string()),
                KeyValue::new("span.kind", kind.span_kind()),
            ]);

        let span = match &self.tracer {
            Some(tracer) => tracer.build_with_context(builder, &parent),
            None => global::tracer(TRACER_NAME).build_with_context(builder, &parent),
        };
        parent.with_span(span)
    }
}

/// 在 drop 时结束 span
struct SpanGuard(Context);

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.span().end();
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for TraceInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        let is_server = ctx.kind().is_server();
        let cx = self.start_span(&ctx);
        let guard = SpanGuard(cx.clone());

        let ctx = if is_server {
            ctx.with_trace_context(cx)
        } else {
            let mut outgoing = ctx.outgoing().clone();
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, &mut MetadataInjector(&mut outgoing))
            });
            ctx.with_outgoing(outgoing).with_trace_context(cx)
        };

        let result = next.run(ctx, req).await;

        if let Err(status) = &result {
            let span = guard.0.span();
            let code_key = if is_server { "code" } else { "response_code" };
            span.set_attribute(KeyValue::new(code_key, i64::from(i32::from(status.code()))));
            span.set_status(SpanStatus::error(status.message().to_string()));
            span.add_event(
                "error",
                vec![
                    KeyValue::new("event", "error"),
                    KeyValue::new("message", status.message().to_string()),
                ],
            );
        }
        result
    }
}

/// 追踪上下文中有效 span 的 trace id
pub fn trace_id(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}
