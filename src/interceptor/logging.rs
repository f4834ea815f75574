//! 访问日志拦截器
//!
//! 每次调用最多输出一条访问日志：
//!
//! | 结果 | 级别 | 消息 | event |
//! |------|------|------|-------|
//! | 失败，服务端错误或 panic | error | access | error / recover |
//! | 失败，调用方错误 | warn | access | error |
//! | 成功但超过慢日志阈值 | warn | slow | slow |
//! | 成功且开启访问日志 | info | access | normal |
//!
//! 失败且同时超过阈值时附带 `slow=true`，不再单独输出慢日志。

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tonic::Status;

use super::tracing::trace_id;
use super::{Interceptor, Next};
use crate::config::InterceptorConfig;
use crate::context::CallContext;
use crate::error::{OutcomeClass, normalize, outcome_class};
use crate::logging::{AccessRecord, AccessSink, CallFields, FieldSet, Severity};
use crate::propagation::HeaderRegistry;

/// 负载渲染函数
pub type Render<T> = fn(&T) -> String;

/// 以 `Debug` 格式渲染负载
pub fn render_debug<T: Debug>(value: &T) -> String {
    format!("{value:?}")
}

/// 访问日志拦截器
pub struct AccessLogInterceptor<Req, Resp> {
    config: Arc<InterceptorConfig>,
    registry: Arc<HeaderRegistry>,
    sink: Arc<dyn AccessSink>,
    render_req: Option<Render<Req>>,
    render_res: Option<Render<Resp>>,
}

impl<Req, Resp> AccessLogInterceptor<Req, Resp> {
    pub fn new(
        config: Arc<InterceptorConfig>,
        registry: Arc<HeaderRegistry>,
        sink: Arc<dyn AccessSink>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            render_req: None,
            render_res: None,
        }
    }

    /// 设置请求/响应负载的渲染方式；是否输出仍由配置决定
    pub fn with_payloads(mut self, render_req: Render<Req>, render_res: Render<Resp>) -> Self {
        self.render_req = Some(render_req);
        self.render_res = Some(render_res);
        self
    }

    fn request_payload(&self, ctx: &CallContext, req: &Req) -> Option<serde_json::Value> {
        if !self.config.enable_access_interceptor_req {
            return None;
        }
        let payload = self.render_req.map(|render| render(req));
        Some(if ctx.kind().is_server() {
            json!({ "payload": payload, "metadata": ctx.incoming().to_json() })
        } else {
            json!({ "payload": payload })
        })
    }

    fn response_payload(&self, result: &Result<Resp, Status>) -> Option<serde_json::Value> {
        if !self.config.enable_access_interceptor_res {
            return None;
        }
        let render = self.render_res?;
        let resp = result.as_ref().ok()?;
        Some(json!({ "payload": render(resp) }))
    }

    fn build_record(
        &self,
        ctx: &CallContext,
        elapsed: std::time::Duration,
        err: Option<&Status>,
        request: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
        fields: &CallFields,
    ) -> Option<AccessRecord> {
        let slow = self
            .config
            .slow_log_threshold()
            .is_some_and(|threshold| elapsed > threshold);
        let (collected, marked) = fields.take();

        let (severity, message, event) = match err {
            Some(_) => {
                let severity = if marked == Some("recover")
                    || outcome_class(err) == OutcomeClass::ServerFault
                {
                    Severity::Error
                } else {
                    Severity::Warn
                };
                (severity, "access", marked.unwrap_or("error"))
            }
            None if slow => (Severity::Warn, "slow", marked.unwrap_or("slow")),
            None if self.config.enable_access_interceptor => {
                (Severity::Info, "access", marked.unwrap_or("normal"))
            }
            None => return None,
        };

        let code = err.map_or(tonic::Code::Ok, Status::code);
        let mut set = FieldSet::with_capacity(16);
        set.push("type", ctx.kind().call_type.as_str());
        set.push("event", event);
        set.push("code", normalize(code).as_u16());
        set.push("origin_code", i32::from(code));
        set.push("description", err.map_or_else(String::new, |s| s.message().to_string()));
        set.push("method", ctx.method().to_string());
        set.push("cost", elapsed);
        if ctx.kind().is_server() {
            set.push("peer_name", ctx.peer_app());
            set.push("peer_ip", ctx.peer_ip());
        } else {
            set.push("name", ctx.target().unwrap_or_default().to_string());
        }

        for key in self.registry.snapshot().iter() {
            if let Some(value) = ctx.value(key) {
                set.push(key.to_string(), value.to_string());
            }
        }
        if self.config.enable_trace_interceptor {
            if let Some(tid) = trace_id(ctx.trace_context()) {
                set.push("tid", tid);
            }
        }
        if let Some(request) = request {
            set.push("req", request);
        }
        if let Some(response) = response {
            set.push("res", response);
        }
        set.extend(collected);
        if err.is_some() && slow {
            set.push("slow", true);
        }

        Some(AccessRecord {
            severity,
            message,
            fields: set,
        })
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for AccessLogInterceptor<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "access_log"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        let start = Instant::now();
        let fields = CallFields::new();
        let ctx = ctx.with_fields(fields.clone());
        let call = ctx.clone();
        let request = self.request_payload(&ctx, &req);

        let result = next.run(ctx, req).await;

        let elapsed = start.elapsed();
        let response = self.response_payload(&result);
        if let Some(record) = self.build_record(
            &call,
            elapsed,
            result.as_ref().err(),
            request,
            response,
            &fields,
        ) {
            self.sink.emit(record);
        }
        result
    }
}
