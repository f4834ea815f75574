//! gRPC 拦截器模块
//!
//! 每个横切关注点是一个具名拦截器，拦截器收到下一层 `Next` 并调用它恰好一次；
//! `CompositeInterceptor` 按固定顺序把它们组合为客户端/服务端 × 一元/流式四种链：
//!
//! ```text
//! trace → metrics → deadline(仅客户端一元) → header → access log → recovery(仅服务端) → handler
//! ```
//!
//! 流式调用中 `Req`/`Resp` 为流对象本身，拦截器只观察整个调用的生命周期，不拦截单条消息。

pub mod composite;
pub mod deadline;
pub mod header;
pub mod logging;
pub mod metrics;
pub mod recovery;
pub mod tracing;

pub use composite::CompositeInterceptor;
pub use deadline::DeadlineInterceptor;
pub use header::HeaderInterceptor;
pub use logging::AccessLogInterceptor;
pub use metrics::MetricsInterceptor;
pub use recovery::RecoveryInterceptor;
pub use self::tracing::TraceInterceptor;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::context::{CallContext, CallKind};

/// 调用的最内层：服务端为业务 handler，客户端为真正发起调用的 invoker
#[async_trait]
pub trait Handler<Req, Resp>: Send + Sync {
    async fn call(&self, ctx: CallContext, req: Req) -> Result<Resp, Status>;
}

/// 由闭包构造的 handler
#[derive(Clone)]
pub struct HandlerFn<F>(F);

/// 将 `async` 闭包包装为 `Handler`
pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<Req, Resp, F, Fut> Handler<Req, Resp> for HandlerFn<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, req: Req) -> Result<Resp, Status> {
        (self.0)(ctx, req).await
    }
}

/// 拦截器
#[async_trait]
pub trait Interceptor<Req, Resp>: Send + Sync {
    /// 拦截器名称，用于诊断链的组成
    fn name(&self) -> &'static str;

    /// 前置处理后调用 `next.run`，再根据结果做后置处理；调用方的错误必须原样返回
    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status>;
}

/// 链中剩余的部分
///
/// `run` 按值消费 `Next`，每一层最多只能继续调用一次。
/// 到达 handler 时按上下文的截止时间与取消令牌约束调用。
pub struct Next<'a, Req, Resp> {
    rest: &'a [Arc<dyn Interceptor<Req, Resp>>],
    handler: &'a dyn Handler<Req, Resp>,
}

impl<'a, Req, Resp> Next<'a, Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn new(rest: &'a [Arc<dyn Interceptor<Req, Resp>>], handler: &'a dyn Handler<Req, Resp>) -> Self {
        Self { rest, handler }
    }

    pub async fn run(self, ctx: CallContext, req: Req) -> Result<Resp, Status> {
        match self.rest.split_first() {
            Some((current, rest)) => {
                current
                    .intercept(ctx, req, Next::new(rest, self.handler))
                    .await
            }
            None => {
                let method = ctx.method().to_string();
                let deadline = ctx.deadline();
                let token = ctx.cancellation().clone();
                deadline::bounded(&method, deadline, token, self.handler.call(ctx, req)).await
            }
        }
    }
}

/// 组合好的拦截器链
pub struct InterceptorChain<Req, Resp> {
    kind: CallKind,
    interceptors: Vec<Arc<dyn Interceptor<Req, Resp>>>,
}

impl<Req, Resp> Clone for InterceptorChain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<Req, Resp> InterceptorChain<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(kind: CallKind, interceptors: Vec<Arc<dyn Interceptor<Req, Resp>>>) -> Self {
        Self { kind, interceptors }
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// 由外到内的拦截器名称
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// 经过整条链调用 `handler`
    pub async fn call<H>(&self, ctx: CallContext, req: Req, handler: &H) -> Result<Resp, Status>
    where
        H: Handler<Req, Resp>,
    {
        Next::new(&self.interceptors, handler).run(ctx, req).await
    }

    /// 将链与 handler 绑定，得到新的 handler
    pub fn bind<H>(self, handler: H) -> Intercepted<Req, Resp, H>
    where
        H: Handler<Req, Resp>,
    {
        Intercepted {
            chain: self,
            handler,
        }
    }
}

/// 绑定了拦截器链的 handler
pub struct Intercepted<Req, Resp, H> {
    chain: InterceptorChain<Req, Resp>,
    handler: H,
}

#[async_trait]
impl<Req, Resp, H> Handler<Req, Resp> for Intercepted<Req, Resp, H>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: Handler<Req, Resp>,
{
    async fn call(&self, ctx: CallContext, req: Req) -> Result<Resp, Status> {
        self.chain.call(ctx, req, &self.handler).await
    }
}
