//! 客户端默认超时

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep_until};
use tonic::Status;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Interceptor, Next};
use crate::context::CallContext;

/// 为没有截止时间的客户端调用设置默认超时
///
/// 调用方已设置截止时间时原样放行。设置默认截止时间后，本次调用使用派生的取消令牌，
/// 调用结束（无论成功、失败、超时还是 panic）时令牌被取消，不影响父上下文。
/// 截止时间由链的最内层执行，超时结果仍经过日志、指标与追踪拦截器。
#[derive(Debug, Clone, Copy)]
pub struct DeadlineInterceptor {
    timeout: Duration,
}

impl DeadlineInterceptor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for DeadlineInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "deadline"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        if ctx.deadline().is_some() {
            return next.run(ctx, req).await;
        }

        let Some(deadline) = Instant::now().checked_add(self.timeout) else {
            return next.run(ctx, req).await;
        };
        let token = ctx.cancellation().child_token();
        let _cancel_on_exit = token.clone().drop_guard();
        let ctx = ctx.with_deadline(deadline).with_cancellation(token);

        next.run(ctx, req).await
    }
}

/// 在调用的截止时间与取消令牌约束下执行最内层调用
///
/// 超时返回 `DeadlineExceeded`，令牌取消返回 `Cancelled`。
/// 只约束 handler 本身，外层拦截器仍能观察到这两种结果。
pub(crate) async fn bounded<Resp, F>(
    method: &str,
    deadline: Option<Instant>,
    token: CancellationToken,
    call: F,
) -> Result<Resp, Status>
where
    F: Future<Output = Result<Resp, Status>>,
{
    let expired = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        result = call => result,
        _ = expired => {
            debug!(%method, "Call exceeded deadline");
            Err(Status::deadline_exceeded("call exceeded deadline"))
        }
        _ = token.cancelled() => {
            debug!(%method, "Call cancelled");
            Err(Status::cancelled("call cancelled"))
        }
    }
}
