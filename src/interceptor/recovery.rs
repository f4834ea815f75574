//! panic 恢复
//!
//! 服务端最内层拦截器：handler 中的 panic 被转换为 `Status` 返回给调用方，
//! 同时把截断后的调用栈写入本次调用的日志字段，并把 event 标记为 `recover`。

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use async_trait::async_trait;
use futures::FutureExt;
use tonic::{Code, Status};
use tracing::error;

use super::{Interceptor, Next};
use crate::context::CallContext;
use crate::error::{OutcomeClass, normalize};

/// 日志中调用栈的最大字节数
pub const MAX_STACK_BYTES: usize = 4096;

thread_local! {
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// 安装 panic hook，在 panic 发生的线程上记录调用栈；原有 hook 仍会被调用
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(format!("{info}\n{backtrace}")));
            previous(info);
        }));
    });
}

fn take_stack() -> String {
    LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

/// 按字节截断，保持 UTF-8 边界
fn truncate(mut stack: String, max: usize) -> String {
    if stack.len() > max {
        let mut end = max;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    stack
}

/// 将 panic 携带的值转换为 `Status`
///
/// 已经是错误的值直接使用；恢复的 panic 总是视为服务端错误，非 5xx 的状态码改为 `Internal`。
fn panic_status(payload: Box<dyn Any + Send>) -> Status {
    let payload = match payload.downcast::<Status>() {
        Ok(status) => {
            let status = *status;
            return if OutcomeClass::from_status_code(normalize(status.code()))
                == OutcomeClass::ServerFault
            {
                status
            } else {
                Status::new(Code::Internal, status.message().to_string())
            };
        }
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Box<dyn std::error::Error + Send + Sync>>() {
        Ok(err) => return Status::internal(err.to_string()),
        Err(payload) => payload,
    };

    let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    };
    Status::internal(message)
}

/// panic 恢复拦截器
#[derive(Debug, Clone, Copy)]
pub struct RecoveryInterceptor;

impl RecoveryInterceptor {
    /// 创建拦截器并安装记录 panic 现场调用栈的 hook
    pub fn new() -> Self {
        install_panic_hook();
        Self
    }
}

impl Default for RecoveryInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Req, Resp> Interceptor<Req, Resp> for RecoveryInterceptor
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn intercept(
        &self,
        ctx: CallContext,
        req: Req,
        next: Next<'_, Req, Resp>,
    ) -> Result<Resp, Status> {
        let fields = ctx.fields().cloned();
        let method = ctx.method().to_string();

        match AssertUnwindSafe(next.run(ctx, req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let status = panic_status(payload);
                let stack = truncate(take_stack(), MAX_STACK_BYTES);
                match fields {
                    Some(fields) => {
                        fields.push("stack", stack);
                        fields.mark_event("recover");
                    }
                    None => error!(%method, %stack, "Recovered from panic in handler"),
                }
                Err(status)
            }
        }
    }
}
