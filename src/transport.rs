//! tonic 适配
//!
//! 在 tonic 的请求/响应与 `CallContext` 之间转换：
//! - 服务端：由 `tonic::Request` 构造调用上下文，把拦截器设置的响应 header 写回 `tonic::Response`
//! - 客户端：把上下文中的 outgoing metadata 与截止时间应用到 `tonic::Request`

use std::time::Duration;

use tokio::time::Instant;
use tonic::{Request, Response};
use tracing::debug;

use crate::context::{CPU_USAGE_HEADER, CallContext, CallType, Metadata};

/// gRPC 超时 header
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// 由服务端收到的请求构造调用上下文
///
/// # 参数
/// * `call_type` - 一元或流式
/// * `method` - 完整方法名，例如 `/helloworld.Greeter/SayHello`
/// * `request` - 收到的请求，metadata 与对端地址取自其中
///
/// 请求携带 `grpc-timeout` 时，上下文的截止时间由其推导，下游调用会继承它。
pub fn server_context<T>(call_type: CallType, method: &str, request: &Request<T>) -> CallContext {
    let incoming = Metadata::from(request.metadata().clone());
    let timeout = incoming.get(GRPC_TIMEOUT_HEADER).and_then(parse_grpc_timeout);
    let ctx = CallContext::server(call_type, method, incoming, request.remote_addr());
    match timeout {
        Some(timeout) => ctx.with_deadline(Instant::now() + timeout),
        None => ctx,
    }
}

/// 构造客户端请求：附带上下文的 outgoing metadata，并以剩余时间作为请求超时
pub fn client_request<T>(ctx: &CallContext, message: T) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = ctx.outgoing().clone().into_map();
    if let Some(remaining) = ctx.remaining() {
        request.set_timeout(remaining);
    }
    request
}

/// 把拦截器设置的响应 header 写入响应
pub fn apply_response_headers<T>(ctx: &CallContext, response: &mut Response<T>) {
    let headers = ctx.response_headers().snapshot();
    let metadata = response.metadata_mut();
    for (key, value) in headers.iter() {
        match (
            tonic::metadata::AsciiMetadataKey::from_bytes(key.as_bytes()),
            value.parse::<tonic::metadata::AsciiMetadataValue>(),
        ) {
            (Ok(key), Ok(value)) => {
                metadata.insert(key, value);
            }
            _ => debug!(key, "Skip invalid response header"),
        }
    }
}

/// 服务端响应中回报的 CPU 使用率（千分比）
pub fn response_cpu_usage<T>(response: &Response<T>) -> Option<u64> {
    response
        .metadata()
        .get(CPU_USAGE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

/// 解析 `grpc-timeout` 的值：最多 8 位数字加单位 `H` `M` `S` `m` `u` `n`
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5x"), None);
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_context_from_request() {
        let mut request = Request::new(());
        request.metadata_mut().insert("app", "order-svc".parse().unwrap());
        request.metadata_mut().insert("grpc-timeout", "250m".parse().unwrap());

        let ctx = server_context(CallType::Unary, "/pkg.Svc/Call", &request);

        assert!(ctx.kind().is_server());
        assert_eq!(ctx.method(), "/pkg.Svc/Call");
        assert_eq!(ctx.peer_app(), "order-svc");
        assert_eq!(ctx.remaining(), Some(Duration::from_millis(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_request_carries_metadata_and_timeout() {
        let ctx = CallContext::client(CallType::Unary, "/pkg.Svc/Call", "svc:9000")
            .append_outgoing("x-tenant-id", "t-1")
            .with_timeout(Duration::from_millis(1500));

        let request = client_request(&ctx, 7u32);

        assert_eq!(request.get_ref(), &7);
        assert_eq!(request.metadata().get("x-tenant-id").unwrap().to_str().unwrap(), "t-1");
        assert_eq!(
            request.metadata().get("grpc-timeout").unwrap().to_str().unwrap(),
            "1500000u"
        );
    }

    #[test]
    fn test_response_headers_applied() {
        let ctx = CallContext::server(CallType::Unary, "/pkg.Svc/Call", Metadata::new(), None);
        ctx.response_headers().set("cpu-usage", "315").unwrap();

        let mut response = Response::new(());
        apply_response_headers(&ctx, &mut response);

        assert_eq!(response_cpu_usage(&response), Some(315));
    }
}
