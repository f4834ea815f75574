use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{APP_HEADER, CLIENT_IP_HEADER, Metadata, UNKNOWN_APP};
use crate::logging::CallFields;

/// 调用方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// 调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    Unary,
    Stream,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Unary => "unary",
            CallType::Stream => "stream",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调用种类：方向 × 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKind {
    pub side: Side,
    pub call_type: CallType,
}

impl CallKind {
    pub const SERVER_UNARY: CallKind = CallKind::new(Side::Server, CallType::Unary);
    pub const SERVER_STREAM: CallKind = CallKind::new(Side::Server, CallType::Stream);
    pub const CLIENT_UNARY: CallKind = CallKind::new(Side::Client, CallType::Unary);
    pub const CLIENT_STREAM: CallKind = CallKind::new(Side::Client, CallType::Stream);

    pub const fn new(side: Side, call_type: CallType) -> Self {
        Self { side, call_type }
    }

    pub fn is_server(&self) -> bool {
        self.side == Side::Server
    }

    pub fn is_client(&self) -> bool {
        self.side == Side::Client
    }

    /// span 的 kind 标签，例如 `server.unary`
    pub fn span_kind(&self) -> &'static str {
        match (self.side, self.call_type) {
            (Side::Server, CallType::Unary) => "server.unary",
            (Side::Server, CallType::Stream) => "server.stream",
            (Side::Client, CallType::Unary) => "client.unary",
            (Side::Client, CallType::Stream) => "client.stream",
        }
    }
}

/// 调用描述，在调用入口创建，调用期间只读
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub kind: CallKind,
    /// 完整方法名，例如 `/helloworld.Greeter/SayHello`
    pub method: String,
    /// 客户端调用的目标地址
    pub target: Option<String>,
    /// 服务端调用的对端地址
    pub peer: Option<SocketAddr>,
    pub started_at: Instant,
}

/// 服务端写回给调用方的响应 header
///
/// 同一次调用内共享，由传输层在构造响应时读取。
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    inner: Arc<Mutex<Metadata>>,
}

impl ResponseHeaders {
    pub fn set(&self, key: &str, value: &str) -> crate::error::Result<()> {
        self.inner.lock().insert(key, value)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).map(str::to_string)
    }

    /// 当前响应 header 的快照
    pub fn snapshot(&self) -> Metadata {
        self.inner.lock().clone()
    }
}

/// 单次调用的上下文
///
/// 拦截器按值接收上下文，修改产生新的上下文并传给下一层；
/// 内部数据通过 `Arc` 共享，修改时写时复制，不会影响外层持有的上下文。
#[derive(Debug, Clone)]
pub struct CallContext {
    descriptor: Arc<CallDescriptor>,
    incoming: Metadata,
    outgoing: Metadata,
    values: Arc<BTreeMap<String, String>>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    trace: opentelemetry::Context,
    response_headers: ResponseHeaders,
    fields: Option<CallFields>,
}

impl CallContext {
    fn with_descriptor(descriptor: CallDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            incoming: Metadata::new(),
            outgoing: Metadata::new(),
            values: Arc::new(BTreeMap::new()),
            deadline: None,
            cancellation: CancellationToken::new(),
            trace: opentelemetry::Context::new(),
            response_headers: ResponseHeaders::default(),
            fields: None,
        }
    }

    /// 服务端调用上下文
    pub fn server(
        call_type: CallType,
        method: impl Into<String>,
        incoming: Metadata,
        peer: Option<SocketAddr>,
    ) -> Self {
        let mut ctx = Self::with_descriptor(CallDescriptor {
            kind: CallKind::new(Side::Server, call_type),
            method: method.into(),
            target: None,
            peer,
            started_at: Instant::now(),
        });
        ctx.incoming = incoming;
        ctx
    }

    /// 客户端调用上下文
    pub fn client(call_type: CallType, method: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_descriptor(CallDescriptor {
            kind: CallKind::new(Side::Client, call_type),
            method: method.into(),
            target: Some(target.into()),
            peer: None,
            started_at: Instant::now(),
        })
    }

    /// 在服务端处理过程中发起下游调用时，基于当前上下文派生客户端上下文
    ///
    /// 透传 incoming metadata、上下文值、截止时间与追踪上下文，取消信号由父上下文派生。
    pub fn outbound(
        &self,
        call_type: CallType,
        method: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let mut ctx = Self::client(call_type, method, target);
        ctx.incoming = self.incoming.clone();
        ctx.values = self.values.clone();
        ctx.deadline = self.deadline;
        ctx.cancellation = self.cancellation.child_token();
        ctx.trace = self.trace.clone();
        ctx
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> CallKind {
        self.descriptor.kind
    }

    pub fn method(&self) -> &str {
        &self.descriptor.method
    }

    pub fn target(&self) -> Option<&str> {
        self.descriptor.target.as_deref()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.descriptor.peer
    }

    pub fn elapsed(&self) -> Duration {
        self.descriptor.started_at.elapsed()
    }

    /// 调用方收到的 metadata（服务端）
    pub fn incoming(&self) -> &Metadata {
        &self.incoming
    }

    /// 将要发送的 metadata（客户端）
    pub fn outgoing(&self) -> &Metadata {
        &self.outgoing
    }

    /// 向发送的 metadata 追加一个值
    #[must_use]
    pub fn append_outgoing(mut self, key: &str, value: &str) -> Self {
        self.outgoing = self.outgoing.with(key, value);
        self
    }

    #[must_use]
    pub fn with_outgoing(mut self, outgoing: Metadata) -> Self {
        self.outgoing = outgoing;
        self
    }

    /// 读取上下文值
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 写入上下文值，key 统一为小写
    #[must_use]
    pub fn with_value(mut self, key: &str, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.values).insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 距截止时间的剩余时长，已过期返回零
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn trace_context(&self) -> &opentelemetry::Context {
        &self.trace
    }

    #[must_use]
    pub fn with_trace_context(mut self, cx: opentelemetry::Context) -> Self {
        self.trace = cx;
        self
    }

    pub fn response_headers(&self) -> &ResponseHeaders {
        &self.response_headers
    }

    pub fn fields(&self) -> Option<&CallFields> {
        self.fields.as_ref()
    }

    #[must_use]
    pub fn with_fields(mut self, fields: CallFields) -> Self {
        self.fields = Some(fields);
        self
    }

    /// 对端应用名，来自 `app` header，多个值以 `,` 连接
    pub fn peer_app(&self) -> String {
        self.incoming
            .joined(APP_HEADER)
            .unwrap_or_else(|| UNKNOWN_APP.to_string())
    }

    /// 对端 IP，优先取 `client-ip` header
    pub fn peer_ip(&self) -> String {
        if let Some(ip) = self.incoming.get(CLIENT_IP_HEADER).filter(|ip| !ip.is_empty()) {
            return ip.to_string();
        }
        self.descriptor
            .peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }
}
