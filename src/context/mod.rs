//! 调用上下文
//!
//! - `Metadata`: 随调用传输的写时复制 metadata 载体
//! - `CallContext`: 单次调用在拦截器之间传递的上下文

pub mod call;
pub mod metadata;

pub use call::{CallContext, CallDescriptor, CallKind, CallType, ResponseHeaders, Side};
pub use metadata::Metadata;

/// 调用方应用名 header
pub const APP_HEADER: &str = "app";
/// 调用方显式声明的客户端 IP header
pub const CLIENT_IP_HEADER: &str = "client-ip";
/// 客户端请求服务端回报 CPU 使用率的 header
pub const ENABLE_CPU_USAGE_HEADER: &str = "enable-cpu-usage";
/// 服务端回报 CPU 使用率的 header
pub const CPU_USAGE_HEADER: &str = "cpu-usage";
/// 未知的对端应用名
pub const UNKNOWN_APP: &str = "unknown";
