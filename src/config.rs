//! 拦截器配置
//!
//! 在构建拦截器链时解析一次，链的生命周期内不可变。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 拦截器配置
///
/// TOML 中的时长以毫秒表示：
///
/// ```toml
/// app_name = "order-svc"
/// enable_access_interceptor = true
/// slow_log_threshold_ms = 200
/// read_timeout_ms = 1000
/// propagated_headers = ["x-tenant-id"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// 本进程的应用名，作为 `app` header 发送给下游
    pub app_name: String,
    /// 下游服务的逻辑名称（客户端指标标签）
    pub service_name: String,
    /// 客户端调用的目标地址
    pub target: String,
    /// 记录成功调用的访问日志
    pub enable_access_interceptor: bool,
    /// 访问日志附带请求体
    pub enable_access_interceptor_req: bool,
    /// 访问日志附带响应体
    pub enable_access_interceptor_res: bool,
    /// 启用追踪拦截器，并在访问日志中附带 trace id
    pub enable_trace_interceptor: bool,
    /// 启用指标拦截器
    pub enable_metric_interceptor: bool,
    /// 客户端请求服务端回报 CPU 使用率（服务端只要收到请求即回报）
    pub enable_cpu_usage: bool,
    /// 慢日志阈值（毫秒），0 表示关闭
    pub slow_log_threshold_ms: u64,
    /// 客户端默认超时（毫秒）
    pub read_timeout_ms: u64,
    /// 进程级透传 header，需通过 `apply_propagated_headers` 显式生效
    pub propagated_headers: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            app_name: crate::context::UNKNOWN_APP.to_string(),
            service_name: String::new(),
            target: String::new(),
            enable_access_interceptor: false,
            enable_access_interceptor_req: false,
            enable_access_interceptor_res: false,
            enable_trace_interceptor: true,
            enable_metric_interceptor: true,
            enable_cpu_usage: false,
            slow_log_threshold_ms: 500,
            read_timeout_ms: 3000,
            propagated_headers: Vec::new(),
        }
    }
}

impl InterceptorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 慢日志阈值，`None` 表示关闭
    pub fn slow_log_threshold(&self) -> Option<Duration> {
        (self.slow_log_threshold_ms > 0).then(|| Duration::from_millis(self.slow_log_threshold_ms))
    }

    /// 客户端默认超时
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// 将配置中的透传 header 写入进程级注册表
    pub fn apply_propagated_headers(&self) {
        crate::propagation::set_propagated_headers(&self.propagated_headers);
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_access_log(mut self, enable: bool) -> Self {
        self.enable_access_interceptor = enable;
        self
    }

    pub fn with_access_log_req(mut self, enable: bool) -> Self {
        self.enable_access_interceptor_req = enable;
        self
    }

    pub fn with_access_log_res(mut self, enable: bool) -> Self {
        self.enable_access_interceptor_res = enable;
        self
    }

    pub fn with_trace(mut self, enable: bool) -> Self {
        self.enable_trace_interceptor = enable;
        self
    }

    pub fn with_metric(mut self, enable: bool) -> Self {
        self.enable_metric_interceptor = enable;
        self
    }

    pub fn with_cpu_usage(mut self, enable: bool) -> Self {
        self.enable_cpu_usage = enable;
        self
    }

    /// 设置慢日志阈值，`Duration::ZERO` 表示关闭
    pub fn with_slow_log_threshold(mut self, threshold: Duration) -> Self {
        self.slow_log_threshold_ms = millis(threshold);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = millis(timeout);
        self
    }
}

/// 毫秒数，超出 `u64` 时饱和
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
