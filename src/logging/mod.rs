//! 访问日志的字段集与输出
//!
//! 拦截器只负责组装 `FieldSet` 并选择级别，真正的输出由 `AccessSink` 完成，
//! 默认的 `TracingSink` 通过 `tracing` 输出结构化日志。

pub mod field;

pub use field::{CallFields, Field, FieldSet, FieldValue};

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

/// 日志输出的 target
pub const ACCESS_TARGET: &str = "flare::access";

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// 一条访问日志
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub severity: Severity,
    /// 日志消息：`access` 或 `slow`
    pub message: &'static str,
    pub fields: FieldSet,
}

impl AccessRecord {
    /// 日志中的 event 标签
    pub fn event(&self) -> Option<&str> {
        self.fields.get_str("event")
    }
}

/// 访问日志输出端
pub trait AccessSink: Send + Sync {
    fn emit(&self, record: AccessRecord);
}

/// 通过 `tracing` 输出访问日志
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AccessSink for TracingSink {
    fn emit(&self, record: AccessRecord) {
        let event = record.event().unwrap_or("normal").to_string();
        let method = record.fields.get_str("method").unwrap_or("").to_string();
        let fields = &record.fields;
        match record.severity {
            Severity::Info => {
                info!(target: ACCESS_TARGET, %event, %method, %fields, "{}", record.message)
            }
            Severity::Warn => {
                warn!(target: ACCESS_TARGET, %event, %method, %fields, "{}", record.message)
            }
            Severity::Error => {
                error!(target: ACCESS_TARGET, %event, %method, %fields, "{}", record.message)
            }
        }
    }
}

/// 内存日志输出端，记录所有日志，便于测试与调试
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<AccessRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AccessRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AccessSink for MemorySink {
    fn emit(&self, record: AccessRecord) {
        self.records.lock().push(record);
    }
}
