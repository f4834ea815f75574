//! 日志字段

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// 字段值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// 耗时，输出为毫秒
    Duration(Duration),
    Json(serde_json::Value),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Duration(d) => write!(f, "{:.3}ms", d.as_micros() as f64 / 1000.0),
            FieldValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<u16> for FieldValue {
    fn from(value: u16) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Duration> for FieldValue {
    fn from(value: Duration) -> Self {
        FieldValue::Duration(value)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Json(value)
    }
}

/// 单个字段
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: Cow<'static, str>,
    pub value: FieldValue,
}

/// 有序字段集
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    fields: Vec<Field>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<Cow<'static, str>>, value: impl Into<FieldValue>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn extend(&mut self, other: FieldSet) {
        self.fields.extend(other.fields);
    }

    /// 同名字段取第一个
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match &field.value {
                FieldValue::Str(s) => serde_json::Value::from(s.as_str()),
                FieldValue::Int(v) => serde_json::Value::from(*v),
                FieldValue::Bool(v) => serde_json::Value::from(*v),
                FieldValue::Duration(d) => serde_json::Value::from(d.as_micros() as f64 / 1000.0),
                FieldValue::Json(v) => v.clone(),
            };
            object.entry(field.name.to_string()).or_insert(value);
        }
        serde_json::Value::Object(object)
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", field.name, field.value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CallFieldsInner {
    fields: FieldSet,
    event: Option<&'static str>,
}

/// 单次调用内共享的字段收集器
///
/// 由访问日志拦截器创建并放入调用上下文，内层（例如 panic 恢复）向其中追加字段，
/// 调用结束时由访问日志拦截器一次性取出。
#[derive(Debug, Clone, Default)]
pub struct CallFields {
    inner: Arc<Mutex<CallFieldsInner>>,
}

impl CallFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: impl Into<Cow<'static, str>>, value: impl Into<FieldValue>) {
        self.inner.lock().fields.push(name, value);
    }

    /// 覆盖本次调用的 event 标签
    pub fn mark_event(&self, event: &'static str) {
        self.inner.lock().event = Some(event);
    }

    pub fn event(&self) -> Option<&'static str> {
        self.inner.lock().event
    }

    /// 取出已收集的字段与 event 标签
    pub fn take(&self) -> (FieldSet, Option<&'static str>) {
        let mut inner = self.inner.lock();
        (std::mem::take(&mut inner.fields), inner.event.take())
    }
}
