//! 调用上下文载体（metadata）
//!
//! 对 `tonic::metadata::MetadataMap` 的写时复制封装：克隆只增加引用计数，
//! 修改时若底层数据被共享则先复制，调用方传入的原始 metadata 永远不会被原地修改。

use std::sync::Arc;

use opentelemetry::propagation::{Extractor, Injector};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tracing::debug;

use crate::error::{InterceptorError, Result};

/// 写时复制的 metadata 载体
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    inner: Arc<MetadataMap>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 key 的第一个值
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner
            .get(normalize_key(key).as_str())
            .and_then(|v| v.to_str().ok())
    }

    /// 获取 key 的所有值
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.inner
            .get_all(normalize_key(key).as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// 获取 key 的所有值并以 `,` 连接，不存在时返回 `None`
    pub fn joined(&self, key: &str) -> Option<String> {
        let values = self.get_all(key);
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(normalize_key(key).as_str())
    }

    /// 追加一个值（保留已有值）
    pub fn append(&mut self, key: &str, value: &str) -> Result<()> {
        let (key, value) = parse_pair(key, value)?;
        Arc::make_mut(&mut self.inner).append(key, value);
        Ok(())
    }

    /// 设置一个值（覆盖已有值）
    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        let (key, value) = parse_pair(key, value)?;
        Arc::make_mut(&mut self.inner).insert(key, value);
        Ok(())
    }

    /// 返回追加了一个值的新载体，自身保持不变
    #[must_use]
    pub fn with(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        if let Err(err) = next.append(key, value) {
            debug!(?err, "Skip invalid metadata pair");
        }
        next
    }

    /// 遍历所有 ASCII 键值对
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => {
                value.to_str().ok().map(|value| (key.as_str(), value))
            }
            KeyAndValueRef::Binary(..) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_map(&self) -> &MetadataMap {
        &self.inner
    }

    /// 取出底层 `MetadataMap`，仅在被共享时复制
    pub fn into_map(self) -> MetadataMap {
        Arc::try_unwrap(self.inner).unwrap_or_else(|shared| (*shared).clone())
    }

    /// 以 JSON 对象形式输出（多值 key 输出为数组）
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (key, value) in self.iter() {
            match object.get_mut(key) {
                Some(serde_json::Value::Array(values)) => {
                    values.push(serde_json::Value::from(value));
                }
                _ => {
                    object.insert(key.to_string(), serde_json::json!([value]));
                }
            }
        }
        serde_json::Value::Object(object)
    }
}

impl From<MetadataMap> for Metadata {
    fn from(map: MetadataMap) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }
}

/// metadata 的 key 统一为小写
fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

fn parse_pair(key: &str, value: &str) -> Result<(AsciiMetadataKey, AsciiMetadataValue)> {
    let key = AsciiMetadataKey::from_bytes(normalize_key(key).as_bytes())
        .map_err(|_| InterceptorError::InvalidMetadataKey(key.to_string()))?;
    let value = value
        .parse::<AsciiMetadataValue>()
        .map_err(|_| InterceptorError::InvalidMetadataValue {
            key: key.as_str().to_string(),
        })?;
    Ok((key, value))
}

/// 供 OpenTelemetry propagator 读取
pub(crate) struct MetadataExtractor<'a>(pub(crate) &'a Metadata);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(key, _)| key).collect()
    }
}

/// 供 OpenTelemetry propagator 写入
pub(crate) struct MetadataInjector<'a>(pub(crate) &'a mut Metadata);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let Err(err) = self.0.insert(key, &value) {
            debug!(?err, "Failed to inject trace context");
        }
    }
}
