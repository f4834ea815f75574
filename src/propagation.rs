//! 透传 header 注册表
//!
//! 进程级、很少修改的 header 名称集合：服务端从 incoming metadata 中自动提取这些 header
//! 写入上下文与日志，客户端再把上下文中的值自动附加到发出的调用上。
//!
//! 注册表保存不可变快照，更新时整体替换引用，读者只会看到替换前或替换后的完整集合。

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::info;

/// 一份不可变的 header 名称快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagatedHeaders {
    names: Arc<[String]>,
}

impl PropagatedHeaders {
    /// 构造快照：名称统一为小写、去重并保持首次出现的顺序
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            if !name.is_empty() && !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self {
            names: unique.into(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.names.to_vec()
    }
}

/// 透传 header 注册表
#[derive(Debug, Default)]
pub struct HeaderRegistry {
    current: RwLock<PropagatedHeaders>,
}

impl HeaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前快照，读锁只在复制 `Arc` 期间持有
    pub fn snapshot(&self) -> PropagatedHeaders {
        self.current.read().clone()
    }

    /// 整体替换 header 集合
    pub fn replace(&self, headers: PropagatedHeaders) {
        *self.current.write() = headers;
    }
}

static GLOBAL_REGISTRY: LazyLock<Arc<HeaderRegistry>> =
    LazyLock::new(|| Arc::new(HeaderRegistry::new()));

/// 进程级注册表
pub fn global() -> Arc<HeaderRegistry> {
    GLOBAL_REGISTRY.clone()
}

/// 设置进程级透传 header
pub fn set_propagated_headers<I, S>(names: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let headers = PropagatedHeaders::new(names);
    info!(headers = ?headers.to_vec(), "Propagated headers updated");
    global().replace(headers);
}

/// 进程级透传 header 的当前快照
pub fn propagated_headers() -> PropagatedHeaders {
    global().snapshot()
}
