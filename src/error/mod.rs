//! 错误处理模块
//!
//! - `InterceptorError`: 拦截器库自身的错误（配置、指标注册、metadata 非法）
//! - `code`: 调用结果的归一化状态码与结果分类

pub mod code;

pub use code::{OutcomeClass, normalize, outcome_class, outcome_label};

use thiserror::Error;

/// 拦截器库错误类型
#[derive(Error, Debug)]
pub enum InterceptorError {
    /// 配置文件读取失败
    #[error("读取配置失败: {0}")]
    Io(#[from] std::io::Error),

    /// 配置解析失败
    #[error("解析配置失败: {0}")]
    Config(#[from] toml::de::Error),

    /// 指标注册失败
    #[error("注册指标失败: {0}")]
    Metrics(#[from] prometheus::Error),

    /// 非法的 metadata key
    #[error("非法的 metadata key: {0}")]
    InvalidMetadataKey(String),

    /// 非法的 metadata value
    #[error("非法的 metadata value (key = {key})")]
    InvalidMetadataValue { key: String },
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, InterceptorError>;
