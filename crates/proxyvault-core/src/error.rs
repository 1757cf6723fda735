use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 探测失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 连接或读取超时
    Timeout,
    /// 代理拒绝认证 (407)
    Auth,
    /// 代理或目标不可达
    Unreachable,
    /// 检查任务异常终止
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "connect-timeout"),
            FailureKind::Auth => write!(f, "auth-failure"),
            FailureKind::Unreachable => write!(f, "target-unreachable"),
            FailureKind::Aborted => write!(f, "aborted"),
        }
    }
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Timeout,
        FailureKind::Auth,
        FailureKind::Unreachable,
        FailureKind::Aborted,
    ];

    /// JSON 中使用的短名
    pub fn short_name(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Auth => "auth",
            FailureKind::Unreachable => "unreachable",
            FailureKind::Aborted => "aborted",
        }
    }
}

/// 同时接受短名和 `connect-timeout` 这样的显示名
impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.short_name() == wanted || kind.to_string() == wanted)
            .ok_or_else(|| Error::Validation(format!("unknown failure kind: {}", s.trim())))
    }
}

/// 单次探测的失败信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProbeError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(FailureKind::Timeout, format!("timed out after {}ms", after_ms))
    }
}

/// Error type for ProxyVault operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 输入格式错误
    #[error("Validation error: {0}")]
    Validation(String),
    /// 唯一性冲突
    #[error("Duplicate proxy: {0}")]
    Duplicate(String),
    /// 代理不存在
    #[error("Proxy not found: {0}")]
    NotFound(Uuid),
    /// 探测失败
    #[error("Network error: {0}")]
    Network(#[from] ProbeError),
    /// 同一代理的检查已在进行
    #[error("Conflict: {0}")]
    Conflict(String),
    /// 存储不可用
    #[error("Storage error: {0}")]
    Storage(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// IO操作错误
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for ProxyVault operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::new(FailureKind::Timeout, err.to_string())
        } else {
            // 连接被拒、DNS失败、代理握手失败以及读取响应失败都归为不可达
            ProbeError::new(FailureKind::Unreachable, err.to_string())
        }
    }
}

/// 从reqwest错误转换
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.into())
    }
}

/// 从toml错误转换
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// 从toml序列化错误转换
impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// 从json错误转换
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
