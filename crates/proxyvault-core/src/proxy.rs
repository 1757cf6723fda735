use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{Error, FailureKind, Result};
use crate::verifier::VerificationResult;

/// 代理的唯一标识
pub type ProxyId = Uuid;

/// 代理协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Http,
    Socks5,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for ProxyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyKind::Http),
            "socks5" => Ok(ProxyKind::Socks5),
            other => Err(Error::Validation(format!("unsupported proxy kind: {}", other))),
        }
    }
}

/// 代理验证状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    /// 从未检查
    #[default]
    Unverified,
    /// 最近一次检查成功
    Verified,
    /// 最近一次检查失败
    Failed,
    /// 检查进行中
    Pending,
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationState::Unverified => write!(f, "Unverified"),
            VerificationState::Verified => write!(f, "Verified"),
            VerificationState::Failed => write!(f, "Failed"),
            VerificationState::Pending => write!(f, "Pending"),
        }
    }
}

impl FromStr for VerificationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unverified" => Ok(VerificationState::Unverified),
            "verified" => Ok(VerificationState::Verified),
            "failed" => Ok(VerificationState::Failed),
            "pending" => Ok(VerificationState::Pending),
            other => Err(Error::Validation(format!("unknown state: {}", other))),
        }
    }
}

/// 健康信息。状态、延迟与检查时间总是作为一个整体写入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Health {
    pub state: VerificationState,
    pub last_checked: Option<DateTime<Utc>>,
    /// 最后测速结果 (毫秒)
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_failure: Option<FailureKind>,
}

impl Health {
    /// 根据一次验证结果推进状态
    pub fn apply(&mut self, result: &VerificationResult) {
        self.last_checked = Some(result.checked_at);
        if result.success {
            self.state = VerificationState::Verified;
            self.latency_ms = result.latency_ms();
            self.consecutive_failures = 0;
            self.last_failure = None;
        } else {
            self.state = VerificationState::Failed;
            self.latency_ms = None;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_failure = Some(
                result
                    .error
                    .as_ref()
                    .map(|e| e.kind)
                    .unwrap_or(FailureKind::Aborted),
            );
        }
    }

    /// 中断的检查不能停留在 Pending
    pub fn settle_pending(&mut self) -> bool {
        if self.state != VerificationState::Pending {
            return false;
        }
        self.state = VerificationState::Failed;
        self.last_failure = Some(FailureKind::Aborted);
        true
    }
}

/// 去重键: 规范化后的 host + port + username
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    host: String,
    port: u16,
    username: Option<String>,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}", user, host_port(&self.host, self.port)),
            None => write!(f, "{}", host_port(&self.host, self.port)),
        }
    }
}

/// 新建代理时提交的字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub kind: ProxyKind,
    #[serde(default)]
    pub name: Option<String>,
}

impl ProxySpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            kind: ProxyKind::default(),
            name: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_kind(mut self, kind: ProxyKind) -> Self {
        self.kind = kind;
        self
    }

    /// 校验并规范化字段
    pub fn normalized(mut self) -> Result<Self> {
        self.host = normalize_host(&self.host);
        validate_host(&self.host)?;
        if self.port == 0 {
            return Err(Error::Validation("port must be between 1 and 65535".to_string()));
        }
        self.username = self.username.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        self.password = self.password.filter(|p| !p.is_empty());
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                validate_credential("username", user)?;
                validate_credential("password", pass)?;
            }
            (None, None) => {}
            _ => {
                return Err(Error::Validation(
                    "username and password must be given together".to_string(),
                ))
            }
        }
        self.name = self.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        Ok(self)
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            host: normalize_host(&self.host),
            port: self.port,
            username: self
                .username
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
        }
    }
}

/// 更新代理时提交的字段，缺省字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `null` 清除凭据
    #[serde(default, deserialize_with = "double_option")]
    pub username: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub password: Option<Option<String>>,
    pub kind: Option<ProxyKind>,
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    pub state: Option<VerificationState>,
}

fn double_option<'de, D, T>(de: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// 池中的代理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    /// 唯一标识符
    pub id: ProxyId,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub kind: ProxyKind,
    /// 名称/标签（可选）
    pub name: Option<String>,
    pub health: Health,
    /// 最近一次通过代理看到的出口IP
    pub exit_ip: Option<String>,
    pub last_ip_change: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// 端点版本，地址、协议或凭据变化时加一
    #[serde(default)]
    pub epoch: u64,
}

impl Proxy {
    /// 由已规范化的 spec 创建新代理
    pub fn new(spec: ProxySpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: spec.host,
            port: spec.port,
            username: spec.username,
            password: spec.password,
            kind: spec.kind,
            name: spec.name,
            health: Health::default(),
            exit_ip: None,
            last_ip_change: None,
            created_at: Utc::now(),
            epoch: 0,
        }
    }

    pub fn spec(&self) -> ProxySpec {
        ProxySpec {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            kind: self.kind,
            name: self.name.clone(),
        }
    }

    pub fn state(&self) -> VerificationState {
        self.health.state
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.spec().dedup_key()
    }

    /// 不含凭据的代理URL
    pub fn url(&self) -> String {
        format!("{}://{}", self.kind, host_port(&self.host, self.port))
    }

    /// 合并更新字段，返回端点身份是否改变
    pub fn patched(&self, patch: &ProxyPatch) -> Result<(Proxy, bool)> {
        let mut spec = self.spec();
        if let Some(host) = &patch.host {
            spec.host = host.clone();
        }
        if let Some(port) = patch.port {
            spec.port = port;
        }
        if let Some(username) = &patch.username {
            spec.username = username.clone();
        }
        if let Some(password) = &patch.password {
            spec.password = password.clone();
        }
        if let Some(kind) = patch.kind {
            spec.kind = kind;
        }
        if let Some(name) = &patch.name {
            spec.name = name.clone();
        }
        let spec = spec.normalized()?;

        let identity_changed = spec.host != self.host
            || spec.port != self.port
            || spec.username != self.username
            || spec.password != self.password
            || spec.kind != self.kind;

        let mut updated = self.clone();
        updated.host = spec.host;
        updated.port = spec.port;
        updated.username = spec.username;
        updated.password = spec.password;
        updated.kind = spec.kind;
        updated.name = spec.name;

        if identity_changed {
            // 旧的检查结果属于旧端点
            updated.health = Health::default();
            updated.exit_ip = None;
            updated.last_ip_change = None;
            updated.epoch += 1;
        }
        match patch.state {
            Some(VerificationState::Pending) => {
                return Err(Error::Validation(
                    "state Pending can only be set by a running verification".to_string(),
                ))
            }
            Some(state) => updated.health.state = state,
            None => {}
        }
        Ok((updated, identity_changed))
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// IPv6 地址需要方括号
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.to_ascii_lowercase()
}

fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(Error::Validation("host must not be empty".to_string()));
    }
    if host.contains(':') {
        return host
            .parse::<Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| Error::Validation(format!("invalid host: {}", host)));
    }
    let bad = |c: char| c.is_whitespace() || c.is_control() || "[]/@#?".contains(c);
    if host.chars().any(bad) {
        return Err(Error::Validation(format!("invalid host: {}", host)));
    }
    Ok(())
}

fn validate_credential(field: &str, value: &str) -> Result<()> {
    if value.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control()) {
        return Err(Error::Validation(format!(
            "{} must not contain ':', whitespace or control characters",
            field
        )));
    }
    Ok(())
}
