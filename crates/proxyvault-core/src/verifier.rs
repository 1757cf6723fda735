use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{FailureKind, ProbeError};
use crate::proxy::{host_port, Proxy, ProxyId, ProxyKind};

/// 探测目标
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// 测试目标URL，最好是回显调用方IP的接口
    pub url: String,
    /// 整个探测的硬超时
    pub timeout: Duration,
}

/// 单次验证结果，不直接持久化
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// 代理ID
    pub proxy_id: ProxyId,
    /// 是否成功
    pub success: bool,
    /// 从拨号开始到读完最后一个字节的耗时
    pub latency: Option<Duration>,
    /// 失败分类
    pub error: Option<ProbeError>,
    /// 目标回显的出口IP
    pub exit_ip: Option<String>,
    /// 检查开始时间
    pub checked_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn success(proxy_id: ProxyId, latency: Duration, exit_ip: Option<String>) -> Self {
        Self {
            proxy_id,
            success: true,
            latency: Some(latency),
            error: None,
            exit_ip,
            checked_at: Utc::now(),
        }
    }

    pub fn failure(proxy_id: ProxyId, error: ProbeError) -> Self {
        Self {
            proxy_id,
            success: false,
            latency: None,
            error: Some(error),
            exit_ip: None,
            checked_at: Utc::now(),
        }
    }

    pub fn at(mut self, checked_at: DateTime<Utc>) -> Self {
        self.checked_at = checked_at;
        self
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency.map(|l| l.as_millis() as u64)
    }
}

/// 对单个代理做一次网络探测。实现不得重试，也不得修改任何状态
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, proxy: &Proxy, target: &ProbeTarget) -> VerificationResult;
}

/// 基于 reqwest 的代理验证器
#[derive(Debug, Clone, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// 通过代理请求目标并分类结果
    pub async fn verify(&self, proxy: &Proxy, target: &ProbeTarget) -> VerificationResult {
        let checked_at = Utc::now();
        let client = match build_client(proxy, target.timeout) {
            Ok(client) => client,
            Err(e) => return VerificationResult::failure(proxy.id, e).at(checked_at),
        };

        let start = Instant::now();
        let outcome = timeout(target.timeout, async {
            let resp = client.get(&target.url).send().await.map_err(classify)?;
            let status = resp.status();
            // 只有 407 来自代理本身，其余状态码都是目标的回答
            if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                return Err(ProbeError::new(
                    FailureKind::Auth,
                    format!("proxy answered {}", status),
                ));
            }
            if !status.is_success() {
                return Err(ProbeError::new(
                    FailureKind::Unreachable,
                    format!("target answered {}", status),
                ));
            }
            // 读完整个响应体
            let body = resp.bytes().await.map_err(classify)?;
            Ok(body)
        })
        .await;

        let result = match outcome {
            Ok(Ok(body)) => {
                let latency = start.elapsed();
                VerificationResult::success(proxy.id, latency, parse_exit_ip(&body))
            }
            Ok(Err(e)) => VerificationResult::failure(proxy.id, e),
            Err(_) => VerificationResult::failure(
                proxy.id,
                ProbeError::timeout(target.timeout.as_millis() as u64),
            ),
        };
        debug!(
            proxy = %proxy,
            success = result.success,
            latency_ms = ?result.latency_ms(),
            error = ?result.error,
            "探测完成"
        );
        result.at(checked_at)
    }
}

#[async_trait]
impl Probe for Verifier {
    async fn probe(&self, proxy: &Proxy, target: &ProbeTarget) -> VerificationResult {
        self.verify(proxy, target).await
    }
}

fn build_client(proxy: &Proxy, request_timeout: Duration) -> Result<Client, ProbeError> {
    let invalid = |e: &dyn std::fmt::Display| {
        ProbeError::new(FailureKind::Unreachable, format!("invalid proxy {}: {}", proxy, e))
    };

    let reqwest_proxy = match proxy.kind {
        ProxyKind::Http => {
            let p = reqwest::Proxy::all(proxy.url()).map_err(|e| invalid(&e))?;
            match (&proxy.username, &proxy.password) {
                (Some(user), Some(pass)) => p.basic_auth(user, pass),
                _ => p,
            }
        }
        ProxyKind::Socks5 => {
            // socks5h: 目标域名由代理解析
            let mut url = reqwest::Url::parse(&format!(
                "socks5h://{}",
                host_port(&proxy.host, proxy.port)
            ))
            .map_err(|e| invalid(&e))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                url.set_username(user).map_err(|_| invalid(&"username"))?;
                url.set_password(Some(pass)).map_err(|_| invalid(&"password"))?;
            }
            reqwest::Proxy::all(url.as_str()).map_err(|e| invalid(&e))?
        }
    };

    Client::builder()
        .proxy(reqwest_proxy)
        .connect_timeout(request_timeout)
        .timeout(request_timeout)
        .build()
        .map_err(classify)
}

/// CONNECT 隧道收到 407 时 reqwest 给出的错误
const TUNNEL_AUTH_REQUIRED: &str = "proxy authentication required";
/// reqwest 包装 SOCKS 握手错误时的前缀
const SOCKS_ERROR_PREFIX: &str = "socks connect error: ";
/// SOCKS5 握手中表示认证失败的错误
const SOCKS_AUTH_ERRORS: [&str; 3] = [
    "Password auth failure",
    "Authorization required",
    "No acceptable auth methods",
];

fn classify(err: reqwest::Error) -> ProbeError {
    // 顶层错误的文本包含目标URL，只检查内层来源
    let mut source = err.source();
    while let Some(e) = source {
        if is_proxy_auth_error(&e.to_string()) {
            return ProbeError::new(FailureKind::Auth, err.to_string());
        }
        source = e.source();
    }
    err.into()
}

fn is_proxy_auth_error(text: &str) -> bool {
    if text == TUNNEL_AUTH_REQUIRED {
        return true;
    }
    text.strip_prefix(SOCKS_ERROR_PREFIX)
        .map_or(false, |socks| SOCKS_AUTH_ERRORS.iter().any(|m| socks.starts_with(m)))
}

/// 解析 `{"ip": ..}`、`{"origin": ..}` 或纯文本IP
fn parse_exit_ip(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        let field = value.get("ip").or_else(|| value.get("origin"))?.as_str()?;
        // httpbin 经过多层代理时返回 "a, b"
        let first = field.split(',').next()?.trim();
        return first.parse::<IpAddr>().ok().map(|ip| ip.to_string());
    }
    text.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}
