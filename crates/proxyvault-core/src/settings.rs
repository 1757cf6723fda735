use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Error, Result};
use crate::proxy::ProxyKind;
use crate::verifier::ProbeTarget;

/// 单批次允许的最大并发
pub const MAX_CONCURRENCY: usize = 256;
/// 单次探测允许的最长超时（秒）
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// 运行时验证设置，通过 `PUT /api/settings` 整体替换
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// 回显调用方IP的测试目标
    #[serde(default = "default_target_url")]
    pub target_url: String,
    /// 单个代理的探测超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 批量验证的并发数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 健康检查间隔（秒），0 表示关闭
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// 导入时没有协议前缀的代理类型
    #[serde(default)]
    pub default_kind: ProxyKind,
}

fn default_target_url() -> String {
    "http://httpbin.org/ip".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_concurrency() -> usize {
    10
}
fn default_health_check_interval() -> u64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            timeout_secs: default_timeout_secs(),
            concurrency: default_concurrency(),
            health_check_interval_secs: default_health_check_interval(),
            default_kind: ProxyKind::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.target_url)
            .map_err(|e| Error::Validation(format!("invalid target_url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(
                "target_url must use http or https".to_string(),
            ));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(Error::Validation(format!(
                "timeout_secs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(Error::Validation(format!(
                "concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            url: self.target_url.clone(),
            timeout: self.timeout(),
        }
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.health_check_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// 设置存储，读者总是拿到完整的一份快照
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
        })
    }

    pub async fn current(&self) -> Settings {
        self.inner.read().await.clone()
    }

    /// 整体替换设置
    pub async fn replace(&self, settings: Settings) -> Result<Settings> {
        settings.validate()?;
        let mut guard = self.inner.write().await;
        *guard = settings.clone();
        info!(
            target_url = %settings.target_url,
            timeout_secs = settings.timeout_secs,
            concurrency = settings.concurrency,
            "设置已更新"
        );
        Ok(settings)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Settings::default())),
        }
    }
}
