use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::logs::{LogArchive, LogRecorder};
use crate::proxy::Proxy;
use crate::settings::{Settings, SettingsStore};
use crate::store::ProxyStore;

const SNAPSHOT_VERSION: u32 = 1;

/// 代理池、设置与日志的JSON快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub settings: Settings,
    pub proxies: Vec<Proxy>,
    /// 没有日志的旧快照按空日志读取
    #[serde(default)]
    pub logs: LogArchive,
}

impl Snapshot {
    pub async fn capture(store: &ProxyStore, settings: &SettingsStore, logs: &LogRecorder) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            settings: settings.current().await,
            proxies: store.all().await,
            logs: logs.archive().await,
        }
    }

    /// 先写临时文件再重命名
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = tmp_path(path);
        fs::write(&tmp, json)
            .await
            .map_err(|e| storage(path, e))?;
        fs::rename(&tmp, path).await.map_err(|e| storage(path, e))?;
        info!(
            path = %path.display(),
            proxies = self.proxies.len(),
            logs = self.logs.len(),
            "快照已保存"
        );
        Ok(())
    }

    /// 文件不存在时返回 None
    pub async fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage(path, e)),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                path.display()
            )));
        }
        Ok(Some(snapshot))
    }

    /// 写回存储，返回恢复的代理数
    pub async fn restore_into(
        self,
        store: &ProxyStore,
        settings: &SettingsStore,
        logs: &LogRecorder,
    ) -> usize {
        if let Err(e) = settings.replace(self.settings).await {
            warn!(error = %e, "快照中的设置无效，保留当前设置");
        }
        match logs.restore(self.logs).await {
            Ok(entries) => info!(entries, "已从快照恢复日志"),
            Err(e) => warn!(error = %e, "恢复日志失败"),
        }
        let restored = store.restore(self.proxies).await;
        info!(restored, "已从快照恢复代理");
        restored
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn storage(path: &Path, err: std::io::Error) -> Error {
    Error::Storage(format!("{}: {}", path.display(), err))
}
