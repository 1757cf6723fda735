use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use crate::error::{Error, Result};
use crate::settings::Settings;
use tracing::{info, warn};

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP服务设置
    #[serde(default)]
    pub server: ServerSettings,
    /// 初始验证设置
    #[serde(default)]
    pub verify: Settings,
    /// 存储设置
    #[serde(default)]
    pub storage: StorageSettings,
}

/// HTTP服务设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// 绑定地址
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// 绑定端口
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// 是否启用CORS
    #[serde(default)]
    pub enable_cors: bool,
}

fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_bind_port() -> u16 { 3000 }

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            enable_cors: false,
        }
    }
}

/// 存储设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// 快照文件路径，未设置时只保存在内存中
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// 每类日志最多保留的条数，0 表示不限
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_max_log_entries() -> usize { 100_000 }

impl StorageSettings {
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot_path.as_ref().map(PathBuf::from)
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("无法读取配置文件: {}", e);
                return Err(Error::Configuration(format!("无法读取配置文件: {}", e)));
            }
        };

        let config = toml::from_str::<Self>(&content)?;
        config.validate()?;
        info!(
            bind = %format!("{}:{}", config.server.bind_address, config.server.bind_port),
            target_url = %config.verify.target_url,
            "成功读取配置"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.verify
            .validate()
            .map_err(|e| Error::Configuration(format!("[verify] {}", e)))
    }

    /// 加载配置文件，不存在时写入默认配置
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }
        let config = Self::default();
        config.save_to_file(path)?;
        info!("默认配置已保存到 {}", path.display());
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
