//! ProxyVault - A proxy pool manager with batch verification
//!
//! This library wires the engine, the HTTP API and the health scheduler
//! into one server.

// 重导出core库
pub use proxyvault_api::{ApiServer, AppState};
pub use proxyvault_core::{
    init_logger, BatchSummary, Config, Error, HealthScheduler, LogRecorder, Orchestrator, Proxy,
    ProxyStore, Result, Settings, SettingsStore, Snapshot, Verifier,
};

// 可选的命令行界面
#[cfg(feature = "ui")]
pub mod ui;
