//! ProxyVault Core - proxy pool verification and lifecycle engine
//!
//! This library owns the proxy records, runs bounded batch health checks
//! through HTTP/SOCKS5 proxies and keeps the derived speed, exit IP, visit
//! and failure logs.

// 导出模块
pub mod codec;
pub mod config;
pub mod error;
pub mod lease;
pub mod logs;
pub mod orchestrator;
pub mod proxy;
pub mod scheduler;
pub mod settings;
pub mod snapshot;
pub mod store;
pub mod verifier;

// 从模块导出核心类型
pub use codec::{ImportReport, LineError, LineErrorKind, ParseOutcome};
pub use config::{Config, ServerSettings, StorageSettings};
pub use error::{Error, FailureKind, ProbeError, Result};
pub use lease::{LeaseGuard, LeaseTable};
pub use logs::{
    FailureLog, FailureSample, FailureStats, IpLog, IpSample, LogArchive, LogEntry, LogPayload,
    LogQuery, LogRecorder, PayloadFilter, SortOrder, SpeedLog, SpeedSample, VisitLog,
    VisitSample,
};
pub use orchestrator::{BatchHandle, BatchItemError, BatchSummary, Orchestrator, SkipReason};
pub use proxy::{Health, Proxy, ProxyId, ProxyKind, ProxyPatch, ProxySpec, VerificationState};
pub use scheduler::HealthScheduler;
pub use settings::{Settings, SettingsStore};
pub use snapshot::Snapshot;
pub use store::{Page, PageRequest, ProxyFilter, ProxyStore, SortKey};
pub use verifier::{Probe, ProbeTarget, VerificationResult, Verifier};

/// Initialize the logger with default settings
pub fn init_logger() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}
