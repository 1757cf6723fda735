use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::orchestrator::{BatchSummary, Orchestrator};
use crate::snapshot::Snapshot;

/// 检查关闭时多久重新读取一次设置
const IDLE_POLL: Duration = Duration::from_secs(5);

/// 周期性地验证整个代理池
pub struct HealthScheduler {
    orchestrator: Orchestrator,
    snapshot_path: Option<PathBuf>,
    idle_poll: Duration,
}

impl HealthScheduler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            snapshot_path: None,
            idle_poll: IDLE_POLL,
        }
    }

    /// 每轮检查后保存快照
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("健康检查任务已启动");
        loop {
            // 间隔在每轮开始时读取，设置更新在下一轮生效
            let interval = self
                .orchestrator
                .settings()
                .current()
                .await
                .health_check_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval.unwrap_or(self.idle_poll)) => {}
            }
            if interval.is_none() {
                continue;
            }
            // 一轮跑完才开始计时下一轮，不会重叠
            match self.run_once(&shutdown).await {
                Ok(summary) => info!(
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "健康检查完成"
                ),
                Err(e) => error!(error = %e, "健康检查失败"),
            }
        }
        info!("健康检查任务已停止");
    }

    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<BatchSummary> {
        let summary = self.orchestrator.verify_all(shutdown.child_token()).await?;
        if let Some(path) = &self.snapshot_path {
            let orchestrator = &self.orchestrator;
            Snapshot::capture(orchestrator.store(), orchestrator.settings(), orchestrator.logs())
                .await
                .save(path)
                .await?;
        }
        Ok(summary)
    }
}
