use anyhow::Result;
use proxyvault_api::ApiServer;
use proxyvault_core::{init_logger, Config, HealthScheduler, Orchestrator, Snapshot};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const VERSION: &str = "v0.1.0";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    init_logger();

    info!("ProxyVault API Server starting... {}", VERSION);

    let config = Config::load_or_create("config.toml")?;
    let orchestrator = Orchestrator::from_config(&config).await?;
    info!(proxies = orchestrator.store().len().await, "代理池已就绪");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let cancel = CancellationToken::new();

    let mut scheduler = HealthScheduler::new(orchestrator.clone());
    if let Some(path) = config.storage.snapshot_path() {
        scheduler = scheduler.with_snapshot(path);
    }
    let scheduler_handle = scheduler.start(cancel.clone());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("接收到终止信号，正在关闭服务器...");
            signal_cancel.cancel();
            let _ = shutdown_tx.send(());
        }
    });

    let api_server = ApiServer::new(orchestrator.clone(), config.server.clone());
    let served = api_server.run_with_shutdown(shutdown_rx).await;

    cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        error!("健康检查任务异常退出: {}", e);
    }
    if let Some(path) = config.storage.snapshot_path() {
        let snapshot = Snapshot::capture(
            orchestrator.store(),
            orchestrator.settings(),
            orchestrator.logs(),
        )
        .await;
        if let Err(e) = snapshot.save(&path).await {
            error!("保存快照失败: {}", e);
        }
    }
    orchestrator.logs().close();

    served?;
    info!("ProxyVault API Server 已停止");
    Ok(())
}
