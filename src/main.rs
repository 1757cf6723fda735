use anyhow::Result;
use proxyvault::{init_logger, ApiServer, Config, HealthScheduler, Orchestrator, Snapshot};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(feature = "ui")]
use proxyvault::ui;

const VERSION: &str = "v0.1.0";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    init_logger();

    #[cfg(feature = "ui")]
    ui::print_banner(VERSION);
    info!("ProxyVault starting... {}", VERSION);

    // 加载配置
    let config = match Config::load_or_create("config.toml") {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("加载配置文件失败: {}", e);
            #[cfg(feature = "ui")]
            ui::print_error(&format!("加载配置文件失败: {}", e));
            return Ok(());
        }
    };
    #[cfg(feature = "ui")]
    ui::print_config(&config);

    let orchestrator = Orchestrator::from_config(&config).await?;
    info!(proxies = orchestrator.store().len().await, "代理池已就绪");

    // API服务器用广播通道关闭，健康检查用取消令牌
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let cancel = CancellationToken::new();

    let mut scheduler = HealthScheduler::new(orchestrator.clone());
    if let Some(path) = config.storage.snapshot_path() {
        scheduler = scheduler.with_snapshot(path);
    }
    let scheduler_handle = scheduler.start(cancel.clone());

    let api_server = ApiServer::new(orchestrator.clone(), config.server.clone());
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run_with_shutdown(shutdown_rx).await {
            error!("服务器错误: {}", e);
        }
    });

    #[cfg(feature = "ui")]
    ui::print_success("服务已启动，按 Ctrl+C 退出");

    // 等待Ctrl+C信号或服务器退出
    let server_exited = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("接收到终止信号，正在关闭服务器...");
            false
        }
        _ = &mut server_handle => {
            error!("API服务器意外退出，正在关闭...");
            true
        }
    };

    let _ = shutdown_tx.send(());
    cancel.cancel();
    if let Err(e) = scheduler_handle.await {
        error!("健康检查任务异常退出: {}", e);
    }
    if !server_exited {
        let _ = server_handle.await;
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

    #[cfg(feature = "ui")]
    ui::print_success("服务器已关闭");
    info!("ProxyVault 已停止");
    Ok(())
}
