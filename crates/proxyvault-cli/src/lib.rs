//! ProxyVault CLI - Command Line Interface for the ProxyVault proxy pool manager
//!
//! `check` and `normalize` work on a local proxy list without a server,
//! `export` downloads the pool from a running API server.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use proxyvault_core::{
    codec, BatchSummary, ImportReport, LineError, LineErrorKind, LogRecorder, Orchestrator,
    Proxy, ProxyKind, ProxyStore, Settings, SettingsStore, VerificationState, Verifier,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

/// 导出全部时的默认文件名
pub const DEFAULT_EXPORT_ALL: &str = "proxies.txt";
/// 导出选中代理时的默认文件名
pub const DEFAULT_EXPORT_SELECTED: &str = "selected_proxies.txt";

#[derive(Debug, Parser)]
#[command(name = "proxyvault-cli", version, about = "ProxyVault proxy pool tools")]
pub struct Cli {
    /// 配置文件
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

/// CLI命令枚举
#[derive(Debug, Subcommand)]
pub enum Command {
    /// 验证代理列表文件中的所有代理
    Check {
        file: PathBuf,
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// 没有协议前缀的行使用的代理类型
        #[arg(short, long)]
        kind: Option<ProxyKind>,
        /// 把验证通过的代理写入文件
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 规范化并去重代理列表
    Normalize {
        file: PathBuf,
        #[arg(short, long)]
        kind: Option<ProxyKind>,
        /// 输出文件，缺省时打印到标准输出
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 从API服务器下载导出文件
    Export {
        #[arg(short, long, default_value = "http://127.0.0.1:3000")]
        server: String,
        /// 只导出这些ID，逗号分隔
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// 保存目录
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

/// 解析、去重并重新输出代理列表
pub fn normalize(raw: &str, default_kind: ProxyKind) -> Result<(String, ImportReport)> {
    let parsed = codec::parse(raw, default_kind);
    let mut report = ImportReport {
        imported: 0,
        line_errors: parsed.line_errors,
    };
    let mut seen = HashSet::new();
    let mut proxies = Vec::new();
    for (line, spec) in parsed.records {
        if seen.insert(spec.dedup_key()) {
            proxies.push(Proxy::new(spec));
        } else {
            report.line_errors.push(LineError {
                line,
                kind: LineErrorKind::Duplicate,
                reason: "duplicate of an earlier line".to_string(),
            });
        }
    }
    report.line_errors.sort_by_key(|e| e.line);
    report.imported = proxies.len();
    Ok((codec::serialize(&proxies)?, report))
}

/// 离线验证一个代理列表文件
pub async fn check(
    file: &Path,
    settings: Settings,
    concurrency: Option<usize>,
    output: Option<&Path>,
) -> Result<BatchSummary> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("无法读取代理文件 {}", file.display()))?;

    let default_kind = settings.default_kind;
    let orchestrator = Orchestrator::new(
        ProxyStore::new(),
        LogRecorder::default(),
        SettingsStore::new(settings)?,
        Arc::new(Verifier::new()),
    );
    let report = orchestrator
        .store()
        .import(codec::parse(&raw, default_kind))
        .await;
    print_line_errors(&report);

    let ids = orchestrator.store().ids().await;
    if ids.is_empty() {
        bail!("{} 中没有可用的代理", file.display());
    }

    info!("开始测试代理...");
    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    let mut events = orchestrator.subscribe();
    let progress = pb.clone();
    let listener = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) => progress.inc(1),
                Err(RecvError::Lagged(n)) => progress.inc(n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let summary = orchestrator.verify_batch(&ids, concurrency).await?;
    listener.abort();
    pb.finish_and_clear();

    // 按延迟排序，失败的排在最后
    let mut all = orchestrator.store().all().await;
    all.sort_by_key(|p| (p.health.latency_ms.is_none(), p.health.latency_ms));
    for proxy in &all {
        print_result(proxy);
    }
    println!(
        "\n{} {}  {} {}  {} {}",
        "成功:".green().bold(),
        summary.succeeded,
        "失败:".red().bold(),
        summary.failed,
        "跳过:".yellow().bold(),
        summary.skipped
    );

    if let Some(path) = output {
        let verified: Vec<Proxy> = all
            .into_iter()
            .filter(|p| p.state() == VerificationState::Verified)
            .collect();
        tokio::fs::write(path, codec::serialize(&verified)?)
            .await
            .with_context(|| format!("无法写入 {}", path.display()))?;
        println!("{} {}", "可用代理已写入".green(), path.display());
    }
    Ok(summary)
}

fn print_result(proxy: &Proxy) {
    match proxy.health.latency_ms {
        Some(latency) => {
            let latency_str = match latency {
                0..=100 => latency.to_string().green(),
                101..=300 => latency.to_string().yellow(),
                _ => latency.to_string().red(),
            };
            println!(
                "{} {} - {}ms {}",
                "✓".green().bold(),
                proxy.to_string().cyan(),
                latency_str,
                proxy.exit_ip.as_deref().unwrap_or_default().bright_black()
            );
        }
        None => println!(
            "{} {} - {}",
            "✗".red().bold(),
            proxy.to_string().cyan(),
            proxy
                .health
                .last_failure
                .map(|k| k.to_string())
                .unwrap_or_else(|| "未知错误".to_string())
        ),
    }
}

pub fn print_line_errors(report: &ImportReport) {
    for err in &report.line_errors {
        let kind = match err.kind {
            LineErrorKind::Malformed => "格式错误".red(),
            LineErrorKind::Duplicate => "重复".yellow(),
        };
        eprintln!("{} {}: {} ({})", "第".bright_black(), err.line, kind, err.reason);
    }
}

/// 从 Content-Disposition 中取文件名，只保留最后一段路径
fn filename_from_disposition(value: &str) -> Option<String> {
    let raw = value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;
    let name = raw.trim_matches('"');
    let name = Path::new(name).file_name()?.to_str()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// 下载导出文件并返回保存路径
pub async fn download_export(
    client: &reqwest::Client,
    server: &str,
    ids: &[String],
    dir: &Path,
) -> Result<PathBuf> {
    let base = server.trim_end_matches('/');
    let (url, default_name) = if ids.is_empty() {
        (format!("{}/api/export/all", base), DEFAULT_EXPORT_ALL)
    } else {
        (
            format!("{}/api/export/selected?ids={}", base, ids.join(",")),
            DEFAULT_EXPORT_SELECTED,
        )
    };

    let resp = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("无法连接 {}", url))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("服务器返回 {}: {}", status, body.trim());
    }

    let filename = resp
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .unwrap_or_else(|| default_name.to_string());
    let body = resp.bytes().await?;

    let path = dir.join(filename);
    tokio::fs::write(&path, &body)
        .await
        .with_context(|| format!("无法写入 {}", path.display()))?;
    info!(path = %path.display(), bytes = body.len(), "导出文件已保存");
    Ok(path)
}
