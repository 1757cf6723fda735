use anyhow::Result;
use clap::Parser;
use colored::*;
use proxyvault_cli::{check, download_export, normalize, print_line_errors, Cli, Command};
use proxyvault_core::{init_logger, Config};
use tracing::{error, info};

const VERSION: &str = "v0.1.0";
const BANNER: &str = r#"
╔═╗╦═╗╔═╗═╗ ╦╦ ╦╦  ╦╔═╗╦ ╦╦ ╔╦╗
╠═╝╠╦╝║ ║╔╩╦╝╚╦╝╚╗╔╝╠═╣║ ║║  ║
╩  ╩╚═╚═╝╩ ╚═ ╩  ╚╝ ╩ ╩╚═╝╩═╝╩
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    init_logger();

    // 加载配置，文件不存在时使用默认配置
    let config = if cli.config.exists() {
        match Config::from_file(&cli.config) {
            Ok(cfg) => {
                info!("配置已从 {} 加载", cli.config.display());
                cfg
            }
            Err(e) => {
                error!("加载配置失败: {}", e);
                Config::default()
            }
        }
    } else {
        info!("使用默认配置");
        Config::default()
    };

    match cli.command {
        Command::Check {
            file,
            concurrency,
            kind,
            output,
        } => {
            println!("{} {}", BANNER.bright_cyan(), VERSION.bright_black());
            let mut settings = config.verify;
            if let Some(kind) = kind {
                settings.default_kind = kind;
            }
            check(&file, settings, concurrency, output.as_deref()).await?;
        }
        Command::Normalize { file, kind, output } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let (text, report) = normalize(&raw, kind.unwrap_or(config.verify.default_kind))?;
            print_line_errors(&report);
            match output {
                Some(path) => {
                    tokio::fs::write(&path, text).await?;
                    eprintln!(
                        "{} {} -> {}",
                        "已规范化".green().bold(),
                        report.imported,
                        path.display()
                    );
                }
                None => print!("{}", text),
            }
        }
        Command::Export { server, ids, dir } => {
            let client = reqwest::Client::new();
            let path = download_export(&client, &server, &ids, &dir).await?;
            println!("{} {}", "已保存到".green().bold(), path.display());
        }
    }

    Ok(())
}
