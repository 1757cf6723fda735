//! UI相关功能模块
//!
//! 服务启动和关闭时的彩色终端输出

use colored::*;
use proxyvault_core::Config;

/// 打印横幅
pub fn print_banner(version: &str) {
    println!(
        "{}\n{}",
        r#"
╔═╗╦═╗╔═╗═╗ ╦╦ ╦╦  ╦╔═╗╦ ╦╦ ╔╦╗
╠═╝╠╦╝║ ║╔╩╦╝╚╦╝╚╗╔╝╠═╣║ ║║  ║
╩  ╩╚═╚═╝╩ ╚═ ╩  ╚╝ ╩ ╩╚═╝╩═╝╩
        "#
        .cyan()
        .bold(),
        format!("Version: {}", version).yellow()
    );
}

/// 打印启动配置摘要
pub fn print_config(config: &Config) {
    let verify = &config.verify;
    println!(
        "{} {}:{}",
        "API地址:".green().bold(),
        config.server.bind_address,
        config.server.bind_port
    );
    println!(
        "{} {} ({} {}s, {} {})",
        "测试目标:".green().bold(),
        verify.target_url.cyan(),
        "超时".bright_black(),
        verify.timeout_secs,
        "并发".bright_black(),
        verify.concurrency
    );
    match verify.health_check_interval() {
        Some(interval) => println!(
            "{} {} {}",
            "健康检查已开启,间隔:".green().bold(),
            interval.as_secs().to_string().yellow().bold(),
            "秒".green().bold()
        ),
        None => print_warning("健康检查已关闭"),
    }
    match &config.storage.snapshot_path {
        Some(path) => print_info(&format!("快照文件: {}", path)),
        None => print_warning("未配置快照文件，数据只保存在内存中"),
    }
}

/// 打印成功消息
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// 打印错误消息
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// 打印警告消息
pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg);
}

/// 打印信息消息
pub fn print_info(msg: &str) {
    println!("{} {}", "i".blue().bold(), msg);
}
