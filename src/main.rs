use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use stellar::{AppMode, Application, ShutdownManager};
use stellar_config::{AppConfig, LogFormat};
use stellar_domain::EngineRegistry;
use stellar_infrastructure::{init_logging, init_metrics};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_NODE_NAME: &str = "stellar-node";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("stellar")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式安全扫描任务编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时依次查找默认位置"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["coordinator", "node", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("复用已注册的节点ID (仅节点代理使用)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()?;

    let mut config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("默认位置")
        )
    })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    )?;

    if let Some(id) = matches.get_one::<String>("node-id") {
        config.agent.node_id = Some(id.clone());
    }
    if config.agent.name == DEFAULT_NODE_NAME {
        match hostname::get() {
            Ok(name) => config.agent.name = name.to_string_lossy().into_owned(),
            Err(e) => warn!("读取主机名失败，使用默认节点名称: {e}"),
        }
    }

    info!("启动分布式扫描任务编排系统");
    info!("运行模式: {:?}", mode);

    init_metrics(&config.observability)?;

    // 扫描引擎由嵌入方注册，独立运行时只使用内置的配置校验
    let app = Arc::new(Application::new(config, mode, EngineRegistry::new()).await?);

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
                shutdown_manager.shutdown().await;
            }
        })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        _ = wait_for_internal_shutdown(&shutdown_manager) => {}
    }

    info!("开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式扫描任务编排系统已退出");
    Ok(())
}

/// 应用自身出错触发的关闭
async fn wait_for_internal_shutdown(manager: &ShutdownManager) {
    let mut rx = manager.subscribe().await;
    let _ = rx.recv().await;
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
