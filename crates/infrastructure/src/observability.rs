use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use stellar_config::{LogFormat, ObservabilityConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别
pub fn init_logging(log_level: &str, log_format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}

/// 启动Prometheus指标导出
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }
    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;

    describe_metrics();
    info!("指标导出已启动: http://{addr}/metrics");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("stellar_tasks_created_total", "已创建的任务数");
    metrics::describe_counter!("stellar_tasks_dispatched_total", "已分发到节点的任务数");
    metrics::describe_counter!("stellar_tasks_finished_total", "进入终态的任务数");
    metrics::describe_counter!("stellar_tasks_retried_total", "重新排队的任务数");
    metrics::describe_counter!("stellar_tasks_reclaimed_total", "因节点失联被回收的任务数");
    metrics::describe_counter!("stellar_claim_conflicts_total", "认领竞争失败次数");
    metrics::describe_counter!("stellar_heartbeats_total", "收到的心跳数");
    metrics::describe_counter!("stellar_background_errors_total", "后台循环中的错误数");
    metrics::describe_gauge!("stellar_nodes_online", "在线节点数");
    metrics::describe_histogram!("stellar_dispatch_tick_seconds", "单次分发循环耗时");
}
