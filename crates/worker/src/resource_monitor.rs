use std::sync::{Arc, Mutex};

use stellar_domain::NodeStatusSnapshot;
use sysinfo::System;
use tokio::time::Instant;
use tracing::debug;

/// 采集本机CPU、内存用于心跳快照
#[derive(Clone)]
pub struct ResourceMonitor {
    system: Arc<Mutex<System>>,
    started_at: Instant,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            started_at: Instant::now(),
        }
    }

    /// 刷新并返回资源快照，采集在阻塞线程池中执行
    pub async fn snapshot(&self, running_tasks: u32, queued_tasks: u32) -> NodeStatusSnapshot {
        let system = Arc::clone(&self.system);
        let sampled = tokio::task::spawn_blocking(move || {
            let mut system = match system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = f64::from(system.global_cpu_usage());
            (cpu, system.used_memory() / (1024 * 1024))
        })
        .await;

        let (cpu_percent, memory_mb) = match sampled {
            Ok((cpu, memory)) => (sanitize_cpu(cpu), memory),
            Err(e) => {
                debug!("采集节点资源失败: {}", e);
                (0.0, 0)
            }
        };

        NodeStatusSnapshot {
            cpu_percent,
            memory_mb,
            running_tasks,
            queued_tasks,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// 首次采样或平台不支持时可能得到NaN或超出范围的值
fn sanitize_cpu(cpu: f64) -> f64 {
    if cpu.is_finite() {
        cpu.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
