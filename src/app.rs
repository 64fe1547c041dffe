use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use stellar_config::AppConfig;
use stellar_dispatcher::{
    NodeFailureDetector, NodeRegistry, ResultHandler, ResultIngestor, RuntimeSettings,
    TaskDispatcher, TaskManager, TimeoutSweeper,
};
use stellar_domain::{EngineRegistry, FastStore, KeySpace, TaskType};
use stellar_infrastructure::{create_fast_store, create_repositories, Repositories};
use stellar_worker::{
    DirectResultSink, FastStoreResultSink, LocalCoordinator, NodeAgent, ResultSink,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 注册中心、任务分发与各巡检循环
    Coordinator,
    /// 仅运行节点代理
    Node,
    All,
}

impl AppMode {
    fn runs_coordinator(&self) -> bool {
        matches!(self, AppMode::Coordinator | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coordinator" => Ok(AppMode::Coordinator),
            "node" => Ok(AppMode::Node),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 调度端的后台循环
struct CoordinatorServices {
    dispatcher: Arc<TaskDispatcher>,
    detector: Arc<NodeFailureDetector>,
    sweeper: Arc<TimeoutSweeper>,
    ingestor: Arc<ResultIngestor>,
    handles: Vec<JoinHandle<()>>,
}

impl CoordinatorServices {
    async fn stop(self) {
        self.dispatcher.stop();
        self.detector.stop();
        self.sweeper.stop();
        self.ingestor.stop();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("后台循环异常退出: {e}");
            }
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn FastStore>,
    keys: KeySpace,
    engines: Arc<EngineRegistry>,
    registry: Arc<NodeRegistry>,
    manager: Arc<TaskManager>,
    handler: Arc<ResultHandler>,
}

impl Application {
    /// 按配置连接快速存储与持久化存储
    pub async fn new(config: AppConfig, mode: AppMode, engines: EngineRegistry) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        let store = create_fast_store(&config.fast_store)
            .await
            .context("连接快速存储失败")?;
        let repos = create_repositories(&config.database)
            .await
            .context("连接持久化存储失败")?;
        Self::assemble(config, mode, store, repos, engines).await
    }

    /// 在给定的存储上组装各组件
    ///
    /// 快速存储中的运行时参数先写入缺省值，再覆盖到文件配置上。
    pub async fn assemble(
        mut config: AppConfig,
        mode: AppMode,
        store: Arc<dyn FastStore>,
        repos: Repositories,
        engines: EngineRegistry,
    ) -> Result<Self> {
        let keys = KeySpace::new(config.fast_store.key_prefix.clone());

        let settings = RuntimeSettings::new(store.clone(), keys.clone());
        settings
            .seed_defaults(&config.node_manager, &config.task_manager)
            .await
            .context("写入运行时参数失败")?;
        settings
            .load(&mut config.node_manager, &mut config.task_manager)
            .await
            .context("加载运行时参数失败")?;

        let engines = Arc::new(engines);
        let registry = Arc::new(NodeRegistry::new(
            repos.nodes.clone(),
            store.clone(),
            keys.clone(),
            config.node_manager.clone(),
        ));
        let manager = Arc::new(TaskManager::new(
            repos.tasks.clone(),
            repos.results.clone(),
            store.clone(),
            registry.clone(),
            engines.clone(),
            config.task_manager.clone(),
        ));
        let handler = Arc::new(ResultHandler::new(repos.results.clone(), manager.clone()));

        Ok(Self {
            config,
            mode,
            store,
            keys,
            engines,
            registry,
            manager,
            handler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn result_handler(&self) -> &Arc<ResultHandler> {
        &self.handler
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        let coordinator = if self.mode.runs_coordinator() {
            Some(self.start_coordinator().await?)
        } else {
            None
        };

        let runs_agent = match self.mode {
            AppMode::Node => true,
            AppMode::All => self.config.agent.enabled,
            AppMode::Coordinator => false,
        };
        let agent = if runs_agent {
            match self.start_agent().await {
                Ok(agent) => Some(agent),
                Err(e) => {
                    if let Some(services) = coordinator {
                        services.stop().await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，停止各组件");

        // 先停节点，未完成的任务留给调度端回收
        if let Some(agent) = agent {
            agent.stop().await;
        }
        if let Some(services) = coordinator {
            services.stop().await;
        }

        info!("应用程序已停止");
        Ok(())
    }

    async fn start_coordinator(&self) -> Result<CoordinatorServices> {
        let nodes = self
            .registry
            .warm_cache()
            .await
            .context("加载节点缓存失败")?;
        let recovered = self
            .manager
            .recover_queues()
            .await
            .context("恢复任务队列失败")?;
        info!("调度端启动: 已知节点 {} 个，恢复排队任务 {} 个", nodes, recovered);

        let dispatcher = Arc::new(TaskDispatcher::new(self.manager.clone()));
        let detector = Arc::new(NodeFailureDetector::new(self.registry.clone()));
        let sweeper = Arc::new(TimeoutSweeper::new(self.manager.clone()));
        let ingestor = Arc::new(ResultIngestor::new(self.handler.clone(), self.store.clone()));

        let handles = vec![
            dispatcher.start(),
            detector.start(),
            sweeper.start(),
            ingestor.start(),
        ];

        Ok(CoordinatorServices {
            dispatcher,
            detector,
            sweeper,
            ingestor,
            handles,
        })
    }

    async fn start_agent(&self) -> Result<Arc<NodeAgent>> {
        if !self.config.agent.enabled {
            return Err(anyhow::anyhow!("节点模式需要启用 [agent] 配置"));
        }

        // 只声明本进程注册了引擎的任务类型
        let mut config = self.config.agent.clone();
        let (supported, missing): (Vec<String>, Vec<String>) =
            config.enabled_task_types.iter().cloned().partition(|name| {
                name.parse::<TaskType>()
                    .is_ok_and(|task_type| self.engines.engine(task_type).is_ok())
            });
        if !missing.is_empty() {
            warn!("以下任务类型没有注册扫描引擎，不接受分配: {:?}", missing);
        }
        if supported.is_empty() {
            return Err(anyhow::anyhow!("节点没有可用的扫描引擎"));
        }
        config.enabled_task_types = supported;

        let sink: Arc<dyn ResultSink> = match config.result_handoff.as_str() {
            "direct" => Arc::new(DirectResultSink::new(self.handler.clone())),
            _ => Arc::new(FastStoreResultSink::new(self.store.clone(), &self.keys)),
        };

        let agent = Arc::new(NodeAgent::new(
            config,
            Arc::new(LocalCoordinator::new(self.registry.clone())),
            self.store.clone(),
            self.keys.clone(),
            self.engines.clone(),
            sink,
        ));
        agent.start().await.context("启动节点代理失败")?;
        Ok(agent)
    }
}
