use std::sync::Arc;
use std::time::Duration;

use stellar_config::AgentConfig;
use stellar_domain::{EngineRegistry, TaskStatus, TaskType};
use stellar_testing_utils::{
    agent_config, wait_for, EngineBehavior, ScriptedEngine, TaskSpecBuilder, TestCluster,
};
use stellar_worker::{
    DirectResultSink, FastStoreResultSink, LocalCoordinator, NodeAgent, ResultSink,
};

const WAIT: Duration = Duration::from_secs(5);

fn agent_with_sink(
    cluster: &TestCluster,
    config: AgentConfig,
    engine: Arc<ScriptedEngine>,
    sink: Arc<dyn ResultSink>,
) -> Arc<NodeAgent> {
    let engines = EngineRegistry::new().with_engine(engine);
    Arc::new(NodeAgent::new(
        config,
        Arc::new(LocalCoordinator::new(cluster.registry.clone())),
        cluster.fast_store(),
        cluster.keys(),
        Arc::new(engines),
        sink,
    ))
}

fn direct_agent(
    cluster: &TestCluster,
    config: AgentConfig,
    engine: Arc<ScriptedEngine>,
) -> Arc<NodeAgent> {
    let sink = Arc::new(DirectResultSink::new(cluster.handler.clone()));
    agent_with_sink(cluster, config, engine, sink)
}

/// 等节点心跳生效后创建并分发一个端口扫描任务
async fn dispatch_port_scan(cluster: &TestCluster, builder: TaskSpecBuilder) -> String {
    assert!(
        wait_for(
            || async {
                !cluster
                    .registry
                    .list_eligible(TaskType::PortScan)
                    .await
                    .unwrap()
                    .is_empty()
            },
            WAIT,
        )
        .await
    );
    let task_id = cluster.manager.create_task(builder.build()).await.unwrap();
    let report = cluster.manager.dispatch_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
    task_id
}

#[tokio::test]
async fn test_agent_executes_assignment_and_completes_task() {
    let cluster = TestCluster::new();
    let engine = ScriptedEngine::open_port();
    let agent = direct_agent(&cluster, agent_config("scanner-1", 9001), engine.clone());
    let node_id = agent.start().await.unwrap();

    let task_id = dispatch_port_scan(&cluster, TaskSpecBuilder::port_scan()).await;
    assert!(cluster.wait_for_status(&task_id, TaskStatus::Completed, WAIT).await);

    let task = cluster.task(&task_id).await;
    assert_eq!(task.progress, 100);
    assert_eq!(task.assigned_node.as_deref(), Some(node_id.as_str()));

    let results = cluster.manager.task_results(&task_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].data.len(), 1);
    assert_eq!(engine.calls(), 1);
    assert_eq!(engine.attempts(), vec![1]);

    // 槽位已释放
    assert!(wait_for(|| async { agent.running_tasks().await == 0 }, WAIT).await);
    assert_eq!(cluster.registry.running_count(&node_id).await.unwrap(), 0);

    agent.stop().await;
    assert!(!agent.is_running().await);
}

#[tokio::test]
async fn test_agent_retries_failed_engine_until_success() {
    let cluster = TestCluster::new();
    let engine = Arc::new(ScriptedEngine::new(
        TaskType::PortScan,
        vec![
            EngineBehavior::Fail("connection reset".to_string()),
            EngineBehavior::Succeed(stellar_domain::EngineData::Empty),
        ],
    ));
    let agent = direct_agent(&cluster, agent_config("scanner-1", 9001), engine.clone());
    agent.start().await.unwrap();

    let task_id = dispatch_port_scan(&cluster, TaskSpecBuilder::port_scan()).await;
    assert!(
        wait_for(
            || async { cluster.task(&task_id).await.status == TaskStatus::Queued },
            WAIT
        )
        .await
    );
    let task = cluster.task(&task_id).await;
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.last_error.as_deref().map(|e| e.contains("connection reset")), Some(true));

    cluster.manager.dispatch_once().await.unwrap();
    assert!(cluster.wait_for_status(&task_id, TaskStatus::Completed, WAIT).await);
    assert_eq!(engine.attempts(), vec![1, 2]);
    assert_eq!(cluster.manager.task_results(&task_id).await.unwrap().len(), 2);

    agent.stop().await;
}

#[tokio::test]
async fn test_cancel_request_stops_running_engine() {
    let cluster = TestCluster::new();
    let engine = ScriptedEngine::always(TaskType::PortScan, EngineBehavior::BlockUntilCanceled);
    let agent = direct_agent(&cluster, agent_config("scanner-1", 9001), engine);
    agent.start().await.unwrap();

    let task_id = dispatch_port_scan(&cluster, TaskSpecBuilder::port_scan()).await;
    assert!(wait_for(|| async { agent.running_tasks().await == 1 }, WAIT).await);

    let task = cluster.manager.cancel(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.cancel_requested_at.is_some());

    assert!(cluster.wait_for_status(&task_id, TaskStatus::Canceled, WAIT).await);
    assert!(wait_for(|| async { agent.running_tasks().await == 0 }, WAIT).await);

    agent.stop().await;
}

#[tokio::test]
async fn test_local_timeout_reports_failure() {
    let cluster = TestCluster::new();
    let engine = ScriptedEngine::always(TaskType::PortScan, EngineBehavior::BlockUntilCanceled);
    let agent = direct_agent(&cluster, agent_config("scanner-1", 9001), engine);
    agent.start().await.unwrap();

    let task_id = dispatch_port_scan(
        &cluster,
        TaskSpecBuilder::port_scan().with_timeout(1).with_max_retries(1),
    )
    .await;
    assert!(cluster.wait_for_status(&task_id, TaskStatus::Failed, WAIT).await);

    let task = cluster.task(&task_id).await;
    assert!(task
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("TimeoutError")));

    agent.stop().await;
}

#[tokio::test]
async fn test_results_handed_off_through_fast_store() {
    let cluster = TestCluster::new();
    let sink = Arc::new(FastStoreResultSink::new(cluster.fast_store(), &cluster.keys()));
    let agent = agent_with_sink(
        &cluster,
        agent_config("scanner-1", 9001),
        ScriptedEngine::open_port(),
        sink,
    );
    agent.start().await.unwrap();
    let ingestor = cluster.ingestor();
    let handle = ingestor.start();

    let task_id = dispatch_port_scan(&cluster, TaskSpecBuilder::port_scan()).await;
    assert!(cluster.wait_for_status(&task_id, TaskStatus::Completed, WAIT).await);
    assert_eq!(cluster.manager.task_results(&task_id).await.unwrap().len(), 1);

    ingestor.stop();
    handle.await.unwrap();
    agent.stop().await;
}

#[tokio::test]
async fn test_restart_reuses_configured_node_id() {
    let cluster = TestCluster::new();
    let first = direct_agent(
        &cluster,
        agent_config("scanner-1", 9001),
        ScriptedEngine::open_port(),
    );
    let node_id = first.start().await.unwrap();
    first.stop().await;

    // 心跳键仍然有效，带着旧ID重启不需要重新注册
    let config = AgentConfig {
        node_id: Some(node_id.clone()),
        ..agent_config("scanner-1", 9001)
    };
    let second = direct_agent(&cluster, config, ScriptedEngine::open_port());
    assert_eq!(second.start().await.unwrap(), node_id);
    assert_eq!(cluster.registry.list().await.unwrap().len(), 1);
    second.stop().await;
}

#[tokio::test]
async fn test_unknown_configured_node_id_registers_again() {
    let cluster = TestCluster::new();
    let config = AgentConfig {
        node_id: Some("ghost-node".to_string()),
        ..agent_config("scanner-2", 9002)
    };
    let agent = direct_agent(&cluster, config, ScriptedEngine::open_port());
    let node_id = agent.start().await.unwrap();

    assert_ne!(node_id, "ghost-node");
    assert!(cluster.registry.get(&node_id).await.unwrap().is_some());
    agent.stop().await;
}

#[tokio::test]
async fn test_agent_cannot_start_twice() {
    let cluster = TestCluster::new();
    let agent = direct_agent(
        &cluster,
        agent_config("scanner-1", 9001),
        ScriptedEngine::open_port(),
    );
    agent.start().await.unwrap();
    assert!(agent.start().await.is_err());

    agent.stop().await;
    assert!(agent.start().await.is_err());
}

#[tokio::test]
async fn test_stop_leaves_running_task_for_reclaim() {
    let cluster = TestCluster::new();
    let engine = ScriptedEngine::always(TaskType::PortScan, EngineBehavior::BlockUntilCanceled);
    let agent = direct_agent(&cluster, agent_config("scanner-1", 9001), engine);
    agent.start().await.unwrap();

    let task_id = dispatch_port_scan(&cluster, TaskSpecBuilder::port_scan()).await;
    assert!(wait_for(|| async { agent.running_tasks().await == 1 }, WAIT).await);

    agent.stop().await;

    let task = cluster.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Running);
    assert!(cluster.manager.task_results(&task_id).await.unwrap().is_empty());
}
