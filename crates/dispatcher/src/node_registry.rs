//! 节点注册中心
//!
//! 维护集群成员、节点声明的配置与能力、基于心跳键的存活判断，
//! 以及每个节点在快速存储中的运行槽位计数。节点状态只由这里修改。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use stellar_config::NodeManagerConfig;
use stellar_domain::{
    FastStore, HeartbeatAck, HeartbeatRecord, KeySpace, Node, NodeConfig, NodeRegistration,
    NodeRepository, NodeStatus, NodeStatusSnapshot, TaskType,
};
use stellar_errors::{StellarError, StellarResult};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// 心跳写回遇到并发修改时重新合并的次数
const HEARTBEAT_MERGE_ATTEMPTS: usize = 3;

/// 注册后、首次心跳前写入心跳键的占位值
const REGISTRATION_GRACE_MARKER: &str = "registering";

/// 本实例对节点的轻量缓存，心跳路径只读写这里和快速存储
#[derive(Debug, Clone)]
struct CachedNode {
    status: NodeStatus,
    heartbeat_interval_seconds: u64,
    max_concurrent_tasks: u32,
    last_persisted: DateTime<Utc>,
}

impl CachedNode {
    fn from_node(node: &Node, last_persisted: DateTime<Utc>) -> Self {
        Self {
            status: node.status,
            heartbeat_interval_seconds: node.config.heartbeat_interval_seconds,
            max_concurrent_tasks: node.config.max_concurrent_tasks,
            last_persisted,
        }
    }
}

/// 一次节点巡检的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSweepReport {
    pub marked_offline: Vec<String>,
    pub removed: Vec<String>,
    pub online: usize,
}

pub struct NodeRegistry {
    nodes: Arc<dyn NodeRepository>,
    store: Arc<dyn FastStore>,
    keys: KeySpace,
    config: NodeManagerConfig,
    cache: Arc<RwLock<HashMap<String, CachedNode>>>,
}

impl NodeRegistry {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        store: Arc<dyn FastStore>,
        keys: KeySpace,
        config: NodeManagerConfig,
    ) -> Self {
        Self {
            nodes,
            store,
            keys,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &NodeManagerConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn heartbeat_ttl(&self, interval_seconds: u64) -> Duration {
        Duration::from_secs(self.config.heartbeat_ttl_seconds(interval_seconds))
    }

    /// 注册新节点，返回节点ID
    pub async fn register(&self, registration: NodeRegistration) -> StellarResult<String> {
        registration.validate()?;

        if let Some(existing) = self
            .nodes
            .find_by_address(&registration.ip, registration.port)
            .await?
        {
            let alive = self.store.exists(&self.keys.node_heartbeat(&existing.id)).await?;
            if existing.status != NodeStatus::Offline && alive {
                return Err(StellarError::node_conflict(
                    &existing.id,
                    existing.status,
                    format!("重复注册地址 {}", existing.address()),
                ));
            }
            info!(
                "地址 {} 上的旧节点 {} 已失联，使用新注册替换",
                existing.address(),
                existing.id
            );
            self.purge(&existing.id).await?;
        }

        let now = Utc::now();
        let node = Node::from_registration(registration, now);
        self.nodes.insert(&node).await.map_err(|e| match e {
            StellarError::Duplicate(_) => {
                StellarError::node_conflict(node.address(), "已注册", "重复注册")
            }
            other => other,
        })?;

        self.store.set_add(&self.keys.node_index(), &node.id).await?;
        self.store
            .set(&self.keys.node_running(&node.id), "0", None)
            .await?;
        // 给新节点一个TTL窗口发送第一次心跳
        self.store
            .set(
                &self.keys.node_heartbeat(&node.id),
                REGISTRATION_GRACE_MARKER,
                Some(self.heartbeat_ttl(node.config.heartbeat_interval_seconds)),
            )
            .await?;

        self.cache
            .write()
            .await
            .insert(node.id.clone(), CachedNode::from_node(&node, now));

        info!(
            "节点注册成功: {} ({}) 地址: {}",
            node.name,
            node.id,
            node.address()
        );
        Ok(node.id)
    }

    async fn cached(&self, node_id: &str) -> StellarResult<Option<CachedNode>> {
        if let Some(entry) = self.cache.read().await.get(node_id) {
            return Ok(Some(entry.clone()));
        }
        match self.nodes.get(node_id).await? {
            Some(node) => {
                let entry = CachedNode::from_node(&node, node.updated_at);
                self.cache
                    .write()
                    .await
                    .insert(node_id.to_string(), entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// 处理节点心跳
    ///
    /// 只刷新快速存储中的心跳键；状态变化或距上次写回超过间隔时，
    /// 持久化写回在后台任务中进行，不阻塞心跳本身。
    pub async fn heartbeat(
        &self,
        node_id: &str,
        snapshot: NodeStatusSnapshot,
    ) -> StellarResult<HeartbeatAck> {
        snapshot.validate()?;

        let Some(entry) = self.cached(node_id).await? else {
            warn!("收到未知节点 {} 的心跳，已忽略", node_id);
            return Ok(HeartbeatAck {
                accepted: false,
                status: None,
                next_heartbeat_seconds: self.config.heartbeat_interval_seconds,
            });
        };

        let now = Utc::now();
        let record = HeartbeatRecord {
            snapshot,
            received_at: now,
        };
        self.store
            .set(
                &self.keys.node_heartbeat(node_id),
                &serde_json::to_string(&record)?,
                Some(self.heartbeat_ttl(entry.heartbeat_interval_seconds)),
            )
            .await?;
        counter!("stellar_heartbeats_total").increment(1);

        let new_status = if entry.status.promotes_on_heartbeat() {
            NodeStatus::Online
        } else {
            entry.status
        };
        let status_changed = new_status != entry.status;
        let persist_due = (now - entry.last_persisted).num_seconds()
            >= self.config.heartbeat_persist_interval_seconds as i64;

        if status_changed || persist_due {
            if let Some(cached) = self.cache.write().await.get_mut(node_id) {
                cached.status = new_status;
                cached.last_persisted = now;
            }
            if status_changed {
                info!("节点 {} 状态变更: {} -> {}", node_id, entry.status, new_status);
            }
            self.spawn_persist_heartbeat(node_id.to_string(), record);
        }

        Ok(HeartbeatAck {
            accepted: true,
            status: Some(new_status),
            next_heartbeat_seconds: entry.heartbeat_interval_seconds,
        })
    }

    fn spawn_persist_heartbeat(&self, node_id: String, record: HeartbeatRecord) {
        let nodes = Arc::clone(&self.nodes);
        let attempts = self.config.persist_retry_attempts.max(1);

        tokio::spawn(async move {
            for attempt in 1..=attempts {
                match persist_heartbeat(nodes.as_ref(), &node_id, &record).await {
                    Ok(()) => return,
                    Err(e) if attempt < attempts => {
                        warn!(
                            "写回节点 {} 心跳失败 (第 {} 次): {}，稍后重试",
                            node_id, attempt, e
                        );
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                    Err(e) => {
                        error!("写回节点 {} 心跳最终失败: {}", node_id, e);
                        counter!("stellar_background_errors_total", "loop" => "heartbeat_persist")
                            .increment(1);
                    }
                }
            }
        });
    }

    /// 管理端修改节点状态
    pub async fn update_status(&self, node_id: &str, status: NodeStatus) -> StellarResult<Node> {
        let mut node = self.load(node_id).await?;
        if node.status == status {
            debug!("节点 {} 已处于 {} 状态", node_id, status);
            return Ok(node);
        }
        if !node.status.can_transition_to(status) {
            return Err(StellarError::node_conflict(
                node_id,
                node.status,
                format!("切换到 {status}"),
            ));
        }

        let now = Utc::now();
        let previous = node.status;
        node.status = status;
        node.offline_since = (status == NodeStatus::Offline).then_some(now);
        node.updated_at = now;
        self.nodes.update(&node).await?;
        self.refresh_cache(&node, now).await;

        info!("节点 {} 状态变更: {} -> {}", node_id, previous, status);
        Ok(node)
    }

    /// 替换节点配置并通知节点刷新
    pub async fn update_config(&self, node_id: &str, config: NodeConfig) -> StellarResult<Node> {
        config.validate()?;
        let mut node = self.load(node_id).await?;
        let now = Utc::now();
        node.config = config;
        node.updated_at = now;
        self.nodes.update(&node).await?;
        self.refresh_cache(&node, now).await;

        let payload = serde_json::to_string(&node.config)?;
        let receivers = self
            .store
            .publish(&self.keys.node_config_channel(node_id), &payload)
            .await?;
        info!("节点 {} 配置已更新，通知了 {} 个订阅者", node_id, receivers);
        Ok(node)
    }

    /// 可以接收指定类型任务的节点，负载最低者在前，负载相同按ID排序
    pub async fn list_eligible(&self, task_type: TaskType) -> StellarResult<Vec<Node>> {
        let mut eligible = Vec::new();
        for mut node in self.nodes.list().await? {
            if !node.config.accepts(task_type) {
                continue;
            }
            let Some(raw) = self.store.get(&self.keys.node_heartbeat(&node.id)).await? else {
                continue;
            };
            let schedulable = match node.status {
                NodeStatus::Online => true,
                // 已经发过心跳但写回尚未落盘
                NodeStatus::Registering | NodeStatus::Offline => {
                    serde_json::from_str::<HeartbeatRecord>(&raw).is_ok()
                }
                NodeStatus::Maintain | NodeStatus::Disabled => false,
            };
            if !schedulable {
                continue;
            }
            node.running_tasks = self.running_count(&node.id).await?;
            if node.has_capacity() {
                eligible.push(node);
            }
        }

        eligible.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!("任务类型 {} 的可用节点: {}", task_type, eligible.len());
        Ok(eligible)
    }

    /// 原子地占用节点的一个运行槽位，超过并发上限时返回 false
    pub async fn try_acquire_slot(&self, node_id: &str) -> StellarResult<bool> {
        let Some(entry) = self.cached(node_id).await? else {
            return Err(StellarError::node_not_found(node_id));
        };
        let key = self.keys.node_running(node_id);
        let running = self.store.incr_by(&key, 1).await?;
        if running > entry.max_concurrent_tasks as i64 {
            self.store.incr_by(&key, -1).await?;
            debug!("节点 {} 槽位已满 ({})", node_id, entry.max_concurrent_tasks);
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn release_slot(&self, node_id: &str) -> StellarResult<()> {
        let key = self.keys.node_running(node_id);
        let running = self.store.incr_by(&key, -1).await?;
        if running < 0 {
            self.store.set(&key, "0", None).await?;
        }
        Ok(())
    }

    /// 用持久化存储中的运行中任务数纠正计数漂移
    pub async fn reconcile_running(&self, node_id: &str, count: u32) -> StellarResult<()> {
        let current = self.running_count(node_id).await?;
        if current != count {
            debug!("纠正节点 {} 运行计数: {} -> {}", node_id, current, count);
            self.store
                .set(&self.keys.node_running(node_id), &count.to_string(), None)
                .await?;
        }
        Ok(())
    }

    /// 以原子增量修正计数，不覆盖并发的占用和释放
    pub async fn adjust_running(&self, node_id: &str, delta: i64) -> StellarResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let key = self.keys.node_running(node_id);
        let running = self.store.incr_by(&key, delta).await?;
        debug!("修正节点 {} 运行计数 {:+} -> {}", node_id, delta, running);
        if running < 0 {
            self.store.set(&key, "0", None).await?;
        }
        Ok(())
    }

    pub async fn running_count(&self, node_id: &str) -> StellarResult<u32> {
        let raw = self.store.get(&self.keys.node_running(node_id)).await?;
        Ok(raw
            .and_then(|value| value.parse::<i64>().ok())
            .map(|value| value.max(0) as u32)
            .unwrap_or(0))
    }

    /// 心跳键存在且节点未被标记为离线
    pub async fn is_live(&self, node_id: &str) -> StellarResult<bool> {
        if !self.store.exists(&self.keys.node_heartbeat(node_id)).await? {
            return Ok(false);
        }
        Ok(self
            .cached(node_id)
            .await?
            .is_some_and(|entry| entry.status != NodeStatus::Offline))
    }

    /// 删除节点，仍有运行中任务时拒绝
    pub async fn remove(&self, node_id: &str) -> StellarResult<()> {
        let node = self.load(node_id).await?;
        let running = self.running_count(node_id).await?;
        if running > 0 {
            return Err(StellarError::node_conflict(
                node_id,
                format!("{} (运行中任务 {running})", node.status),
                "删除",
            ));
        }
        self.purge(node_id).await?;
        info!("节点已删除: {} ({})", node.name, node_id);
        Ok(())
    }

    async fn purge(&self, node_id: &str) -> StellarResult<()> {
        self.nodes.delete(node_id).await?;
        self.store.delete(&self.keys.node_heartbeat(node_id)).await?;
        self.store.delete(&self.keys.node_running(node_id)).await?;
        self.store.delete(&self.keys.node_assignments(node_id)).await?;
        self.store.set_remove(&self.keys.node_index(), node_id).await?;
        self.cache.write().await.remove(node_id);
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> StellarResult<Option<Node>> {
        match self.nodes.get(node_id).await? {
            Some(mut node) => {
                node.running_tasks = self.running_count(node_id).await?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> StellarResult<Vec<Node>> {
        let mut nodes = self.nodes.list().await?;
        for node in nodes.iter_mut() {
            node.running_tasks = self.running_count(&node.id).await?;
        }
        Ok(nodes)
    }

    /// 记录节点的任务执行统计
    pub async fn record_task_outcome(
        &self,
        node_id: &str,
        task_type: TaskType,
        success: bool,
    ) -> StellarResult<()> {
        let Some(mut node) = self.nodes.get(node_id).await? else {
            debug!("节点 {} 已不存在，跳过统计", node_id);
            return Ok(());
        };
        let now = Utc::now();
        node.stats.record(task_type, success, now);
        node.updated_at = now;
        self.nodes.update(&node).await
    }

    /// 把持久化存储中的节点装入快速存储索引和本地缓存
    pub async fn warm_cache(&self) -> StellarResult<usize> {
        let nodes = self.nodes.list().await?;
        let mut cache = self.cache.write().await;
        for node in &nodes {
            self.store.set_add(&self.keys.node_index(), &node.id).await?;
            cache.insert(node.id.clone(), CachedNode::from_node(node, node.updated_at));
        }
        info!("已加载 {} 个节点到缓存", nodes.len());
        Ok(nodes.len())
    }

    pub async fn sweep(&self) -> StellarResult<NodeSweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// 心跳键过期的节点标记为离线；开启自动删除时清理长期离线且空闲的节点
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> StellarResult<NodeSweepReport> {
        let mut report = NodeSweepReport::default();

        for mut node in self.nodes.list().await? {
            let heartbeat_alive = self.store.exists(&self.keys.node_heartbeat(&node.id)).await?;

            match node.status {
                NodeStatus::Online | NodeStatus::Registering if !heartbeat_alive => {
                    warn!(
                        "节点 {} ({}) 心跳超时，标记为离线 (上次心跳: {:?})",
                        node.name, node.id, node.last_heartbeat
                    );
                    node.status = NodeStatus::Offline;
                    node.offline_since = Some(now);
                    node.updated_at = now;
                    self.nodes.update(&node).await?;
                    self.refresh_cache(&node, now).await;
                    report.marked_offline.push(node.id.clone());
                }
                NodeStatus::Online => report.online += 1,
                NodeStatus::Offline if self.config.enable_auto_remove && !heartbeat_alive => {
                    let offline_for = node
                        .offline_since
                        .map(|since| (now - since).num_seconds())
                        .unwrap_or(0);
                    if offline_for >= self.config.auto_remove_after_seconds as i64
                        && self.running_count(&node.id).await? == 0
                    {
                        self.purge(&node.id).await?;
                        info!("自动删除长期离线节点: {} ({})", node.name, node.id);
                        report.removed.push(node.id.clone());
                    }
                }
                _ => {}
            }
        }

        gauge!("stellar_nodes_online").set(report.online as f64);
        if !report.marked_offline.is_empty() || !report.removed.is_empty() {
            info!(
                "节点巡检完成: 离线 {} 个，删除 {} 个，在线 {} 个",
                report.marked_offline.len(),
                report.removed.len(),
                report.online
            );
        }
        Ok(report)
    }

    async fn load(&self, node_id: &str) -> StellarResult<Node> {
        self.nodes
            .get(node_id)
            .await?
            .ok_or_else(|| StellarError::node_not_found(node_id))
    }

    async fn refresh_cache(&self, node: &Node, persisted_at: DateTime<Utc>) {
        self.cache
            .write()
            .await
            .insert(node.id.clone(), CachedNode::from_node(node, persisted_at));
    }
}

/// 以持久化存储中的最新文档为准合并心跳数据
///
/// 写入以 `updated_at` 为条件，管理端在读取之后的修改会让本次写入失败并重新合并。
async fn persist_heartbeat(
    nodes: &dyn NodeRepository,
    node_id: &str,
    record: &HeartbeatRecord,
) -> StellarResult<()> {
    for _ in 0..HEARTBEAT_MERGE_ATTEMPTS {
        let Some(mut node) = nodes.get(node_id).await? else {
            return Ok(());
        };
        let expected = node.updated_at;
        node.last_heartbeat = Some(record.received_at);
        node.resources = Some(record.snapshot.clone());
        if node.status.promotes_on_heartbeat() {
            node.status = NodeStatus::Online;
            node.offline_since = None;
        }
        node.updated_at = Utc::now().max(expected + chrono::Duration::microseconds(1));
        if nodes.update_if_unchanged(&node, expected).await? {
            return Ok(());
        }
        debug!("节点 {} 文档已被并发修改，重新合并心跳", node_id);
    }
    Err(StellarError::node_conflict(node_id, "并发修改", "写回心跳"))
}
