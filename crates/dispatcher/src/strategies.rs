use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use stellar_domain::{Node, Task};
use tracing::debug;

/// 节点选择策略：给出候选节点的尝试顺序
///
/// 分发时按返回的顺序逐个尝试占用槽位和认领，前一个失败才会尝试下一个。
pub trait NodeSelectionStrategy: Send + Sync {
    fn order_candidates(&self, task: &Task, candidates: Vec<Node>) -> Vec<Node>;

    fn name(&self) -> &str;
}

/// 负载最低优先，负载相同时节点ID最小者优先
#[derive(Debug, Default)]
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl NodeSelectionStrategy for LeastLoadedStrategy {
    fn order_candidates(&self, task: &Task, mut candidates: Vec<Node>) -> Vec<Node> {
        candidates.retain(|node| node.config.accepts(task.task_type));
        candidates.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(first) = candidates.first() {
            debug!(
                "负载均衡策略首选节点: {} (负载: {:.1}%)",
                first.id,
                first.load_ratio() * 100.0
            );
        } else {
            debug!("没有支持任务类型 {} 的可用节点", task.task_type);
        }
        candidates
    }

    fn name(&self) -> &str {
        "LeastLoaded"
    }
}

/// 轮询起点，在可用节点之间轮转首选节点
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeSelectionStrategy for RoundRobinStrategy {
    fn order_candidates(&self, task: &Task, mut candidates: Vec<Node>) -> Vec<Node> {
        candidates.retain(|node| node.config.accepts(task.task_type));
        if candidates.is_empty() {
            debug!("没有支持任务类型 {} 的可用节点", task.task_type);
            return candidates;
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let index = self.counter.fetch_add(1, AtomicOrdering::Relaxed) % candidates.len();
        candidates.rotate_left(index);
        debug!(
            "轮询策略首选节点: {} (索引: {}/{})",
            candidates[0].id,
            index,
            candidates.len()
        );
        candidates
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stellar_domain::{
        NodeConfig, NodeRegistration, NodeRole, PortScanConfig, TaskConfig, TaskPriority,
        TaskType,
    };

    fn node(id: &str, running: u32, max: u32, types: Vec<TaskType>) -> Node {
        let mut node = Node::from_registration(
            NodeRegistration {
                name: id.into(),
                ip: "10.0.0.1".into(),
                port: 8082,
                role: NodeRole::Worker,
                tags: vec![],
                config: NodeConfig {
                    max_concurrent_tasks: max,
                    enabled_task_types: types,
                    ..NodeConfig::default()
                },
            },
            Utc::now(),
        );
        node.id = id.into();
        node.running_tasks = running;
        node
    }

    fn port_scan() -> Task {
        Task::new(
            "scan",
            TaskPriority::Normal,
            TaskConfig::PortScan(PortScanConfig::default()),
            60,
            0,
        )
    }

    #[test]
    fn test_least_loaded_orders_by_ratio_then_id() {
        let strategy = LeastLoadedStrategy::new();
        let ordered = strategy.order_candidates(
            &port_scan(),
            vec![
                node("c", 1, 4, TaskType::ALL.to_vec()),
                node("b", 2, 4, TaskType::ALL.to_vec()),
                node("a", 1, 4, TaskType::ALL.to_vec()),
            ],
        );
        let ids: Vec<_> = ordered.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_least_loaded_filters_task_type() {
        let strategy = LeastLoadedStrategy::new();
        let ordered = strategy.order_candidates(
            &port_scan(),
            vec![
                node("a", 0, 4, vec![TaskType::VulnScan]),
                node("b", 3, 4, vec![TaskType::PortScan]),
            ],
        );
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, "b");
    }

    #[test]
    fn test_round_robin_rotates() {
        let strategy = RoundRobinStrategy::new();
        let nodes = || {
            vec![
                node("a", 0, 4, TaskType::ALL.to_vec()),
                node("b", 0, 4, TaskType::ALL.to_vec()),
            ]
        };
        let first = strategy.order_candidates(&port_scan(), nodes());
        let second = strategy.order_candidates(&port_scan(), nodes());
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(strategy.name(), "RoundRobin");
    }
}
