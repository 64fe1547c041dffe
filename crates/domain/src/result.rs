use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::ExecutionOutcome;
use crate::task_config::Severity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubdomainRecord {
    pub host: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub target: String,
    pub plugin: String,
    pub severity: Severity,
    pub matched_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub url: String,
    pub title: Option<String>,
    pub status_code: Option<u16>,
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub content_hash: String,
    pub changed: bool,
}

/// 扫描引擎产出的数据，按引擎类型区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum EngineData {
    Subdomains(Vec<SubdomainRecord>),
    Ports(Vec<PortRecord>),
    Vulnerabilities(Vec<VulnerabilityRecord>),
    Assets(Vec<AssetRecord>),
    Pages(Vec<PageSnapshot>),
    Empty,
}

impl EngineData {
    pub fn len(&self) -> usize {
        match self {
            EngineData::Subdomains(v) => v.len(),
            EngineData::Ports(v) => v.len(),
            EngineData::Vulnerabilities(v) => v.len(),
            EngineData::Assets(v) => v.len(),
            EngineData::Pages(v) => v.len(),
            EngineData::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 结果摘要计数
    pub fn summarize(&self) -> ResultSummary {
        let mut counters = BTreeMap::new();
        match self {
            EngineData::Subdomains(records) => {
                let resolved = records.iter().filter(|r| !r.ips.is_empty()).count();
                counters.insert("resolved".to_string(), resolved as u64);
            }
            EngineData::Ports(records) => {
                let mut hosts: Vec<&str> = records.iter().map(|r| r.host.as_str()).collect();
                hosts.sort_unstable();
                hosts.dedup();
                counters.insert("hosts".to_string(), hosts.len() as u64);
            }
            EngineData::Vulnerabilities(records) => {
                for record in records {
                    let key = serde_json::to_value(record.severity)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    *counters.entry(key).or_insert(0) += 1;
                }
            }
            EngineData::Assets(records) => {
                let alive = records.iter().filter(|r| r.status_code.is_some()).count();
                counters.insert("alive".to_string(), alive as u64);
            }
            EngineData::Pages(records) => {
                let changed = records.iter().filter(|r| r.changed).count();
                counters.insert("changed".to_string(), changed as u64);
            }
            EngineData::Empty => {}
        }
        ResultSummary {
            total_items: self.len() as u64,
            counters,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_items: u64,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub data: EngineData,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl EngineOutput {
    pub fn new(data: EngineData) -> Self {
        Self {
            data,
            notes: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(EngineData::Empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineOutcome {
    Success { output: EngineOutput },
    Failure { error: String },
    Canceled { partial: Option<EngineOutput> },
}

/// 节点上报的一次执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    pub task_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: EngineOutcome,
}

impl EngineReport {
    pub fn execution_outcome(&self) -> ExecutionOutcome {
        match &self.outcome {
            EngineOutcome::Success { .. } => ExecutionOutcome::Succeeded,
            EngineOutcome::Failure { error } => ExecutionOutcome::Failed {
                error: error.clone(),
            },
            EngineOutcome::Canceled { .. } => ExecutionOutcome::Canceled,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// 持久化的任务结果，每个 (task_id, attempt) 仅一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    pub task_id: String,
    pub attempt: u32,
    pub node_id: String,
    pub success: bool,
    pub data: EngineData,
    pub summary: ResultSummary,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn from_report(report: &EngineReport, now: DateTime<Utc>) -> Self {
        let (success, data, error) = match &report.outcome {
            EngineOutcome::Success { output } => (true, output.data.clone(), None),
            EngineOutcome::Failure { error } => (false, EngineData::Empty, Some(error.clone())),
            EngineOutcome::Canceled { partial } => (
                false,
                partial
                    .as_ref()
                    .map(|p| p.data.clone())
                    .unwrap_or(EngineData::Empty),
                Some("任务已取消".to_string()),
            ),
        };
        let summary = data.summarize();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: report.task_id.clone(),
            attempt: report.attempt,
            node_id: report.node_id.clone(),
            success,
            data,
            summary,
            error,
            duration_ms: report.duration_ms(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn report(outcome: EngineOutcome) -> EngineReport {
        let started = Utc::now();
        EngineReport {
            task_id: "t1".into(),
            node_id: "n1".into(),
            attempt: 2,
            started_at: started,
            finished_at: started + Duration::milliseconds(1500),
            outcome,
        }
    }

    #[test]
    fn test_summary_counts_severity() {
        let data = EngineData::Vulnerabilities(vec![
            VulnerabilityRecord {
                target: "https://a.example.com".into(),
                plugin: "cve-2021-44228".into(),
                severity: Severity::Critical,
                matched_at: "/".into(),
            },
            VulnerabilityRecord {
                target: "https://b.example.com".into(),
                plugin: "exposed-git".into(),
                severity: Severity::Medium,
                matched_at: "/.git/config".into(),
            },
            VulnerabilityRecord {
                target: "https://c.example.com".into(),
                plugin: "cve-2021-44228".into(),
                severity: Severity::Critical,
                matched_at: "/".into(),
            },
        ]);
        let summary = data.summarize();
        assert_eq!(summary.total_items, 3);
        assert_eq!(summary.counters["critical"], 2);
        assert_eq!(summary.counters["medium"], 1);
    }

    #[test]
    fn test_summary_distinct_hosts() {
        let port = |host: &str, port: u16| PortRecord {
            host: host.into(),
            port,
            protocol: "tcp".into(),
            service: None,
        };
        let data = EngineData::Ports(vec![
            port("10.0.0.1", 22),
            port("10.0.0.1", 80),
            port("10.0.0.2", 443),
        ]);
        assert_eq!(data.summarize().counters["hosts"], 2);
    }

    #[test]
    fn test_result_from_failure() {
        let report = report(EngineOutcome::Failure {
            error: "dns resolver unreachable".into(),
        });
        let result = TaskResult::from_report(&report, Utc::now());
        assert!(!result.success);
        assert_eq!(result.attempt, 2);
        assert_eq!(result.duration_ms, 1500);
        assert_eq!(result.error.as_deref(), Some("dns resolver unreachable"));
        assert!(result.data.is_empty());
        assert_eq!(
            report.execution_outcome(),
            ExecutionOutcome::Failed {
                error: "dns resolver unreachable".into()
            }
        );
    }

    #[test]
    fn test_result_keeps_partial_on_cancel() {
        let report = report(EngineOutcome::Canceled {
            partial: Some(EngineOutput::new(EngineData::Pages(vec![PageSnapshot {
                url: "https://example.com".into(),
                content_hash: "abc".into(),
                changed: true,
            }]))),
        });
        let result = TaskResult::from_report(&report, Utc::now());
        assert_eq!(result.data.len(), 1);
        assert_eq!(report.execution_outcome(), ExecutionOutcome::Canceled);
    }
}
