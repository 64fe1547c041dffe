//! 各扫描类型的强类型配置
//!
//! 创建任务时原始JSON会被解析为对应类型的配置并补齐默认值，
//! 解析或校验失败的任务不会被持久化。

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use stellar_errors::{StellarError, StellarResult};

use crate::task::TaskType;

fn invalid(field: &str, reason: impl AsRef<str>) -> StellarError {
    StellarError::validation(format!("{field}: {}", reason.as_ref()))
}

fn require_non_empty(values: &[String], field: &str) -> StellarResult<()> {
    if values.is_empty() {
        return Err(invalid(field, "不能为空"));
    }
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(invalid(field, "包含空值"));
    }
    Ok(())
}

fn require_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    field: &str,
) -> StellarResult<()> {
    if value < min || value > max {
        return Err(invalid(field, format!("必须在{min}-{max}之间，当前为{value}")));
    }
    Ok(())
}

/// 简单的域名格式检查：至少两级标签，标签由字母数字和连字符组成
pub fn is_valid_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.');
    if domain.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '*')
        })
}

/// 扫描目标可以是IP、CIDR或域名
fn is_valid_host_target(target: &str) -> bool {
    if target.parse::<IpAddr>().is_ok() {
        return true;
    }
    if let Some((ip, mask)) = target.split_once('/') {
        return match (ip.parse::<IpAddr>(), mask.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(bits)) => bits <= 32,
            (Ok(IpAddr::V6(_)), Ok(bits)) => bits <= 128,
            _ => false,
        };
    }
    is_valid_domain(target)
}

fn is_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(r) if !r.is_empty() && !r.starts_with('/'))
}

/// 解析端口表达式，例如 `80,443,8000-8100`
pub fn parse_port_spec(spec: &str) -> StellarResult<Vec<(u16, u16)>> {
    let mut ranges = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (part, part),
        };
        let start: u16 = start
            .parse()
            .map_err(|_| invalid("ports", format!("无效的端口: {part}")))?;
        let end: u16 = end
            .parse()
            .map_err(|_| invalid("ports", format!("无效的端口: {part}")))?;
        if start == 0 || start > end {
            return Err(invalid("ports", format!("无效的端口范围: {part}")));
        }
        ranges.push((start, end));
    }
    if ranges.is_empty() {
        return Err(invalid("ports", "不能为空"));
    }
    Ok(ranges)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubdomainEnumConfig {
    pub domains: Vec<String>,
    pub methods: Vec<String>,
    pub dictionary_path: Option<String>,
    pub concurrency: u32,
    pub rate_limit: u32,
    pub resolver_servers: Vec<String>,
    pub verify_subdomains: bool,
    pub check_takeover: bool,
    pub recursive_search: bool,
}

impl Default for SubdomainEnumConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            methods: vec!["dictionary".to_string()],
            dictionary_path: None,
            concurrency: 50,
            rate_limit: 100,
            resolver_servers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            verify_subdomains: true,
            check_takeover: false,
            recursive_search: false,
        }
    }
}

impl SubdomainEnumConfig {
    const METHODS: [&'static str; 3] = ["dictionary", "passive", "certificate"];

    pub fn validate(&self) -> StellarResult<()> {
        require_non_empty(&self.domains, "domains")?;
        if let Some(bad) = self.domains.iter().find(|d| !is_valid_domain(d)) {
            return Err(invalid("domains", format!("无效的域名: {bad}")));
        }
        require_non_empty(&self.methods, "methods")?;
        if let Some(bad) = self
            .methods
            .iter()
            .find(|m| !Self::METHODS.contains(&m.as_str()))
        {
            return Err(invalid("methods", format!("不支持的枚举方法: {bad}")));
        }
        require_range(self.concurrency, 1, 1000, "concurrency")?;
        require_range(self.rate_limit, 1, 10000, "rate_limit")?;
        if let Some(bad) = self
            .resolver_servers
            .iter()
            .find(|r| r.parse::<IpAddr>().is_err())
        {
            return Err(invalid("resolver_servers", format!("无效的DNS服务器: {bad}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortScanType {
    Syn,
    Connect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanConfig {
    pub targets: Vec<String>,
    pub ports: String,
    pub concurrency: u32,
    pub timeout_seconds: u64,
    pub rate_limit: u32,
    pub scan_type: PortScanType,
    pub exclude_ips: Vec<String>,
    pub service_detection: bool,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            ports: "1-1000".to_string(),
            concurrency: 100,
            timeout_seconds: 3,
            rate_limit: 1000,
            scan_type: PortScanType::Connect,
            exclude_ips: Vec::new(),
            service_detection: true,
        }
    }
}

impl PortScanConfig {
    pub fn validate(&self) -> StellarResult<()> {
        require_non_empty(&self.targets, "targets")?;
        if let Some(bad) = self.targets.iter().find(|t| !is_valid_host_target(t)) {
            return Err(invalid("targets", format!("无效的扫描目标: {bad}")));
        }
        parse_port_spec(&self.ports)?;
        require_range(self.concurrency, 1, 5000, "concurrency")?;
        require_range(self.timeout_seconds, 1, 60, "timeout_seconds")?;
        require_range(self.rate_limit, 1, 100_000, "rate_limit")?;
        if let Some(bad) = self
            .exclude_ips
            .iter()
            .find(|ip| ip.parse::<IpAddr>().is_err())
        {
            return Err(invalid("exclude_ips", format!("无效的IP地址: {bad}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnScanConfig {
    pub targets: Vec<String>,
    pub plugins: Vec<String>,
    pub severities: Vec<Severity>,
    pub max_concurrency: u32,
    pub request_timeout_seconds: u64,
}

impl Default for VulnScanConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            plugins: Vec::new(),
            severities: vec![Severity::Medium, Severity::High, Severity::Critical],
            max_concurrency: 25,
            request_timeout_seconds: 10,
        }
    }
}

impl VulnScanConfig {
    pub fn validate(&self) -> StellarResult<()> {
        require_non_empty(&self.targets, "targets")?;
        if let Some(bad) = self.targets.iter().find(|t| !is_http_url(t)) {
            return Err(invalid("targets", format!("目标必须是http(s) URL: {bad}")));
        }
        if self.severities.is_empty() {
            return Err(invalid("severities", "不能为空"));
        }
        require_range(self.max_concurrency, 1, 500, "max_concurrency")?;
        require_range(self.request_timeout_seconds, 1, 120, "request_timeout_seconds")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetDiscoveryConfig {
    pub targets: Vec<String>,
    pub max_concurrency: u32,
    pub max_depth: u8,
    pub follow_redirects: bool,
    pub screenshot: bool,
}

impl Default for AssetDiscoveryConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            max_concurrency: 20,
            max_depth: 2,
            follow_redirects: true,
            screenshot: false,
        }
    }
}

impl AssetDiscoveryConfig {
    pub fn validate(&self) -> StellarResult<()> {
        require_non_empty(&self.targets, "targets")?;
        if let Some(bad) = self
            .targets
            .iter()
            .find(|t| !is_valid_host_target(t) && !is_http_url(t))
        {
            return Err(invalid("targets", format!("无效的发现目标: {bad}")));
        }
        require_range(self.max_concurrency, 1, 500, "max_concurrency")?;
        require_range(self.max_depth, 1, 5, "max_depth")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageMonitoringConfig {
    pub urls: Vec<String>,
    pub check_interval_seconds: u64,
    /// 页面内容变化比例超过该阈值时视为变更
    pub diff_threshold: f64,
    pub request_timeout_seconds: u64,
}

impl Default for PageMonitoringConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            check_interval_seconds: 3600,
            diff_threshold: 0.1,
            request_timeout_seconds: 15,
        }
    }
}

impl PageMonitoringConfig {
    pub fn validate(&self) -> StellarResult<()> {
        require_non_empty(&self.urls, "urls")?;
        if let Some(bad) = self.urls.iter().find(|u| !is_http_url(u)) {
            return Err(invalid("urls", format!("必须是http(s) URL: {bad}")));
        }
        require_range(self.check_interval_seconds, 60, 86_400, "check_interval_seconds")?;
        if !(0.0..=1.0).contains(&self.diff_threshold) {
            return Err(invalid("diff_threshold", "必须在0-1之间"));
        }
        require_range(self.request_timeout_seconds, 1, 120, "request_timeout_seconds")?;
        Ok(())
    }
}

/// 按任务类型区分的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "settings", rename_all = "snake_case")]
pub enum TaskConfig {
    SubdomainEnum(SubdomainEnumConfig),
    PortScan(PortScanConfig),
    VulnScan(VulnScanConfig),
    AssetDiscovery(AssetDiscoveryConfig),
    PageMonitoring(PageMonitoringConfig),
}

impl TaskConfig {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskConfig::SubdomainEnum(_) => TaskType::SubdomainEnum,
            TaskConfig::PortScan(_) => TaskType::PortScan,
            TaskConfig::VulnScan(_) => TaskType::VulnScan,
            TaskConfig::AssetDiscovery(_) => TaskType::AssetDiscovery,
            TaskConfig::PageMonitoring(_) => TaskType::PageMonitoring,
        }
    }

    pub fn validate(&self) -> StellarResult<()> {
        match self {
            TaskConfig::SubdomainEnum(c) => c.validate(),
            TaskConfig::PortScan(c) => c.validate(),
            TaskConfig::VulnScan(c) => c.validate(),
            TaskConfig::AssetDiscovery(c) => c.validate(),
            TaskConfig::PageMonitoring(c) => c.validate(),
        }
    }

    /// 将原始JSON解析为指定类型的配置，补齐默认值后校验
    pub fn parse(task_type: TaskType, raw: &serde_json::Value) -> StellarResult<TaskConfig> {
        let raw = if raw.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            raw.clone()
        };
        if !raw.is_object() {
            return Err(StellarError::validation("任务配置必须是JSON对象"));
        }

        fn typed<T: serde::de::DeserializeOwned>(raw: serde_json::Value) -> StellarResult<T> {
            serde_json::from_value(raw)
                .map_err(|e| StellarError::validation(format!("任务配置格式错误: {e}")))
        }

        let config = match task_type {
            TaskType::SubdomainEnum => TaskConfig::SubdomainEnum(typed(raw)?),
            TaskType::PortScan => TaskConfig::PortScan(typed(raw)?),
            TaskType::VulnScan => TaskConfig::VulnScan(typed(raw)?),
            TaskType::AssetDiscovery => TaskConfig::AssetDiscovery(typed(raw)?),
            TaskType::PageMonitoring => TaskConfig::PageMonitoring(typed(raw)?),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fills_defaults() {
        let config = TaskConfig::parse(
            TaskType::PortScan,
            &json!({"targets": ["192.168.1.0/24", "example.com"]}),
        )
        .unwrap();
        match config {
            TaskConfig::PortScan(c) => {
                assert_eq!(c.ports, "1-1000");
                assert_eq!(c.scan_type, PortScanType::Connect);
                assert_eq!(c.targets.len(), 2);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_empty_targets() {
        let err = TaskConfig::parse(TaskType::PortScan, &json!({})).unwrap_err();
        assert!(err.to_string().contains("targets"));
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        assert!(TaskConfig::parse(TaskType::VulnScan, &json!([1, 2])).is_err());
        assert!(TaskConfig::parse(TaskType::VulnScan, &json!({"targets": "x"})).is_err());
    }

    #[test]
    fn test_port_spec() {
        assert_eq!(
            parse_port_spec("80, 443,8000-8100").unwrap(),
            vec![(80, 80), (443, 443), (8000, 8100)]
        );
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("100-10").is_err());
        assert!(parse_port_spec("http").is_err());
        assert!(parse_port_spec(" , ").is_err());
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("*.dev.example.com"));
        assert!(!is_valid_domain("localhost"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain("a..b"));
    }

    #[test]
    fn test_subdomain_rejects_unknown_method() {
        let err = TaskConfig::parse(
            TaskType::SubdomainEnum,
            &json!({"domains": ["example.com"], "methods": ["magic"]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_vuln_scan_requires_urls() {
        assert!(TaskConfig::parse(
            TaskType::VulnScan,
            &json!({"targets": ["https://example.com"]})
        )
        .is_ok());
        assert!(TaskConfig::parse(TaskType::VulnScan, &json!({"targets": ["example.com"]})).is_err());
    }

    #[test]
    fn test_page_monitoring_bounds() {
        let err = TaskConfig::parse(
            TaskType::PageMonitoring,
            &json!({"urls": ["https://example.com"], "check_interval_seconds": 5}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("check_interval_seconds"));

        let err = TaskConfig::parse(
            TaskType::PageMonitoring,
            &json!({"urls": ["https://example.com"], "diff_threshold": 1.5}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("diff_threshold"));
    }

    #[test]
    fn test_config_serde_is_tagged() {
        let config = TaskConfig::AssetDiscovery(AssetDiscoveryConfig {
            targets: vec!["https://example.com".into()],
            ..AssetDiscoveryConfig::default()
        });
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["type"], "asset_discovery");
        let back: TaskConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.task_type(), TaskType::AssetDiscovery);
    }
}
