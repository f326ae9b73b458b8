use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backup::BackupScan;
use super::circuit::CircuitState;

/// Aggregate health derived from the number of issues found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No issues.
    Healthy,
    /// One or two issues.
    Warning,
    /// Three or more issues.
    Critical,
}

impl HealthStatus {
    /// Status for `issues` findings.
    pub fn for_issue_count(issues: usize) -> Self {
        match issues {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        }
    }
}

/// Findings of one check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    /// No findings.
    pub passed: bool,
    /// Human-readable findings.
    pub issues: Vec<String>,
}

/// Result of one integrity run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// When the run finished.
    pub checked_at: DateTime<Utc>,
    /// Aggregate status.
    pub overall_status: HealthStatus,
    /// Total findings across all checks.
    pub issues_found: usize,
    /// Findings per check name.
    pub checks: BTreeMap<String, CheckOutcome>,
}

impl IntegrityReport {
    /// Build a report from named check results.
    pub fn from_checks(checks: Vec<(&str, Vec<String>)>) -> Self {
        let issues_found = checks.iter().map(|(_, v)| v.len()).sum();
        Self {
            checked_at: Utc::now(),
            overall_status: HealthStatus::for_issue_count(issues_found),
            issues_found,
            checks: checks
                .into_iter()
                .map(|(name, issues)| (name.to_string(), CheckOutcome { passed: issues.is_empty(), issues }))
                .collect(),
        }
    }
}

/// Snapshot of one circuit for checking.
pub struct CircuitView<'a> {
    /// Operation name.
    pub operation: &'a str,
    /// State.
    pub state: CircuitState,
    /// Consecutive failures.
    pub failure_count: u32,
}

/// Open circuits must have reached the threshold; attempt counters must not
/// exceed the maximum.
pub fn check_consistency(
    circuits: &[CircuitView<'_>],
    threshold: u32,
    attempts: &[(&str, u32)],
    max_attempts: u32,
) -> Vec<String> {
    let mut issues = Vec::new();
    for c in circuits {
        if c.state != CircuitState::Closed && c.failure_count < threshold {
            issues.push(format!(
                "circuit {} is {:?} with {} failures (threshold {threshold})",
                c.operation, c.state, c.failure_count
            ));
        }
    }
    for (key, count) in attempts {
        if *count > max_attempts {
            issues.push(format!("recovery attempts for {key} at {count} exceed {max_attempts}"));
        }
    }
    issues
}

fn is_empty_payload(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Cached last-known-good entries must carry data.
pub fn check_completeness<'a>(cache: impl IntoIterator<Item = (&'a String, &'a Value)>) -> Vec<String> {
    cache
        .into_iter()
        .filter(|(_, v)| is_empty_payload(v))
        .map(|(k, _)| format!("cached data for {k} is empty"))
        .collect()
}

/// Cached records must not carry a failed validation result.
pub fn check_validity<'a>(cache: impl IntoIterator<Item = (&'a String, &'a Value)>) -> Vec<String> {
    cache
        .into_iter()
        .filter(|(_, v)| v.pointer("/validationResult/isValid") == Some(&Value::Bool(false)))
        .map(|(k, _)| format!("cached record for {k} failed validation"))
        .collect()
}

/// Stored backups must be readable and match their checksums.
pub fn check_backups(scan: &BackupScan) -> Vec<String> {
    scan.unreadable
        .iter()
        .map(|key| format!("backup {key} unreadable"))
        .chain(
            scan.backups
                .iter()
                .filter(|b| !b.verify())
                .map(|b| format!("backup {} ({}) failed checksum verification", b.id, b.data_type)),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn status_thresholds() {
        assert_eq!(HealthStatus::for_issue_count(0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::for_issue_count(2), HealthStatus::Warning);
        assert_eq!(HealthStatus::for_issue_count(3), HealthStatus::Critical);
    }

    #[test]
    fn cache_checks() {
        let mut cache = HashMap::new();
        cache.insert("a".to_string(), json!({}));
        cache.insert("b".to_string(), json!({"validationResult": {"isValid": false}}));
        cache.insert("c".to_string(), json!({"validationResult": {"isValid": true}}));
        assert_eq!(check_completeness(&cache).len(), 1);
        assert_eq!(check_validity(&cache), vec!["cached record for b failed validation".to_string()]);
    }

    #[test]
    fn consistency_flags_premature_open() {
        let circuits = [CircuitView { operation: "fetch", state: CircuitState::Open, failure_count: 1 }];
        assert_eq!(check_consistency(&circuits, 5, &[("fetch:x", 9)], 5).len(), 2);
        let report = IntegrityReport::from_checks(vec![("consistency", vec![]), ("backups", vec![])]);
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(report.issues_found, 0);
    }
}
