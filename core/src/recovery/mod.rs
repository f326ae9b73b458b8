//! Error classification, recovery strategies, circuit breakers, integrity
//! checks and backups.
//!
//! One [`ErrorRecoveryManager`] owns all recovery state for a process (or a
//! test). Failures are keyed by `operation:target` for strategy selection and
//! by `operation` alone for circuit breaking.

mod backup;
mod circuit;
mod classify;
mod integrity;
mod strategy;

pub use backup::{checksum, Backup, BackupScan, BackupStore};
pub use circuit::{Admission, CircuitBreaker, CircuitState};
pub use classify::{classify, classify_message, severity, ErrorCategory, Severity};
pub use integrity::{CheckOutcome, HealthStatus, IntegrityReport};
pub use strategy::{select, strategies_for, RecoveryStrategy};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cfg::RecoveryConfig;
use crate::clean::{self, CleanedRecord};
use crate::error::{Error, Result};
use crate::extract::{self, ExtractedRecord, SchemaHint};
use crate::store::DefaultKv;

const ALERT_LIMIT: usize = 200;

/// Caller-supplied re-invocation of the failed operation.
pub type RetryFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Everything a strategy may need about the failed operation.
pub struct RecoveryContext {
    /// Operation name; circuits are keyed by it.
    pub operation: String,
    /// Target within the operation (URL, rider id, ...).
    pub target: String,
    /// Correlation id for logs.
    pub session_id: Option<String>,
    /// Data type tag used for defaults and backups; defaults to `operation`.
    pub data_type: Option<String>,
    /// Raw page already fetched, for `reparse`.
    pub raw_html: Option<(String, SchemaHint)>,
    /// Record already in hand, for `clean`.
    pub record: Option<Value>,
    /// Re-invocation used by `retry`, `delay` and `throttle`.
    pub retry: Option<RetryFn>,
    /// The caller already holds the half-open probe from [`ErrorRecoveryManager::circuit_gate`].
    pub holds_probe: bool,
}

impl RecoveryContext {
    /// Context for `operation` on `target`.
    pub fn new(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            target: target.into(),
            session_id: None,
            data_type: None,
            raw_html: None,
            record: None,
            retry: None,
            holds_probe: false,
        }
    }

    /// Attach a session id.
    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the data type tag.
    pub fn data_type(mut self, t: impl Into<String>) -> Self {
        self.data_type = Some(t.into());
        self
    }

    /// Attach the fetched page.
    pub fn raw_html(mut self, html: impl Into<String>, hint: SchemaHint) -> Self {
        self.raw_html = Some((html.into(), hint));
        self
    }

    /// Attach a record in hand.
    pub fn record(mut self, v: Value) -> Self {
        self.record = Some(v);
        self
    }

    /// Attach a retry function.
    pub fn retry<F>(mut self, f: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        self.retry = Some(Box::new(f));
        self
    }

    /// Mark this failure as the outcome of the caller's half-open probe.
    pub fn probe(mut self, admission: Admission) -> Self {
        self.holds_probe = admission == Admission::Probe;
        self
    }

    fn key(&self) -> String {
        format!("{}:{}", self.operation, self.target)
    }

    fn type_tag(&self) -> &str {
        self.data_type.as_deref().unwrap_or(&self.operation)
    }
}

/// What a strategy produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Whether the failure was handled.
    pub success: bool,
    /// Recovered data, if any.
    pub data: Option<Value>,
    /// Human-readable summary.
    pub message: String,
    /// Strategy that ran.
    pub strategy: RecoveryStrategy,
    /// Attempt number for the key.
    pub attempt: u32,
}

/// One caught failure. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unique id.
    pub id: Uuid,
    /// When it was caught.
    pub timestamp: DateTime<Utc>,
    /// Category.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: Severity,
    /// Operation.
    pub operation: String,
    /// Target.
    pub target: String,
    /// Session id, if any.
    pub session_id: Option<String>,
    /// Rendered error chain.
    pub message: String,
}

/// Progress of recovery for one `operation:target` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Consecutive failures for the key.
    pub attempt_count: u32,
    /// Strategy chosen for the latest attempt.
    pub strategy: RecoveryStrategy,
    /// Earliest time a retry-style strategy runs again.
    pub next_retry_time: DateTime<Utc>,
}

/// An operator-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// When it was raised.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub severity: Severity,
    /// Short kind tag, e.g. `circuit-open`.
    pub kind: String,
    /// Details.
    pub message: String,
}

/// Counters over the rolling error history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// Records in the history window.
    pub total_errors: usize,
    /// Records from the last hour.
    pub last_hour: usize,
    /// Count per category.
    pub by_category: BTreeMap<String, usize>,
    /// Count per severity.
    pub by_severity: BTreeMap<String, usize>,
    /// Operations whose circuit is not closed.
    pub open_circuits: Vec<String>,
    /// Keys with recovery in progress.
    pub pending_recoveries: usize,
    /// Entries waiting for manual review.
    pub manual_review: usize,
}

#[derive(Default)]
struct State {
    history: VecDeque<ErrorRecord>,
    attempts: HashMap<String, RecoveryAttempt>,
    circuits: HashMap<String, CircuitBreaker>,
    cache: HashMap<String, Value>,
    manual_review: VecDeque<ErrorRecord>,
    alerts: VecDeque<Alert>,
}

impl State {
    fn alert(&mut self, severity: Severity, kind: &str, message: String) {
        match severity {
            Severity::Critical | Severity::High => error!(kind, %message, "alert"),
            _ => warn!(kind, %message, "alert"),
        }
        self.alerts.push_back(Alert { timestamp: Utc::now(), severity, kind: kind.to_string(), message });
        while self.alerts.len() > ALERT_LIMIT {
            self.alerts.pop_front();
        }
    }
}

/// Classifies failures, picks and runs recovery strategies, and tracks
/// circuit breakers, cached data and backups.
pub struct ErrorRecoveryManager {
    cfg: RecoveryConfig,
    state: Mutex<State>,
    backups: BackupStore,
}

fn default_payload(data_type: &str) -> Value {
    match data_type {
        "race-result" | "race_results" => json!({ "raceName": null, "results": [] }),
        "rider-profile" | "rider_profiles" => json!({ "name": null, "teamHistory": [] }),
        "team-roster" | "team_rosters" => json!({ "teamName": null, "riders": [] }),
        _ => json!({}),
    }
}

impl ErrorRecoveryManager {
    /// Manager with backups stored in `kv`.
    pub fn new(cfg: RecoveryConfig, kv: DefaultKv) -> Self {
        Self { cfg, state: Mutex::new(State::default()), backups: BackupStore::new(kv) }
    }

    /// Active configuration.
    pub fn config(&self) -> &RecoveryConfig {
        &self.cfg
    }

    fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.circuit_breaker_timeout_ms)
    }

    /// Recovery backoff for the `attempt`-th failure: base * multiplier^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.cfg.base_retry_delay_ms as f64 * self.cfg.backoff_multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.cfg.max_retry_delay_ms as f64) as u64)
    }

    /// Handle a failure of `ctx.operation` on `ctx.target`.
    ///
    /// Returns the outcome when a strategy handled it. Fails with
    /// [`Error::CircuitOpen`] while the operation's circuit is open, and with
    /// [`Error::Unrecovered`] when the chosen strategy did not succeed.
    pub async fn recover_from_error(&self, err: &anyhow::Error, ctx: RecoveryContext) -> Result<RecoveryOutcome> {
        let category = classify(err);
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
            severity: severity(category),
            operation: ctx.operation.clone(),
            target: ctx.target.clone(),
            session_id: ctx.session_id.clone(),
            message: format!("{err:#}"),
        };
        warn!(
            operation = %ctx.operation,
            target = %ctx.target,
            category = %category,
            severity = %record.severity,
            error = %record.message,
            "recovering from error"
        );

        let key = ctx.key();
        let (attempt, strategy) = {
            let mut st = self.state.lock().await;
            self.push_history(&mut st, record.clone());

            let breaker = st.circuits.entry(ctx.operation.clone()).or_default();
            if !ctx.holds_probe {
                if let Admission::Rejected { retry_in } = breaker.admit(Instant::now(), self.circuit_timeout()) {
                    return Err(Error::CircuitOpen { operation: ctx.operation.clone(), retry_in });
                }
            }

            let attempt = st.attempts.get(&key).map(|a| a.attempt_count).unwrap_or(0) + 1;
            let strategy = select(category, attempt);
            let wait = chrono::Duration::from_std(self.backoff_delay(attempt)).unwrap_or_default();
            st.attempts.insert(
                key.clone(),
                RecoveryAttempt { attempt_count: attempt, strategy, next_retry_time: Utc::now() + wait },
            );
            if strategy == RecoveryStrategy::ManualReview {
                st.manual_review.push_back(record.clone());
                while st.manual_review.len() > self.cfg.manual_review_limit {
                    st.manual_review.pop_front();
                }
                st.alert(
                    Severity::Medium,
                    "manual-review",
                    format!("{key} queued for manual review after {} attempts", attempt - 1),
                );
            }
            (attempt, strategy)
        };

        info!(key = %key, attempt, strategy = %strategy, "running recovery strategy");
        let (success, data, message) = self.execute(strategy, attempt, &ctx).await;

        let mut st = self.state.lock().await;
        if success {
            st.attempts.remove(&key);
            if let Some(cb) = st.circuits.get_mut(&ctx.operation) {
                cb.on_success();
            }
            info!(key = %key, strategy = %strategy, %message, "recovered");
            return Ok(RecoveryOutcome { success, data, message, strategy, attempt });
        }

        self.fail_circuit(&mut st, &ctx.operation);
        if attempt > self.cfg.max_recovery_attempts {
            st.attempts.remove(&key);
            warn!(key = %key, attempt, "recovery attempts exhausted; counter dropped");
        }
        Err(Error::Unrecovered {
            operation: ctx.operation.clone(),
            target: ctx.target.clone(),
            strategy: strategy.to_string(),
            message,
        })
    }

    async fn execute(&self, strategy: RecoveryStrategy, attempt: u32, ctx: &RecoveryContext) -> (bool, Option<Value>, String) {
        match strategy {
            RecoveryStrategy::Retry => {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
                run_retry(ctx).await
            }
            RecoveryStrategy::Fallback | RecoveryStrategy::Cache => {
                let cached = self.state.lock().await.cache.get(&ctx.key()).cloned();
                match cached {
                    Some(v) => (true, Some(v), "served last-known-good data".into()),
                    None => (true, Some(default_payload(ctx.type_tag())), "no cached data; served empty default".into()),
                }
            }
            RecoveryStrategy::Reparse => match &ctx.raw_html {
                Some((html, hint)) => match extract::parse(html, *hint) {
                    Ok(rec) => to_value(&clean::clean(&rec), "reparsed and cleaned"),
                    Err(e) => (false, None, format!("reparse failed: {e}")),
                },
                None => (false, None, "no raw page to reparse".into()),
            },
            RecoveryStrategy::Clean => match &ctx.record {
                Some(v) => match reclean(v) {
                    Some(c) => to_value(&c, "record re-cleaned"),
                    None => (false, None, "record in hand is not a known record shape".into()),
                },
                None => (false, None, "no record to clean".into()),
            },
            RecoveryStrategy::Restore => match self.backups.restore(ctx.type_tag()) {
                Ok(Some(b)) => (true, Some(b.payload), format!("restored backup {}", b.id)),
                Ok(None) => (false, None, format!("no backup for {}", ctx.type_tag())),
                Err(e) => {
                    self.state.lock().await.alert(Severity::Critical, "data-corruption", e.to_string());
                    (false, None, e.to_string())
                }
            },
            RecoveryStrategy::Delay | RecoveryStrategy::Throttle => {
                let ms = if strategy == RecoveryStrategy::Delay {
                    self.cfg.delay_cooldown_ms
                } else {
                    self.cfg.throttle_cooldown_ms
                };
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if ctx.retry.is_some() {
                    run_retry(ctx).await
                } else {
                    (false, None, format!("cooled down {ms}ms; nothing to retry"))
                }
            }
            RecoveryStrategy::Skip => (
                true,
                Some(json!({ "skipped": true, "operation": ctx.operation, "target": ctx.target })),
                "skipped".into(),
            ),
            RecoveryStrategy::ManualReview => (false, None, "queued for manual review".into()),
        }
    }

    fn push_history(&self, st: &mut State, record: ErrorRecord) {
        st.history.push_back(record);
        let cutoff = Utc::now() - chrono::Duration::hours(self.cfg.error_history_max_age_hours);
        while st.history.front().is_some_and(|r| r.timestamp < cutoff) {
            st.history.pop_front();
        }
        while st.history.len() > self.cfg.error_history_limit {
            st.history.pop_front();
        }
    }

    fn fail_circuit(&self, st: &mut State, operation: &str) {
        let threshold = self.cfg.circuit_breaker_threshold;
        let cb = st.circuits.entry(operation.to_string()).or_default();
        if cb.on_failure(Instant::now(), threshold) {
            let failures = cb.failure_count();
            st.alert(
                Severity::High,
                "circuit-open",
                format!("circuit for {operation} opened after {failures} consecutive failures"),
            );
        }
    }

    /// Ask the circuit for `operation` whether a call may run.
    ///
    /// Fails fast while the circuit is open and its timeout has not elapsed,
    /// and while another caller holds the half-open probe. An
    /// [`Admission::Probe`] must be settled with [`Self::record_success`] or a
    /// recovery whose context carries it via [`RecoveryContext::probe`].
    pub async fn circuit_gate(&self, operation: &str) -> Result<Admission> {
        let mut st = self.state.lock().await;
        let Some(cb) = st.circuits.get_mut(operation) else {
            return Ok(Admission::Allowed);
        };
        match cb.admit(Instant::now(), self.circuit_timeout()) {
            Admission::Rejected { retry_in } => Err(Error::CircuitOpen { operation: operation.to_string(), retry_in }),
            Admission::Probe => {
                info!(operation, "circuit half-open, probing");
                Ok(Admission::Probe)
            }
            Admission::Allowed => Ok(Admission::Allowed),
        }
    }

    /// Signal success: clears the key's attempts, closes the circuit and
    /// caches `data` as last-known-good.
    pub async fn record_success(&self, operation: &str, target: &str, data: Option<Value>) {
        let key = format!("{operation}:{target}");
        let mut st = self.state.lock().await;
        st.attempts.remove(&key);
        if let Some(cb) = st.circuits.get_mut(operation) {
            if cb.state() != CircuitState::Closed {
                info!(operation, "circuit closed");
            }
            cb.on_success();
        }
        if let Some(v) = data {
            st.cache.insert(key, v);
        }
    }

    /// Count a failure against `operation`'s circuit without recovery.
    pub async fn record_failure(&self, operation: &str) {
        let mut st = self.state.lock().await;
        self.fail_circuit(&mut st, operation);
    }

    /// True while the circuit is open or half-open.
    pub async fn is_circuit_breaker_open(&self, operation: &str) -> bool {
        self.circuit_state(operation).await != CircuitState::Closed
    }

    /// Current circuit state; unknown operations are closed.
    pub async fn circuit_state(&self, operation: &str) -> CircuitState {
        self.state.lock().await.circuits.get(operation).map(|c| c.state()).unwrap_or(CircuitState::Closed)
    }

    /// Current recovery progress for a key.
    pub async fn attempt(&self, operation: &str, target: &str) -> Option<RecoveryAttempt> {
        self.state.lock().await.attempts.get(&format!("{operation}:{target}")).cloned()
    }

    /// Counters over the rolling error history.
    pub async fn error_statistics(&self) -> ErrorStatistics {
        let st = self.state.lock().await;
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let mut stats = ErrorStatistics {
            total_errors: st.history.len(),
            last_hour: st.history.iter().filter(|r| r.timestamp >= hour_ago).count(),
            pending_recoveries: st.attempts.len(),
            manual_review: st.manual_review.len(),
            ..Default::default()
        };
        for r in &st.history {
            *stats.by_category.entry(r.category.to_string()).or_default() += 1;
            *stats.by_severity.entry(r.severity.to_string()).or_default() += 1;
        }
        stats.open_circuits = st
            .circuits
            .iter()
            .filter(|(_, c)| c.state() != CircuitState::Closed)
            .map(|(k, _)| k.clone())
            .collect();
        stats.open_circuits.sort();
        stats
    }

    /// Errors waiting for out-of-band inspection.
    pub async fn manual_review_queue(&self) -> Vec<ErrorRecord> {
        self.state.lock().await.manual_review.iter().cloned().collect()
    }

    /// Raised alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.lock().await.alerts.iter().cloned().collect()
    }

    /// Persist a checksummed backup of `payload`.
    pub fn create_backup(&self, data_type: &str, payload: Value) -> Result<Backup> {
        let b = self.backups.create(data_type, payload)?;
        info!(data_type, id = %b.id, "backup created");
        Ok(b)
    }

    /// Most recent verified backup for `data_type`.
    pub fn latest_backup(&self, data_type: &str) -> Result<Option<Backup>> {
        self.backups.restore(data_type)
    }

    /// Drop backups past the retention window.
    pub fn prune_backups(&self) -> Result<usize> {
        let removed = self.backups.prune(chrono::Duration::days(self.cfg.backup_retention_days))?;
        if removed > 0 {
            info!(removed, "pruned expired backups");
        }
        Ok(removed)
    }

    /// Run the consistency, completeness, validity and backup checks.
    pub async fn run_integrity_check(&self) -> Result<IntegrityReport> {
        let backups = self.backups.scan();
        let mut st = self.state.lock().await;
        let consistency = {
            let circuits: Vec<integrity::CircuitView<'_>> = st
                .circuits
                .iter()
                .map(|(op, c)| integrity::CircuitView {
                    operation: op,
                    state: c.state(),
                    failure_count: c.failure_count(),
                })
                .collect();
            let attempts: Vec<(&str, u32)> =
                st.attempts.iter().map(|(k, a)| (k.as_str(), a.attempt_count)).collect();
            integrity::check_consistency(
                &circuits,
                self.cfg.circuit_breaker_threshold,
                &attempts,
                self.cfg.max_recovery_attempts + 1,
            )
        };
        let report = IntegrityReport::from_checks(vec![
            ("consistency", consistency),
            ("completeness", integrity::check_completeness(&st.cache)),
            ("validity", integrity::check_validity(&st.cache)),
            ("backups", integrity::check_backups(&backups)),
        ]);
        for (name, outcome) in &report.checks {
            for issue in &outcome.issues {
                st.alert(Severity::Medium, "integrity", format!("{name}: {issue}"));
            }
        }
        info!(status = ?report.overall_status, issues = report.issues_found, "integrity check finished");
        Ok(report)
    }
}

async fn run_retry(ctx: &RecoveryContext) -> (bool, Option<Value>, String) {
    match &ctx.retry {
        Some(f) => match f().await {
            Ok(v) => (true, Some(v), "retry succeeded".into()),
            Err(e) => (false, None, format!("retry failed: {e:#}")),
        },
        None => (false, None, "no retry function supplied".into()),
    }
}

fn reclean(v: &Value) -> Option<CleanedRecord> {
    if let Ok(c) = serde_json::from_value::<CleanedRecord>(v.clone()) {
        return Some(clean::clean(&c.to_raw()));
    }
    serde_json::from_value::<ExtractedRecord>(v.clone()).ok().map(|raw| clean::clean(&raw))
}

fn to_value(c: &CleanedRecord, msg: &str) -> (bool, Option<Value>, String) {
    match serde_json::to_value(c) {
        Ok(v) => (true, Some(v), msg.to_string()),
        Err(e) => (false, None, format!("serialize cleaned record: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::store::open_default;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager(cfg: RecoveryConfig) -> (tempfile::TempDir, ErrorRecoveryManager) {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        (dir, ErrorRecoveryManager::new(cfg, kv))
    }

    fn network_err() -> anyhow::Error {
        FetchError::Network { url: "https://x/race".into(), message: "reset".into() }.into()
    }

    #[tokio::test(start_paused = true)]
    async fn kth_failure_selects_kth_strategy() {
        let (_d, m) = manager(RecoveryConfig { circuit_breaker_threshold: 100, ..Default::default() });
        let parse_err = anyhow::Error::new(crate::error::ParseError::NotHtml);
        // Reparse without a page fails, fallback succeeds and resets the key.
        let e = m.recover_from_error(&parse_err, RecoveryContext::new("race", "tdf")).await.unwrap_err();
        assert!(matches!(e, Error::Unrecovered { ref strategy, .. } if strategy == "reparse"));
        let out = m.recover_from_error(&parse_err, RecoveryContext::new("race", "tdf")).await.unwrap();
        assert_eq!((out.strategy, out.attempt), (RecoveryStrategy::Fallback, 2));
        assert!(m.attempt("race", "tdf").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn strategies_fall_through_in_order() {
        let (_d, m) = manager(RecoveryConfig { circuit_breaker_threshold: 100, ..Default::default() });
        let err = anyhow::anyhow!("record field invalid");
        let bad = json!({"not": "a record"});
        // validation-error: [clean, skip]; clean fails on an unknown shape.
        let ctx = || RecoveryContext::new("riders", "x").record(bad.clone());
        assert!(m.recover_from_error(&err, ctx()).await.is_err());
        let skip = m.recover_from_error(&err, ctx()).await.unwrap();
        assert_eq!(skip.strategy, RecoveryStrategy::Skip);

        // A fresh key: the failing retry moves it on to fallback, which
        // hands back the empty default and never reaches manual review.
        let net = network_err();
        let ctx = || RecoveryContext::new("fetch", "y").retry(|| Box::pin(async { Err::<Value, _>(anyhow::anyhow!("still down")) }));
        let _ = m.recover_from_error(&net, ctx()).await;
        let out = m.recover_from_error(&net, ctx()).await.unwrap();
        assert_eq!(out.strategy, RecoveryStrategy::Fallback);
        assert_eq!(out.data, Some(json!({})));
        assert!(m.manual_review_queue().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_review_after_strategies_exhausted() {
        let (_d, m) = manager(RecoveryConfig { circuit_breaker_threshold: 100, ..Default::default() });
        let err = anyhow::anyhow!("HTTP 429 too many requests");
        let ctx = || RecoveryContext::new("fetch", "z");
        for expected in ["throttle", "delay", "manual-review"] {
            let e = m.recover_from_error(&err, ctx()).await.unwrap_err();
            assert!(matches!(e, Error::Unrecovered { ref strategy, .. } if strategy == expected));
        }
        assert_eq!(m.manual_review_queue().await.len(), 1);
        assert!(m.alerts().await.iter().any(|a| a.kind == "manual-review"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_review_queue_is_bounded() {
        let cfg = RecoveryConfig { circuit_breaker_threshold: 10_000, manual_review_limit: 5, ..Default::default() };
        let (_d, m) = manager(cfg);
        let err = anyhow::anyhow!("HTTP 429 too many requests");
        for _ in 0..12 {
            let _ = m.recover_from_error(&err, RecoveryContext::new("fetch", "z")).await;
        }
        let queue = m.manual_review_queue().await;
        assert_eq!(queue.len(), 5);
        assert!(queue.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(m.error_statistics().await.manual_review, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_gate_admits_a_single_caller() {
        let cfg = RecoveryConfig { circuit_breaker_threshold: 1, circuit_breaker_timeout_ms: 1_000, ..Default::default() };
        let (_d, m) = manager(cfg);
        m.record_failure("teams").await;
        assert!(matches!(m.circuit_gate("teams").await, Err(Error::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(m.circuit_gate("teams").await.unwrap(), Admission::Probe);
        assert_eq!(m.circuit_state("teams").await, CircuitState::HalfOpen);
        // A second caller while the probe is in flight fails fast.
        assert!(matches!(m.circuit_gate("teams").await, Err(Error::CircuitOpen { .. })));

        m.record_success("teams", "uae", None).await;
        assert_eq!(m.circuit_gate("teams").await.unwrap(), Admission::Allowed);
        assert_eq!(m.circuit_gate("riders").await.unwrap(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_recovery_reopens_the_circuit() {
        let cfg = RecoveryConfig { circuit_breaker_threshold: 1, circuit_breaker_timeout_ms: 1_000, ..Default::default() };
        let (_d, m) = manager(cfg);
        m.record_failure("fetch").await;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        let admission = m.circuit_gate("fetch").await.unwrap();

        let ctx = RecoveryContext::new("fetch", "b")
            .probe(admission)
            .retry(|| Box::pin(async { Err::<Value, _>(anyhow::anyhow!("still down")) }));
        let e = m.recover_from_error(&network_err(), ctx).await.unwrap_err();
        assert!(matches!(e, Error::Unrecovered { ref strategy, .. } if strategy == "retry"));
        assert_eq!(m.circuit_state("fetch").await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_at_threshold_and_closes_after_probe() {
        let cfg = RecoveryConfig { circuit_breaker_threshold: 3, circuit_breaker_timeout_ms: 60_000, ..Default::default() };
        let (_d, m) = manager(cfg);
        for _ in 0..3 {
            m.record_failure("fetch").await;
        }
        assert!(m.is_circuit_breaker_open("fetch").await);
        assert!(m.alerts().await.iter().any(|a| a.kind == "circuit-open"));

        let e = m.recover_from_error(&network_err(), RecoveryContext::new("fetch", "a")).await.unwrap_err();
        assert!(matches!(e, Error::CircuitOpen { .. }));
        assert!(m.circuit_gate("fetch").await.is_err());

        tokio::time::advance(Duration::from_millis(60_000)).await;
        let admission = m.circuit_gate("fetch").await.unwrap();
        assert_eq!(admission, Admission::Probe);
        // Still open until the probe succeeds.
        assert!(m.is_circuit_breaker_open("fetch").await);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ctx = RecoveryContext::new("fetch", "a").probe(admission).retry(move || {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<Value, anyhow::Error>(json!({"ok": true}))
            })
        });
        let out = m.recover_from_error(&network_err(), ctx).await.unwrap();
        assert_eq!(out.strategy, RecoveryStrategy::Retry);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!m.is_circuit_breaker_open("fetch").await);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let (_d, m) = manager(RecoveryConfig { circuit_breaker_threshold: 2, ..Default::default() });
        m.record_failure("teams").await;
        m.record_success("teams", "uae", Some(json!({"teamName": "UAE"}))).await;
        m.record_failure("teams").await;
        assert!(!m.is_circuit_breaker_open("teams").await);

        let out = m
            .recover_from_error(&anyhow::anyhow!("unexpected token in html"), RecoveryContext::new("teams", "uae"))
            .await;
        // parsing-error: reparse fails without a page
        assert!(out.is_err());
        let out = m
            .recover_from_error(&anyhow::anyhow!("unexpected token in html"), RecoveryContext::new("teams", "uae"))
            .await;
        // second failure opened the circuit
        assert!(matches!(out, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_serves_last_known_good() {
        let (_d, m) = manager(RecoveryConfig::default());
        m.record_success("race", "tdf", Some(json!({"raceName": "TdF"}))).await;
        let err = anyhow::anyhow!("selector did not match; parse failed");
        assert!(m.recover_from_error(&err, RecoveryContext::new("race", "tdf")).await.is_err());
        let out = m.recover_from_error(&err, RecoveryContext::new("race", "tdf")).await.unwrap();
        assert_eq!(out.strategy, RecoveryStrategy::Fallback);
        assert_eq!(out.data, Some(json!({"raceName": "TdF"})));
    }

    #[tokio::test(start_paused = true)]
    async fn reparse_uses_page_in_hand() {
        let (_d, m) = manager(RecoveryConfig::default());
        let err = anyhow::anyhow!("selector did not match; parse failed");
        let ctx = RecoveryContext::new("race", "tdf").raw_html("<h1>TdF</h1>", SchemaHint::RaceResult);
        let out = m.recover_from_error(&err, ctx).await.unwrap();
        assert_eq!(out.strategy, RecoveryStrategy::Reparse);
        assert_eq!(out.data.unwrap()["type"], "race-result");
    }

    #[tokio::test(start_paused = true)]
    async fn restore_uses_latest_backup() {
        let (_d, m) = manager(RecoveryConfig::default());
        m.create_backup("race-result", json!({"results": [1]})).unwrap();
        let err = anyhow::Error::new(Error::DataCorruption("bad cache".into()));
        let ctx = RecoveryContext::new("race", "tdf").data_type("race-result");
        let out = m.recover_from_error(&err, ctx).await.unwrap();
        assert_eq!(out.strategy, RecoveryStrategy::Restore);
        assert_eq!(out.data, Some(json!({"results": [1]})));
        assert_eq!(m.error_statistics().await.by_category["data-corruption"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn integrity_check_is_healthy_with_no_issues() {
        let (_d, m) = manager(RecoveryConfig::default());
        m.record_success("race", "tdf", Some(json!({"raceName": "TdF"}))).await;
        m.create_backup("race-result", json!({"results": []})).unwrap();
        let report = m.run_integrity_check().await.unwrap();
        assert_eq!(report.overall_status, HealthStatus::Healthy);
        assert_eq!(report.issues_found, 0);
        assert_eq!(report.checks.len(), 4);

        m.record_success("race", "giro", Some(json!({}))).await;
        let report = m.run_integrity_check().await.unwrap();
        assert_eq!(report.overall_status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn corrupted_backup_file_is_reported_not_fatal() {
        let (dir, m) = manager(RecoveryConfig::default());
        m.create_backup("race-result", json!({"results": []})).unwrap();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            std::fs::write(entry.unwrap().path(), b"{\"trunc").unwrap();
        }

        let report = m.run_integrity_check().await.unwrap();
        assert_ne!(report.overall_status, HealthStatus::Healthy);
        let issues = &report.checks["backups"].issues;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("backup race-result:") && issues[0].ends_with("unreadable"), "{issues:?}");
        assert!(m.alerts().await.iter().any(|a| a.kind == "integrity"));
    }

    #[test]
    fn backoff_is_capped() {
        let (_d, m) = manager(RecoveryConfig::default());
        assert_eq!(m.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(m.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(m.backoff_delay(30), Duration::from_secs(300));
    }
}
