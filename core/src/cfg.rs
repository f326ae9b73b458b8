use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::job::JobPriority;

/// Environment variable that relocates the config directory (tests, containers).
pub const CONFIG_DIR_ENV: &str = "PELO_CONFIG_DIR";

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"pelotoniq"`.
    pub organization: &'static str,
    /// Application name, e.g. `"collector"`.
    pub application: &'static str,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Directory for the KV store, backups and status snapshots.
    /// Defaults to the platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    /// Outbound fetching.
    pub fetch: FetchConfig,
    /// Job scheduling.
    pub scheduler: SchedulerConfig,
    /// Error recovery and circuit breakers.
    pub recovery: RecoveryConfig,
    /// Backend storage API.
    pub backend: BackendConfig,
    /// Scrape job definitions.
    pub jobs: JobsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            data_dir: None,
            fetch: FetchConfig::default(),
            scheduler: SchedulerConfig::default(),
            recovery: RecoveryConfig::default(),
            backend: BackendConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

/// Rate limits, retries and politeness for the fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the scraped site; relative targets are joined onto it.
    pub base_url: String,
    /// Per-minute request budget.
    pub requests_per_minute: u32,
    /// Per-hour request budget.
    pub requests_per_hour: u32,
    /// Minimum gap between two consecutive requests (ms).
    pub min_request_delay_ms: u64,
    /// Per-request timeout (ms).
    pub timeout_ms: u64,
    /// Retries for transient failures (timeouts, 5xx, network).
    pub max_retries: u32,
    /// First backoff step (ms); doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Backoff cap (ms).
    pub max_backoff_ms: u64,
    /// Extra cooldown after an HTTP 429 (ms).
    pub rate_limit_cooldown_ms: u64,
    /// Consult robots.txt before each request.
    pub respect_robots: bool,
    /// Rotate through the built-in user agents.
    pub rotate_user_agents: bool,
    /// Rotate the user agent every this many requests.
    pub rotate_every: u32,
    /// Fixed user agent; disables rotation when set.
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.procyclingstats.com".to_string(),
            requests_per_minute: 30,
            requests_per_hour: 1000,
            min_request_delay_ms: 2_000,
            timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_backoff_ms: 30_000,
            rate_limit_cooldown_ms: 60_000,
            respect_robots: true,
            rotate_user_agents: true,
            rotate_every: 10,
            user_agent: None,
        }
    }
}

impl FetchConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Concurrency, timeouts, retries and housekeeping for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Cooperative timeout for a single execution (s).
    pub max_job_duration_secs: u64,
    /// Delay before re-attempting a trigger deferred by admission control (s).
    pub defer_delay_secs: u64,
    /// Delay before the first retry of a failed execution (s).
    pub retry_delay_secs: u64,
    /// Multiplier applied to the retry delay per subsequent failure.
    pub retry_multiplier: f64,
    /// Cap on the retry delay (s).
    pub max_retry_delay_secs: u64,
    /// Retries per failed execution before it is abandoned.
    pub max_retries: u32,
    /// Maximum retained history entries.
    pub history_limit: usize,
    /// History entries older than this are pruned (days).
    pub history_max_age_days: i64,
    /// Maximum retained failed-job entries; the oldest failures go first.
    pub failed_limit: usize,
    /// Failed-job backlog size that triggers a health warning.
    pub failed_backlog_warning: usize,
    /// Resident memory above this triggers a resource warning (MB).
    pub memory_threshold_mb: u64,
    /// Cron expression for the health check. This and the other
    /// housekeeping crons disable their job when empty.
    pub health_check_cron: String,
    /// Cron expression for the resource monitor.
    pub resource_monitor_cron: String,
    /// Cron expression for history and failed-job cleanup.
    pub cleanup_cron: String,
    /// Cron expression for the failed-job retry sweep.
    pub retry_sweep_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_job_duration_secs: 30 * 60,
            defer_delay_secs: 30,
            retry_delay_secs: 5 * 60,
            retry_multiplier: 2.0,
            max_retry_delay_secs: 60 * 60,
            max_retries: 3,
            history_limit: 1000,
            history_max_age_days: 30,
            failed_limit: 200,
            failed_backlog_warning: 10,
            memory_threshold_mb: 512,
            health_check_cron: "0 */5 * * * *".to_string(),
            resource_monitor_cron: "30 * * * * *".to_string(),
            cleanup_cron: "0 0 4 * * *".to_string(),
            retry_sweep_cron: "0 */10 * * * *".to_string(),
        }
    }
}

/// Recovery attempts, circuit breakers, error history and backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts per (operation, target) before the record is dropped.
    pub max_recovery_attempts: u32,
    /// Consecutive failures that open a circuit.
    pub circuit_breaker_threshold: u32,
    /// Time an open circuit waits before a half-open probe (ms).
    pub circuit_breaker_timeout_ms: u64,
    /// First recovery backoff step (ms).
    pub base_retry_delay_ms: u64,
    /// Recovery backoff multiplier.
    pub backoff_multiplier: f64,
    /// Recovery backoff cap (ms).
    pub max_retry_delay_ms: u64,
    /// Cooldown used by the `delay` strategy (ms).
    pub delay_cooldown_ms: u64,
    /// Cooldown used by the `throttle` strategy (ms).
    pub throttle_cooldown_ms: u64,
    /// Integrity check interval (s).
    pub integrity_check_interval_secs: u64,
    /// Backups older than this are pruned (days).
    pub backup_retention_days: i64,
    /// Maximum retained error records.
    pub error_history_limit: usize,
    /// Error records older than this are pruned (hours).
    pub error_history_max_age_hours: i64,
    /// Maximum records waiting for manual review; the oldest are dropped first.
    pub manual_review_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 5,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
            base_retry_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 5 * 60 * 1000,
            delay_cooldown_ms: 5_000,
            throttle_cooldown_ms: 60_000,
            integrity_check_interval_secs: 60 * 60,
            backup_retention_days: 7,
            error_history_limit: 1000,
            error_history_max_age_hours: 24,
            manual_review_limit: 500,
        }
    }
}

/// Backend storage API the cleaned data is sent to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Send data to the backend; when false the sink only logs.
    pub enabled: bool,
    /// Base URL, e.g. `http://localhost:8080/api`.
    pub base_url: String,
    /// Request timeout (ms).
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:8080/api".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// One scrape job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobEntryConfig {
    /// Register the job at scheduler start.
    pub enabled: bool,
    /// Cron expression (5 or 6 fields).
    pub cron: String,
    /// Priority class.
    pub priority: JobPriority,
    /// Targets (slugs or absolute URLs) scraped on every run.
    pub targets: Vec<String>,
}

impl JobEntryConfig {
    fn with(cron: &str, priority: JobPriority) -> Self {
        Self { enabled: true, cron: cron.to_string(), priority, targets: Vec::new() }
    }
}

impl Default for JobEntryConfig {
    fn default() -> Self {
        Self::with("0 0 * * * *", JobPriority::Medium)
    }
}

/// Scrape job definitions per record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Race results, refreshed often during the season.
    pub race_results: JobEntryConfig,
    /// Rider profiles.
    pub rider_profiles: JobEntryConfig,
    /// Team rosters.
    pub team_rosters: JobEntryConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            race_results: JobEntryConfig::with("0 0 */6 * * *", JobPriority::High),
            rider_profiles: JobEntryConfig::with("0 0 2 * * *", JobPriority::Medium),
            team_rosters: JobEntryConfig::with("0 0 3 * * Mon", JobPriority::Low),
        }
    }
}

impl Config {
    /// Directory for the KV store, falling back to the platform data dir.
    pub fn resolve_data_dir(&self, app: &AppId) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
            .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
        Ok(pd.data_dir().to_path_buf())
    }

    /// Apply `PELO_*` environment overrides. Returns one message per ignored value.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_overrides_from(|k| std::env::var(k).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        let mut ov = Overrides { lookup: &lookup, ignored: &mut ignored };

        ov.set("PELO_LOG_LEVEL", &mut self.log_level);
        ov.set("PELO_LOG_FORMAT", &mut self.log_format);
        if let Some(dir) = lookup("PELO_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }

        ov.set("PELO_BASE_URL", &mut self.fetch.base_url);
        ov.set("PELO_REQUESTS_PER_MINUTE", &mut self.fetch.requests_per_minute);
        ov.set("PELO_REQUESTS_PER_HOUR", &mut self.fetch.requests_per_hour);
        ov.set("PELO_MIN_REQUEST_DELAY_MS", &mut self.fetch.min_request_delay_ms);
        ov.set("PELO_REQUEST_TIMEOUT_MS", &mut self.fetch.timeout_ms);
        ov.set("PELO_FETCH_RETRIES", &mut self.fetch.max_retries);
        ov.set("PELO_RESPECT_ROBOTS", &mut self.fetch.respect_robots);
        if let Some(ua) = lookup("PELO_USER_AGENT") {
            self.fetch.user_agent = Some(ua);
        }

        ov.set("PELO_MAX_CONCURRENT_JOBS", &mut self.scheduler.max_concurrent_jobs);
        ov.set("PELO_MAX_JOB_DURATION_SECS", &mut self.scheduler.max_job_duration_secs);
        ov.set("PELO_JOB_RETRIES", &mut self.scheduler.max_retries);
        ov.set("PELO_MEMORY_THRESHOLD_MB", &mut self.scheduler.memory_threshold_mb);

        ov.set("PELO_CIRCUIT_BREAKER_THRESHOLD", &mut self.recovery.circuit_breaker_threshold);
        ov.set("PELO_CIRCUIT_BREAKER_TIMEOUT_MS", &mut self.recovery.circuit_breaker_timeout_ms);
        ov.set("PELO_BACKUP_RETENTION_DAYS", &mut self.recovery.backup_retention_days);

        ov.set("PELO_BACKEND_URL", &mut self.backend.base_url);
        ov.set("PELO_BACKEND_ENABLED", &mut self.backend.enabled);

        ov.set("PELO_CRON_RACE_RESULTS", &mut self.jobs.race_results.cron);
        ov.set("PELO_CRON_RIDER_PROFILES", &mut self.jobs.rider_profiles.cron);
        ov.set("PELO_CRON_TEAM_ROSTERS", &mut self.jobs.team_rosters.cron);

        ignored
    }
}

struct Overrides<'a, F> {
    lookup: &'a F,
    ignored: &'a mut Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Overrides<'_, F> {
    fn set<T>(&mut self, key: &str, slot: &mut T)
    where
        T: FromStr,
    {
        let Some(raw) = (self.lookup)(key) else { return };
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => self.ignored.push(format!("ignoring {key}={raw:?}: not a valid value")),
        }
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => {
            let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
                .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
            pd.config_dir().to_path_buf()
        }
    };
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let dir = config_dir(app)?;
    load_or_init_at(&dir.join("config.toml"))
}

/// Load the config at `path`, writing defaults there first if it does not exist.
pub fn load_or_init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    } else {
        let cfg = Config::default();
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.fetch.requests_per_minute, 30);
        assert_eq!(cfg.scheduler.max_concurrent_jobs, 3);

        let again = load_or_init_at(&path).unwrap();
        assert_eq!(again.recovery.circuit_breaker_threshold, 5);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "log_level = \"debug\"\n[fetch]\nrequests_per_minute = 5\n").unwrap();
        let cfg = load_or_init_at(&path).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.fetch.requests_per_minute, 5);
        assert_eq!(cfg.fetch.requests_per_hour, 1000);
        assert_eq!(cfg.jobs.race_results.priority, JobPriority::High);
    }

    #[test]
    fn env_overrides_apply_and_report_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("PELO_MAX_CONCURRENT_JOBS", "7"),
            ("PELO_REQUESTS_PER_MINUTE", "lots"),
            ("PELO_LOG_FORMAT", "json"),
            ("PELO_CRON_TEAM_ROSTERS", "0 0 5 * * *"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        let ignored = cfg.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.scheduler.max_concurrent_jobs, 7);
        assert_eq!(cfg.fetch.requests_per_minute, 30);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.jobs.team_rosters.cron, "0 0 5 * * *");
        assert_eq!(ignored.len(), 1);
        assert!(ignored[0].contains("PELO_REQUESTS_PER_MINUTE"));
    }
}
