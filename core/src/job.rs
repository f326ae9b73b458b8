use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fetch::FetchStats;

/// Priority class of a scheduled job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Time-sensitive (race results during a race).
    High,
    /// Regular refreshes.
    #[default]
    Medium,
    /// Background refreshes.
    Low,
}

impl FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(JobPriority::High),
            "medium" | "normal" => Ok(JobPriority::Medium),
            "low" => Ok(JobPriority::Low),
            other => Err(format!("unknown priority {other}")),
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobPriority::High => "high",
            JobPriority::Medium => "medium",
            JobPriority::Low => "low",
        })
    }
}

/// Lifecycle of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Handler is in flight.
    Running,
    /// Handler returned `Ok`.
    Completed,
    /// Handler returned `Err` or timed out.
    Failed,
    /// The scheduler stopped while the handler was in flight.
    Terminated,
}

impl ExecutionStatus {
    /// Whether the execution has settled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One invocation of a job handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    /// Unique execution id.
    pub id: Uuid,
    /// Name of the job that was invoked.
    pub job_name: String,
    /// Priority class copied from the job.
    pub priority: JobPriority,
    /// When the handler was started.
    pub start_time: DateTime<Utc>,
    /// When the execution settled, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Current status.
    pub status: ExecutionStatus,
    /// How many retries preceded this execution (0 for the first run).
    pub retries: u32,
    /// Wall time in milliseconds, once settled.
    pub duration_ms: Option<u64>,
    /// Handler output on success.
    pub result: Option<serde_json::Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl JobExecution {
    /// New running execution starting now.
    pub fn start(job_name: &str, priority: JobPriority, retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            priority,
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Running,
            retries,
            duration_ms: None,
            result: None,
            error: None,
        }
    }

    /// Move to a terminal status, stamping end time and duration.
    pub fn settle(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds().max(0) as u64);
    }
}

/// A failed execution waiting in the retry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    /// The failed execution.
    pub execution: JobExecution,
    /// Retries performed so far.
    pub retries: u32,
    /// When the retry sweep may pick it up.
    pub next_retry: DateTime<Utc>,
    /// When the execution failed.
    pub failed_at: DateTime<Utc>,
}

/// Running counters kept by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Executions started.
    pub total_executions: u64,
    /// Executions that completed.
    pub successful_executions: u64,
    /// Executions that failed (including timeouts).
    pub failed_executions: u64,
    /// Executions that hit the cooperative timeout.
    pub timed_out_executions: u64,
    /// Executions marked terminated at stop.
    pub terminated_executions: u64,
    /// Triggers deferred by admission control.
    pub deferred_triggers: u64,
    /// Retries started by the retry sweep.
    pub retries_attempted: u64,
    /// Failed executions dropped after exhausting retries.
    pub abandoned_jobs: u64,
    /// Running average duration of completed executions (ms).
    pub average_duration_ms: f64,
    /// Start of the most recent execution.
    pub last_execution: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    /// Fold a completed duration into the running average.
    pub fn record_duration(&mut self, duration_ms: u64) {
        let n = self.successful_executions.max(1) as f64;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / n;
    }
}

/// Point-in-time view of the scheduler, persisted for `collector status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether the scheduler was running when the snapshot was taken.
    pub running: bool,
    /// When the snapshot was taken.
    pub taken_at: Option<DateTime<Utc>>,
    /// Registered job names.
    pub jobs: Vec<String>,
    /// Executions in flight.
    pub active_jobs: usize,
    /// Entries waiting in the retry table.
    pub failed_backlog: usize,
    /// Retained history entries.
    pub history_len: usize,
    /// Counters.
    pub stats: SchedulerStats,
    /// Fetcher counters at the time of the snapshot.
    pub fetch: FetchStats,
}
