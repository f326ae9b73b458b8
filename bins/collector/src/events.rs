use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle events published by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    Started { jobs: Vec<String> },
    JobDeferred { job: String, active: usize, max: usize },
    JobStarted { execution_id: Uuid, job: String, retries: u32 },
    JobCompleted { execution_id: Uuid, job: String, duration_ms: u64, retries: u32 },
    JobFailed { execution_id: Uuid, job: String, error: String, timed_out: bool },
    RetryScheduled { job: String, retries: u32, next_retry: DateTime<Utc> },
    JobAbandoned { job: String, retries: u32, error: String },
    JobTerminated { execution_id: Uuid, job: String },
    HealthWarning { issues: Vec<String> },
    ResourceWarning { rss_mb: u64, threshold_mb: u64 },
    CleanedUp { history_removed: usize, failed_removed: usize },
    Stopped { terminated: usize },
}

impl SchedulerEvent {
    /// Job the event is about, if any.
    pub fn job(&self) -> Option<&str> {
        match self {
            SchedulerEvent::JobDeferred { job, .. }
            | SchedulerEvent::JobStarted { job, .. }
            | SchedulerEvent::JobCompleted { job, .. }
            | SchedulerEvent::JobFailed { job, .. }
            | SchedulerEvent::RetryScheduled { job, .. }
            | SchedulerEvent::JobAbandoned { job, .. }
            | SchedulerEvent::JobTerminated { job, .. } => Some(job),
            _ => None,
        }
    }
}

/// Receives every event, in order, on the task that produced it.
/// Implementations must not block.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: &SchedulerEvent);
}

impl<F> EventListener for F
where
    F: Fn(&SchedulerEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &SchedulerEvent) {
        self(event)
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventListener for ChannelListener {
    fn on_event(&self, event: &SchedulerEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}
