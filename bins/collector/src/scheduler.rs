use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pelo_core::cfg::SchedulerConfig;
use pelo_core::job::{ExecutionStatus, FailedJob, JobExecution, JobPriority, SchedulerStats, StatusSnapshot};

use crate::cron::CronSchedule;
use crate::events::{ChannelListener, EventListener, SchedulerEvent};
use crate::monitor;

/// Handed to every handler invocation. Timeouts and `stop` only signal
/// cancellation; handlers that want to stop early must watch for it.
pub struct JobContext {
    pub execution_id: Uuid,
    pub job_name: String,
    pub retries: u32,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the scheduler gives up on this execution.
    pub async fn cancelled(&mut self) {
        let _ = self.cancel.wait_for(|c| *c).await;
    }

    #[cfg(test)]
    pub(crate) fn for_test(execution_id: Uuid, job_name: &str, cancel: watch::Receiver<bool>) -> Self {
        Self { execution_id, job_name: job_name.to_string(), retries: 0, cancel }
    }
}

/// Work run by a job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A named, cron-scheduled unit of work.
#[derive(Clone)]
pub struct Job {
    name: String,
    schedule: CronSchedule,
    priority: JobPriority,
    handler: Arc<dyn JobHandler>,
}

impl Job {
    /// Fails with `InvalidSchedule` when `cron` does not parse.
    pub fn new(
        name: impl Into<String>,
        cron: &str,
        priority: JobPriority,
        handler: Arc<dyn JobHandler>,
    ) -> pelo_core::Result<Self> {
        Ok(Self { name: name.into(), schedule: CronSchedule::parse(cron)?, priority, handler })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }
}

/// Registered job as shown by `jobs()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub name: String,
    pub cron: String,
    pub priority: JobPriority,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Started(Uuid),
    /// Concurrency limit reached; the trigger is re-attempted later.
    Deferred,
    /// The same job already has an execution in flight.
    AlreadyRunning,
    Unknown,
    Stopped,
}

/// Counts removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub history_removed: usize,
    pub failed_removed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Aux {
    HealthCheck,
    ResourceMonitor,
    Cleanup,
    RetrySweep,
}

enum Trigger {
    Job(String),
    Aux(Aux),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Job(name) => f.write_str(name),
            Trigger::Aux(aux) => write!(f, "{aux:?}"),
        }
    }
}

struct Active {
    execution: JobExecution,
    cancel: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    active: HashMap<Uuid, Active>,
    history: VecDeque<JobExecution>,
    failed: HashMap<Uuid, FailedJob>,
    stats: SchedulerStats,
}

impl State {
    fn push_history(&mut self, exec: JobExecution, limit: usize) {
        self.history.push_back(exec);
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
        }
    }
}

struct Inner {
    cfg: SchedulerConfig,
    jobs: RwLock<BTreeMap<String, Job>>,
    state: Mutex<State>,
    listeners: StdMutex<Vec<Arc<dyn EventListener>>>,
    shutdown: watch::Sender<bool>,
    triggers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Cron-driven job runner with admission control, cooperative timeouts,
/// bounded history and a retry table for failed executions.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct DataCollectionScheduler {
    inner: Arc<Inner>,
}

impl DataCollectionScheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cfg,
                jobs: RwLock::new(BTreeMap::new()),
                state: Mutex::new(State::default()),
                listeners: StdMutex::new(Vec::new()),
                shutdown,
                triggers: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.cfg
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a job. Names are unique. Registering while running starts its
    /// trigger immediately.
    pub async fn register(&self, job: Job) -> anyhow::Result<()> {
        let name = job.name.clone();
        let schedule = job.schedule.clone();
        {
            let mut jobs = self.inner.jobs.write().await;
            if jobs.contains_key(&name) {
                bail!("job {name} is already registered");
            }
            jobs.insert(name.clone(), job);
        }
        info!(job = %name, cron = %schedule.expr(), "job registered");
        if self.is_running() {
            let handle = self.spawn_trigger(Trigger::Job(name), schedule);
            self.inner.triggers.lock().await.push(handle);
        }
        Ok(())
    }

    /// Build and register a job in one step.
    pub async fn schedule(
        &self,
        name: &str,
        cron: &str,
        priority: JobPriority,
        handler: Arc<dyn JobHandler>,
    ) -> anyhow::Result<()> {
        self.register(Job::new(name, cron, priority, handler)?).await
    }

    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    /// Subscribe a channel and return its receiving end.
    pub fn event_channel(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (listener, rx) = ChannelListener::new();
        self.subscribe(Arc::new(listener));
        rx
    }

    fn emit(&self, event: SchedulerEvent) {
        let listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for l in &listeners {
            l.on_event(&event);
        }
    }

    /// Start cron triggers for every registered job plus the auxiliary jobs.
    /// Auxiliary jobs with an empty cron expression are disabled.
    pub async fn start(&self) -> pelo_core::Result<()> {
        let cfg = &self.inner.cfg;
        let mut aux = Vec::new();
        for (kind, expr) in [
            (Aux::HealthCheck, &cfg.health_check_cron),
            (Aux::ResourceMonitor, &cfg.resource_monitor_cron),
            (Aux::Cleanup, &cfg.cleanup_cron),
            (Aux::RetrySweep, &cfg.retry_sweep_cron),
        ] {
            if !expr.trim().is_empty() {
                aux.push((kind, CronSchedule::parse(expr)?));
            }
        }

        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);

        let jobs: Vec<(String, CronSchedule)> =
            self.inner.jobs.read().await.values().map(|j| (j.name.clone(), j.schedule.clone())).collect();
        let mut triggers = self.inner.triggers.lock().await;
        for (name, schedule) in &jobs {
            triggers.push(self.spawn_trigger(Trigger::Job(name.clone()), schedule.clone()));
        }
        for (kind, schedule) in aux {
            triggers.push(self.spawn_trigger(Trigger::Aux(kind), schedule));
        }
        drop(triggers);

        let names: Vec<String> = jobs.into_iter().map(|(n, _)| n).collect();
        info!(jobs = ?names, max_concurrent = cfg.max_concurrent_jobs, "scheduler started");
        self.emit(SchedulerEvent::Started { jobs: names });
        Ok(())
    }

    fn spawn_trigger(&self, trigger: Trigger, schedule: CronSchedule) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut from = Utc::now();
            loop {
                let Some(next) = schedule.next_after(from) else {
                    warn!(trigger = %trigger, cron = %schedule.expr(), "schedule has no upcoming run");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        // Missed fire times are skipped, not replayed.
                        from = next.max(Utc::now());
                        this.on_trigger(&trigger).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn on_trigger(&self, trigger: &Trigger) {
        match trigger {
            Trigger::Job(name) => {
                debug!(job = %name, "cron trigger");
                match self.launch(name, 0).await {
                    Launch::Deferred => self.defer(name.clone()),
                    Launch::AlreadyRunning => info!(job = %name, "previous run still in flight, skipping trigger"),
                    _ => {}
                }
            }
            Trigger::Aux(Aux::HealthCheck) => {
                self.health_check().await;
            }
            Trigger::Aux(Aux::ResourceMonitor) => {
                self.resource_check().await;
            }
            Trigger::Aux(Aux::Cleanup) => {
                self.cleanup().await;
            }
            Trigger::Aux(Aux::RetrySweep) => {
                self.retry_due_jobs().await;
            }
        }
    }

    /// Run `name` now through the same admission path as a cron trigger.
    pub async fn trigger_now(&self, name: &str) -> anyhow::Result<Launch> {
        if !self.inner.jobs.read().await.contains_key(name) {
            bail!("unknown job {name}");
        }
        let launch = self.launch(name, 0).await;
        if launch == Launch::Deferred {
            self.defer(name.to_string());
        }
        Ok(launch)
    }

    fn defer(&self, name: String) {
        let this = self.clone();
        let delay = Duration::from_secs(self.inner.cfg.defer_delay_secs);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                if this.launch(&name, 0).await != Launch::Deferred {
                    return;
                }
            }
        });
    }

    /// Admission check and registration happen under one lock, so the active
    /// count can never exceed the limit.
    async fn launch(&self, name: &str, retries: u32) -> Launch {
        let Some(job) = self.inner.jobs.read().await.get(name).cloned() else {
            return Launch::Unknown;
        };
        let max = self.inner.cfg.max_concurrent_jobs.max(1);

        let mut st = self.inner.state.lock().await;
        if !self.is_running() {
            return Launch::Stopped;
        }
        if st.active.values().any(|a| a.execution.job_name == name) {
            return Launch::AlreadyRunning;
        }
        if st.active.len() >= max {
            st.stats.deferred_triggers += 1;
            let active = st.active.len();
            drop(st);
            info!(job = name, active, max, "concurrency limit reached, deferring");
            self.emit(SchedulerEvent::JobDeferred { job: name.to_string(), active, max });
            return Launch::Deferred;
        }
        let exec = JobExecution::start(name, job.priority, retries);
        let id = exec.id;
        let (cancel, cancel_rx) = watch::channel(false);
        st.stats.total_executions += 1;
        st.stats.last_execution = Some(exec.start_time);
        st.active.insert(id, Active { execution: exec, cancel });
        drop(st);

        info!(job = name, execution = %id, retries, priority = %job.priority, "job started");
        self.emit(SchedulerEvent::JobStarted { execution_id: id, job: name.to_string(), retries });
        tokio::spawn(self.clone().execute(job, id, retries, cancel_rx));
        Launch::Started(id)
    }

    async fn execute(self, job: Job, id: Uuid, retries: u32, cancel: watch::Receiver<bool>) {
        let ctx = JobContext { execution_id: id, job_name: job.name.clone(), retries, cancel };
        let handler = job.handler.clone();
        // Spawned separately so a panicking handler only fails its execution.
        let work = tokio::spawn(async move { handler.run(ctx).await });
        let limit = Duration::from_secs(self.inner.cfg.max_job_duration_secs);

        match tokio::time::timeout(limit, work).await {
            Ok(Ok(Ok(value))) => self.settle_success(id, value).await,
            Ok(Ok(Err(e))) => self.settle_failure(id, format!("{e:#}"), false).await,
            Ok(Err(join)) => self.settle_failure(id, format!("handler panicked: {join}"), false).await,
            Err(_) => {
                // The handler task keeps running; only the record is settled.
                self.settle_failure(id, format!("timed out after {}s", limit.as_secs()), true).await
            }
        }
    }

    async fn settle_success(&self, id: Uuid, value: Value) {
        let mut st = self.inner.state.lock().await;
        let Some(active) = st.active.remove(&id) else {
            debug!(execution = %id, "execution already settled, dropping late result");
            return;
        };
        let mut exec = active.execution;
        exec.settle(ExecutionStatus::Completed);
        exec.result = Some(value);
        let duration_ms = exec.duration_ms.unwrap_or(0);
        st.stats.successful_executions += 1;
        st.stats.record_duration(duration_ms);

        info!(job = %exec.job_name, execution = %id, duration_ms, retries = exec.retries, "job completed");
        let event = SchedulerEvent::JobCompleted {
            execution_id: id,
            job: exec.job_name.clone(),
            duration_ms,
            retries: exec.retries,
        };
        st.push_history(exec, self.inner.cfg.history_limit);
        drop(st);
        self.emit(event);
    }

    async fn settle_failure(&self, id: Uuid, message: String, timed_out: bool) {
        let cfg = &self.inner.cfg;
        let mut events = Vec::new();
        let mut st = self.inner.state.lock().await;
        let Some(active) = st.active.remove(&id) else {
            debug!(execution = %id, "execution already settled, dropping late failure");
            return;
        };
        if timed_out {
            let _ = active.cancel.send(true);
            st.stats.timed_out_executions += 1;
        }
        let mut exec = active.execution;
        exec.settle(ExecutionStatus::Failed);
        exec.error = Some(message.clone());
        st.stats.failed_executions += 1;
        let job = exec.job_name.clone();
        let retries = exec.retries;

        warn!(job = %job, execution = %id, retries, timed_out, error = %message, "job failed");
        events.push(SchedulerEvent::JobFailed {
            execution_id: id,
            job: job.clone(),
            error: message.clone(),
            timed_out,
        });

        if retries >= cfg.max_retries {
            st.stats.abandoned_jobs += 1;
            error!(job = %job, retries, error = %message, "job abandoned after exhausting retries");
            events.push(SchedulerEvent::JobAbandoned { job, retries, error: message });
        } else {
            let now = Utc::now();
            let delay = chrono::Duration::from_std(self.retry_delay(retries)).unwrap_or_else(|_| chrono::Duration::zero());
            let next_retry = now + delay;
            st.failed.insert(id, FailedJob { execution: exec.clone(), retries, next_retry, failed_at: now });
            info!(job = %job, next_retry = %next_retry, "retry scheduled");
            events.push(SchedulerEvent::RetryScheduled { job, retries: retries + 1, next_retry });
        }
        st.push_history(exec, cfg.history_limit);
        drop(st);
        for e in events {
            self.emit(e);
        }
    }

    /// Delay before the retry that follows `retries` earlier retries:
    /// `retry_delay * multiplier^retries`, capped.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let cfg = &self.inner.cfg;
        let secs = cfg.retry_delay_secs as f64 * cfg.retry_multiplier.max(1.0).powi(retries.min(64) as i32);
        Duration::from_secs_f64(secs.min(cfg.max_retry_delay_secs as f64))
    }

    /// Relaunch failed executions whose retry time has come. Entries that
    /// cannot be admitted stay in the table for the next sweep.
    pub async fn retry_due_jobs(&self) -> usize {
        let now = Utc::now();
        let max = self.inner.cfg.max_retries;
        let mut due: Vec<(Uuid, String, u32, JobPriority, DateTime<Utc>)> = {
            let st = self.inner.state.lock().await;
            st.failed
                .iter()
                .filter(|(_, f)| f.next_retry <= now && f.retries < max)
                .map(|(id, f)| (*id, f.execution.job_name.clone(), f.retries, f.execution.priority, f.next_retry))
                .collect()
        };
        due.sort_by_key(|(_, _, _, priority, next)| (*priority, *next));

        let mut started = 0;
        for (id, job, retries, _, _) in due {
            match self.launch(&job, retries + 1).await {
                Launch::Started(_) => {
                    let mut st = self.inner.state.lock().await;
                    st.failed.remove(&id);
                    st.stats.retries_attempted += 1;
                    started += 1;
                }
                Launch::Unknown => {
                    warn!(job = %job, "dropping retry for unregistered job");
                    self.inner.state.lock().await.failed.remove(&id);
                }
                Launch::Deferred | Launch::AlreadyRunning => {
                    debug!(job = %job, "retry not admitted, keeping it queued");
                }
                Launch::Stopped => break,
            }
        }
        if started > 0 {
            info!(started, "retry sweep relaunched failed jobs");
        }
        started
    }

    /// Flag concurrency saturation and a large failed-job backlog.
    pub async fn health_check(&self) -> Vec<String> {
        let cfg = &self.inner.cfg;
        let max = cfg.max_concurrent_jobs.max(1);
        let mut issues = Vec::new();
        {
            let st = self.inner.state.lock().await;
            if st.active.len() >= max {
                issues.push(format!("concurrency saturated: {} of {max} slots in use", st.active.len()));
            }
            if st.failed.len() > cfg.failed_backlog_warning {
                issues.push(format!(
                    "failed-job backlog of {} exceeds {}",
                    st.failed.len(),
                    cfg.failed_backlog_warning
                ));
            }
        }
        if issues.is_empty() {
            debug!("health check passed");
        } else {
            for issue in &issues {
                warn!(issue = %issue, "health check warning");
            }
            self.emit(SchedulerEvent::HealthWarning { issues: issues.clone() });
        }
        issues
    }

    /// Sample resident memory; above the threshold, release spare capacity
    /// held by the history and retry tables.
    pub async fn resource_check(&self) -> Option<u64> {
        let Some(rss_mb) = monitor::resident_memory_mb() else {
            debug!("resident memory not available on this platform");
            return None;
        };
        let threshold_mb = self.inner.cfg.memory_threshold_mb;
        if rss_mb > threshold_mb {
            warn!(rss_mb, threshold_mb, "memory above threshold, compacting tables");
            {
                let mut st = self.inner.state.lock().await;
                st.history.shrink_to_fit();
                st.failed.shrink_to_fit();
            }
            self.emit(SchedulerEvent::ResourceWarning { rss_mb, threshold_mb });
        } else {
            debug!(rss_mb, threshold_mb, "memory within threshold");
        }
        Some(rss_mb)
    }

    /// Prune history and retry entries by age and count.
    pub async fn cleanup(&self) -> CleanupReport {
        let cfg = &self.inner.cfg;
        let cutoff = Utc::now() - chrono::Duration::days(cfg.history_max_age_days);
        let report = {
            let mut st = self.inner.state.lock().await;
            let history_before = st.history.len();
            st.history.retain(|e| e.end_time.unwrap_or(e.start_time) >= cutoff);
            while st.history.len() > cfg.history_limit.max(1) {
                st.history.pop_front();
            }
            let failed_before = st.failed.len();
            st.failed.retain(|_, f| f.failed_at >= cutoff);
            let excess = st.failed.len().saturating_sub(cfg.failed_limit);
            if excess > 0 {
                let mut oldest: Vec<(DateTime<Utc>, Uuid)> =
                    st.failed.iter().map(|(id, f)| (f.failed_at, *id)).collect();
                oldest.sort();
                for (_, id) in oldest.into_iter().take(excess) {
                    st.failed.remove(&id);
                }
            }
            CleanupReport {
                history_removed: history_before - st.history.len(),
                failed_removed: failed_before - st.failed.len(),
            }
        };
        info!(history_removed = report.history_removed, failed_removed = report.failed_removed, "cleanup finished");
        self.emit(SchedulerEvent::CleanedUp {
            history_removed: report.history_removed,
            failed_removed: report.failed_removed,
        });
        report
    }

    /// Cancel every trigger, then mark in-flight executions terminated.
    /// In-flight handlers are signalled, not aborted. Returns how many
    /// executions were terminated.
    pub async fn stop(&self) -> usize {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return 0;
        }
        self.inner.shutdown.send_replace(true);
        for handle in self.inner.triggers.lock().await.drain(..) {
            handle.abort();
        }

        let mut events = Vec::new();
        {
            let mut st = self.inner.state.lock().await;
            let drained: Vec<Active> = st.active.drain().map(|(_, a)| a).collect();
            for active in drained {
                let _ = active.cancel.send(true);
                let mut exec = active.execution;
                exec.settle(ExecutionStatus::Terminated);
                st.stats.terminated_executions += 1;
                warn!(job = %exec.job_name, execution = %exec.id, "execution terminated by stop");
                events.push(SchedulerEvent::JobTerminated { execution_id: exec.id, job: exec.job_name.clone() });
                st.push_history(exec, self.inner.cfg.history_limit);
            }
        }
        let terminated = events.len();
        info!(terminated, "scheduler stopped");
        events.push(SchedulerEvent::Stopped { terminated });
        for e in events {
            self.emit(e);
        }
        terminated
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.state.lock().await.stats.clone()
    }

    /// Settled executions, oldest first.
    pub async fn history(&self) -> Vec<JobExecution> {
        self.inner.state.lock().await.history.iter().cloned().collect()
    }

    /// Retry table ordered by next retry time.
    pub async fn failed_jobs(&self) -> Vec<FailedJob> {
        let mut out: Vec<FailedJob> = self.inner.state.lock().await.failed.values().cloned().collect();
        out.sort_by_key(|f| f.next_retry);
        out
    }

    pub async fn active_jobs(&self) -> Vec<JobExecution> {
        let mut out: Vec<JobExecution> =
            self.inner.state.lock().await.active.values().map(|a| a.execution.clone()).collect();
        out.sort_by_key(|e| e.start_time);
        out
    }

    pub async fn jobs(&self) -> Vec<JobInfo> {
        let running: Vec<String> =
            self.inner.state.lock().await.active.values().map(|a| a.execution.job_name.clone()).collect();
        let now = Utc::now();
        self.inner
            .jobs
            .read()
            .await
            .values()
            .map(|j| JobInfo {
                name: j.name.clone(),
                cron: j.schedule.expr().to_string(),
                priority: j.priority,
                running: running.contains(&j.name),
                next_run: j.schedule.next_after(now),
            })
            .collect()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let jobs: Vec<String> = self.inner.jobs.read().await.keys().cloned().collect();
        let st = self.inner.state.lock().await;
        StatusSnapshot {
            running: self.is_running(),
            taken_at: Some(Utc::now()),
            jobs,
            active_jobs: st.active.len(),
            failed_backlog: st.failed.len(),
            history_len: st.history.len(),
            stats: st.stats.clone(),
            ..StatusSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    // Next fire is months away; tests drive executions with trigger_now.
    const NEVER: &str = "0 0 0 1 1 *";

    fn test_cfg() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: 2,
            max_job_duration_secs: 60,
            defer_delay_secs: 5,
            retry_delay_secs: 0,
            max_retries: 3,
            health_check_cron: String::new(),
            resource_monitor_cron: String::new(),
            cleanup_cron: String::new(),
            retry_sweep_cron: String::new(),
            ..SchedulerConfig::default()
        }
    }

    fn sleeper(secs: u64) -> Arc<dyn JobHandler> {
        handler_fn(move |_ctx| async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok::<Value, anyhow::Error>(Value::Null)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn admission_defers_instead_of_exceeding_limit() {
        let sched = DataCollectionScheduler::new(test_cfg());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            let (current, peak) = (current.clone(), peak.clone());
            let handler = handler_fn(move |_ctx| {
                let (current, peak) = (current.clone(), peak.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<Value, anyhow::Error>(Value::Null)
                }
            });
            sched.schedule(name, NEVER, JobPriority::Medium, handler).await.unwrap();
        }
        sched.start().await.unwrap();

        assert!(matches!(sched.trigger_now("a").await.unwrap(), Launch::Started(_)));
        assert!(matches!(sched.trigger_now("b").await.unwrap(), Launch::Started(_)));
        assert_eq!(sched.trigger_now("c").await.unwrap(), Launch::Deferred);
        assert_eq!(sched.active_jobs().await.len(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let stats = sched.stats().await;
        assert_eq!(stats.successful_executions, 3);
        assert!(stats.deferred_triggers >= 1);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_for_a_running_job_is_refused() {
        let sched = DataCollectionScheduler::new(test_cfg());
        sched.schedule("race-results", NEVER, JobPriority::High, sleeper(10)).await.unwrap();
        sched.start().await.unwrap();
        assert!(matches!(sched.trigger_now("race-results").await.unwrap(), Launch::Started(_)));
        assert_eq!(sched.trigger_now("race-results").await.unwrap(), Launch::AlreadyRunning);
        assert!(sched.trigger_now("nope").await.is_err());
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_execution_and_signals_cancel() {
        let cfg = SchedulerConfig { max_job_duration_secs: 1, max_retries: 0, ..test_cfg() };
        let sched = DataCollectionScheduler::new(cfg);
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();
        let handler = handler_fn(move |mut ctx| {
            let flag = flag.clone();
            async move {
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok::<Value, anyhow::Error>(Value::Null)
            }
        });
        sched.schedule("slow", NEVER, JobPriority::Low, handler).await.unwrap();
        sched.start().await.unwrap();
        sched.trigger_now("slow").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = sched.stats().await;
        assert_eq!(stats.timed_out_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.successful_executions, 0);
        assert_eq!(stats.abandoned_jobs, 1);
        assert!(sched.active_jobs().await.is_empty());
        assert!(saw_cancel.load(Ordering::SeqCst));

        let last = sched.history().await.pop().unwrap();
        assert_eq!(last.status, ExecutionStatus::Failed);
        assert!(last.error.unwrap().contains("timed out"));
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_job_completes_on_its_second_retry() {
        let sched = DataCollectionScheduler::new(test_cfg());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |ctx| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 {
                    anyhow::bail!("upstream returned 503 on call {n}");
                }
                Ok::<Value, anyhow::Error>(serde_json::json!({ "retries": ctx.retries }))
            }
        });
        sched.schedule("rider-profiles", NEVER, JobPriority::Medium, handler).await.unwrap();
        sched.start().await.unwrap();

        sched.trigger_now("rider-profiles").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sched.failed_jobs().await.len(), 1);

        assert_eq!(sched.retry_due_jobs().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sched.failed_jobs().await[0].retries, 1);

        assert_eq!(sched.retry_due_jobs().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let last = sched.history().await.pop().unwrap();
        assert_eq!(last.status, ExecutionStatus::Completed);
        assert_eq!(last.retries, 2);
        assert!(sched.failed_jobs().await.is_empty());
        let stats = sched.stats().await;
        assert_eq!(stats.retries_attempted, 2);
        assert_eq!(stats.failed_executions, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_only_fails_its_execution() {
        let sched = DataCollectionScheduler::new(SchedulerConfig { max_retries: 0, ..test_cfg() });
        let handler = handler_fn(|_ctx| async move {
            if true {
                panic!("boom");
            }
            Ok::<Value, anyhow::Error>(Value::Null)
        });
        sched.schedule("team-rosters", NEVER, JobPriority::Low, handler).await.unwrap();
        sched.start().await.unwrap();
        sched.trigger_now("team-rosters").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let last = sched.history().await.pop().unwrap();
        assert_eq!(last.status, ExecutionStatus::Failed);
        assert!(last.error.unwrap().contains("panicked"));
        assert!(sched.is_running());
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_marks_in_flight_executions_terminated() {
        let sched = DataCollectionScheduler::new(test_cfg());
        let handler = handler_fn(|mut ctx| async move {
            ctx.cancelled().await;
            Ok::<Value, anyhow::Error>(Value::Null)
        });
        sched.schedule("forever", NEVER, JobPriority::Low, handler).await.unwrap();
        let mut events = sched.event_channel();
        sched.start().await.unwrap();
        sched.trigger_now("forever").await.unwrap();

        assert_eq!(sched.stop().await, 1);
        assert!(!sched.is_running());
        assert!(sched.active_jobs().await.is_empty());
        assert_eq!(sched.history().await[0].status, ExecutionStatus::Terminated);
        assert_eq!(sched.stats().await.terminated_executions, 1);
        assert_eq!(sched.trigger_now("forever").await.unwrap(), Launch::Stopped);

        // The late handler result does not resurrect the execution.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sched.stats().await.successful_executions, 0);

        let mut seen = Vec::new();
        while let Ok(e) = events.try_recv() {
            seen.push(e);
        }
        assert!(matches!(seen.first(), Some(SchedulerEvent::Started { .. })));
        assert!(seen.iter().any(|e| matches!(e, SchedulerEvent::JobTerminated { .. })));
        assert_eq!(seen.last(), Some(&SchedulerEvent::Stopped { terminated: 1 }));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_registration() {
        let sched = DataCollectionScheduler::new(test_cfg());
        let err = sched.schedule("bad", "whenever", JobPriority::High, sleeper(1)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<pelo_core::Error>(), Some(pelo_core::Error::InvalidSchedule { .. })));
        assert!(sched.jobs().await.is_empty());

        sched.schedule("ok", "*/5 * * * *", JobPriority::High, sleeper(1)).await.unwrap();
        assert!(sched.schedule("ok", "*/5 * * * *", JobPriority::High, sleeper(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_flags_saturation() {
        let sched = DataCollectionScheduler::new(SchedulerConfig { max_concurrent_jobs: 1, ..test_cfg() });
        sched.schedule("a", NEVER, JobPriority::High, sleeper(30)).await.unwrap();
        sched.start().await.unwrap();
        assert!(sched.health_check().await.is_empty());

        sched.trigger_now("a").await.unwrap();
        let issues = sched.health_check().await;
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("concurrency saturated"));
        sched.stop().await;
    }

    #[tokio::test]
    async fn retry_delay_grows_and_caps() {
        let cfg = SchedulerConfig {
            retry_delay_secs: 300,
            retry_multiplier: 2.0,
            max_retry_delay_secs: 3600,
            ..SchedulerConfig::default()
        };
        let sched = DataCollectionScheduler::new(cfg);
        assert_eq!(sched.retry_delay(0), Duration::from_secs(300));
        assert_eq!(sched.retry_delay(1), Duration::from_secs(600));
        assert_eq!(sched.retry_delay(5), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_caps_the_failed_table() {
        let cfg = SchedulerConfig { failed_limit: 4, history_limit: 5, ..test_cfg() };
        let sched = DataCollectionScheduler::new(cfg);
        let handler = handler_fn(|_ctx| async { Err::<Value, _>(anyhow::anyhow!("site returned 500")) });
        sched.schedule("flaky", NEVER, JobPriority::Low, handler).await.unwrap();
        sched.start().await.unwrap();
        for _ in 0..10 {
            sched.trigger_now("flaky").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let before = sched.failed_jobs().await;
        assert_eq!(before.len(), 10);
        let newest = before.iter().map(|f| f.failed_at).max().unwrap();

        let report = sched.cleanup().await;
        assert_eq!(report.failed_removed, 6);
        let after = sched.failed_jobs().await;
        assert_eq!(after.len(), 4);
        assert!(after.iter().any(|f| f.failed_at == newest));
        sched.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_trims_history_to_limit() {
        let sched = DataCollectionScheduler::new(SchedulerConfig { history_limit: 2, ..test_cfg() });
        sched.schedule("quick", NEVER, JobPriority::High, sleeper(0)).await.unwrap();
        sched.start().await.unwrap();
        for _ in 0..3 {
            sched.trigger_now("quick").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sched.history().await.len(), 2);
        assert_eq!(sched.cleanup().await, CleanupReport::default());
        assert_eq!(sched.snapshot().await.stats.successful_executions, 3);
        sched.stop().await;
    }
}
