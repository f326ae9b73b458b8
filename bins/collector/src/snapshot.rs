use pelo_core::job::StatusSnapshot;
use pelo_core::store::{ns, DefaultKv, KvSerde};
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::module::{Module, ModuleCtx};

fn key() -> Vec<u8> {
    ns("status", "snapshot")
}

/// Persists the scheduler status so `collector status` can read it from
/// another process.
pub struct SnapshotWriter {
    period: Duration,
}

impl SnapshotWriter {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Module for SnapshotWriter {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snap = take(&ctx).await;
                        ctx.kv.put_t(&key(), &snap)?;
                        debug!(active = snap.active_jobs, backlog = snap.failed_backlog, "status snapshot written");
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            // Scheduler is stopped by now; the last snapshot says so.
                            let snap = take(&ctx).await;
                            ctx.kv.put_t(&key(), &snap)?;
                            info!(running = snap.running, "final status snapshot written");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

async fn take(ctx: &ModuleCtx) -> StatusSnapshot {
    let mut snap = ctx.scheduler.snapshot().await;
    snap.fetch = ctx.fetcher.stats().await;
    snap
}

pub fn read_snapshot(kv: &DefaultKv) -> anyhow::Result<Option<StatusSnapshot>> {
    kv.get_t(&key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use pelo_core::cfg::{FetchConfig, RecoveryConfig, SchedulerConfig};
    use pelo_core::error::FetchError;
    use pelo_core::fetch::{FetchOptions, RateLimitedFetcher, Transport, TransportResponse};
    use pelo_core::recovery::ErrorRecoveryManager;
    use pelo_core::store::open_default;
    use tokio::sync::watch;

    use crate::scheduler::DataCollectionScheduler;

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn get(&self, url: &str, _ua: &str, _t: Duration) -> Result<TransportResponse, FetchError> {
            Err(FetchError::Network { url: url.to_string(), message: "connection refused".into() })
        }
    }

    #[tokio::test]
    async fn snapshot_is_written_on_tick_and_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        let scheduler = DataCollectionScheduler::new(SchedulerConfig {
            health_check_cron: String::new(),
            resource_monitor_cron: String::new(),
            cleanup_cron: String::new(),
            retry_sweep_cron: String::new(),
            ..SchedulerConfig::default()
        });
        scheduler.start().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let ctx = ModuleCtx {
            kv: kv.clone(),
            scheduler: scheduler.clone(),
            recovery: Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), kv.clone())),
            fetcher: Arc::new(RateLimitedFetcher::new(
                FetchConfig { min_request_delay_ms: 0, ..FetchConfig::default() },
                Arc::new(Unreachable),
            )),
            shutdown: rx,
        };
        let fetcher = ctx.fetcher.clone();
        let handle = Box::new(SnapshotWriter::new(Duration::from_millis(20))).spawn(ctx);
        let opts = FetchOptions { max_retries: Some(0), check_robots: Some(false), ..FetchOptions::default() };
        assert!(fetcher.fetch("https://cycling.test/race/tdf", &opts).await.is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(read_snapshot(&kv).unwrap().unwrap().running);

        scheduler.stop().await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        let last = read_snapshot(&kv).unwrap().unwrap();
        assert!(!last.running);
        assert!(last.taken_at.is_some());
        assert_eq!(last.fetch.total_requests, 1);
        assert_eq!(last.fetch.failed, 1);
        assert_eq!(last.fetch.by_error["network-error"], 1);
    }
}
