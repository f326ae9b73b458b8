use pelo_core::recovery::{HealthStatus, IntegrityReport};
use pelo_core::store::{ns, DefaultKv, KvSerde};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::module::{Module, ModuleCtx};

fn key() -> Vec<u8> {
    ns("status", "integrity")
}

/// Periodic integrity check over the recovery state and backups. Expired
/// backups are pruned on the same tick.
pub struct IntegrityMonitor {
    period: Duration,
}

impl IntegrityMonitor {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Module for IntegrityMonitor {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let mut tick = interval(self.period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = ctx.recovery.prune_backups() {
                            warn!(error = %e, "backup pruning failed");
                        }
                        match ctx.recovery.run_integrity_check().await {
                            Ok(report) => {
                                log_report(&report);
                                ctx.kv.put_json(&key(), &report)?;
                            }
                            Err(e) => error!(error = %e, "integrity check failed to run"),
                        }
                    }
                    changed = ctx.shutdown.changed() => {
                        if changed.is_err() || *ctx.shutdown.borrow() {
                            info!("integrity monitor stopping");
                            break;
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

fn log_report(report: &IntegrityReport) {
    match report.overall_status {
        HealthStatus::Healthy => info!(issues = report.issues_found, "integrity check passed"),
        status => warn!(issues = report.issues_found, status = ?status, "integrity check found issues"),
    }
}

pub fn read_report(kv: &DefaultKv) -> anyhow::Result<Option<IntegrityReport>> {
    kv.get_json(&key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pelo_core::cfg::{FetchConfig, RecoveryConfig, SchedulerConfig};
    use pelo_core::fetch::RateLimitedFetcher;
    use pelo_core::recovery::ErrorRecoveryManager;
    use pelo_core::store::open_default;
    use serde_json::json;
    use tokio::sync::watch;

    use crate::scheduler::DataCollectionScheduler;

    #[tokio::test]
    async fn first_tick_stores_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), kv.clone()));
        recovery.create_backup("team-roster", json!({ "teamName": "Lidl-Trek", "riders": [] })).unwrap();

        let (tx, rx) = watch::channel(false);
        let ctx = ModuleCtx {
            kv: kv.clone(),
            scheduler: DataCollectionScheduler::new(SchedulerConfig::default()),
            recovery,
            fetcher: Arc::new(RateLimitedFetcher::with_reqwest(FetchConfig::default()).unwrap()),
            shutdown: rx,
        };
        let handle = Box::new(IntegrityMonitor::new(Duration::from_secs(3600))).spawn(ctx);

        let mut report = None;
        for _ in 0..50 {
            report = read_report(&kv).unwrap();
            if report.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let report = report.expect("no integrity report written");
        assert!(report.checks.contains_key("backups"));
        assert_eq!(report.overall_status, HealthStatus::Healthy);
    }
}
