use std::sync::Arc;

use pelo_core::fetch::RateLimitedFetcher;
use pelo_core::recovery::ErrorRecoveryManager;
use pelo_core::store::DefaultKv;
use tokio::task::JoinHandle;

use crate::scheduler::DataCollectionScheduler;

#[derive(Clone)]
pub struct ModuleCtx {
    pub kv: DefaultKv,
    pub scheduler: DataCollectionScheduler,
    pub recovery: Arc<ErrorRecoveryManager>,
    pub fetcher: Arc<RateLimitedFetcher>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Background task living as long as the `start` command.
pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
