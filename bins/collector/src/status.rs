#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pelo_core::fetch::RateLimitedFetcher;
use pelo_core::recovery::ErrorRecoveryManager;
use pelo_core::store::DefaultKv;

use crate::integrity::read_report;
use crate::module::{Module, ModuleCtx};
use crate::scheduler::DataCollectionScheduler;

#[derive(Clone)]
struct AppState {
    kv: DefaultKv,
    scheduler: DataCollectionScheduler,
    recovery: Arc<ErrorRecoveryManager>,
    fetcher: Arc<RateLimitedFetcher>,
    metrics: Option<PrometheusHandle>,
    started: Instant,
}

/// Read-only HTTP view of the live scheduler and recovery state.
pub struct StatusServer {
    addr: SocketAddr,
}

impl StatusServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Module for StatusServer {
    fn name(&self) -> &'static str {
        "status"
    }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let metrics = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "metrics recorder not installed; /metrics disabled");
                    None
                }
            };
            let state = AppState {
                kv: ctx.kv.clone(),
                scheduler: ctx.scheduler.clone(),
                recovery: ctx.recovery.clone(),
                fetcher: ctx.fetcher.clone(),
                metrics,
                started: Instant::now(),
            };

            let app = Router::new()
                .route("/status", get(status))
                .route("/jobs", get(jobs))
                .route("/jobs/failed", get(failed))
                .route("/recovery", get(recovery))
                .route("/metrics", get(metrics_text))
                .with_state(state);

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("status server listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await?;

            Ok(())
        })
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let mut snapshot = state.scheduler.snapshot().await;
    snapshot.fetch = state.fetcher.stats().await;
    let uptime_ms = state.started.elapsed().as_millis() as u64;
    Json(json!({ "uptimeMs": uptime_ms, "scheduler": snapshot }))
}

async fn jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "jobs": state.scheduler.jobs().await,
        "active": state.scheduler.active_jobs().await,
    }))
}

async fn failed(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.failed_jobs().await)
}

async fn recovery(State(state): State<AppState>) -> impl IntoResponse {
    let integrity = read_report(&state.kv).ok().flatten();
    Json(json!({
        "errors": state.recovery.error_statistics().await,
        "alerts": state.recovery.alerts().await,
        "manualReview": state.recovery.manual_review_queue().await,
        "integrity": integrity,
    }))
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
