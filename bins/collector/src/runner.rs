use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use pelo_core::clean::{self, CleanedRecord};
use pelo_core::extract::{self, SchemaHint};
use pelo_core::fetch::{FetchOptions, RateLimitedFetcher};
use pelo_core::recovery::{ErrorRecoveryManager, RecoveryContext, RecoveryStrategy};

use crate::backend::{Sink, StoreReport};
use crate::scheduler::{JobContext, JobHandler};

/// Per-scrape knobs.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub fetch: FetchOptions,
    /// Fetch, extract and clean, but never hand the record to the sink.
    pub dry_run: bool,
    /// Correlates recovery records, e.g. with a scheduler execution.
    pub session: Option<String>,
}

/// Result of one scrape, recovered or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeOutcome {
    pub kind: SchemaHint,
    pub target: String,
    pub url: String,
    pub recovered_by: Option<RecoveryStrategy>,
    /// `None` when the data is not a cleaned record (skip or empty default).
    pub quality_score: Option<f64>,
    pub is_valid: bool,
    pub stored: Option<StoreReport>,
    pub data: Value,
}

struct StageFailure {
    error: anyhow::Error,
    /// Body of a page that fetched fine but did not extract.
    html: Option<String>,
}

async fn fetch_and_clean(
    fetcher: &RateLimitedFetcher,
    url: &str,
    kind: SchemaHint,
    opts: &FetchOptions,
) -> Result<CleanedRecord, StageFailure> {
    let resp = fetcher
        .fetch(url, opts)
        .await
        .map_err(|e| StageFailure { error: pelo_core::Error::from(e).into(), html: None })?;
    let raw = extract::parse(&resp.body, kind).map_err(|e| StageFailure {
        error: anyhow::Error::new(pelo_core::Error::from(e)).context(format!("extract {kind} from {url}")),
        html: Some(resp.body.clone()),
    })?;
    Ok(clean::clean(&raw))
}

fn operation(kind: SchemaHint) -> String {
    format!("scrape-{}", kind.as_str())
}

/// Fetch, extract, clean, recover and store, for one target at a time.
pub struct Pipeline {
    fetcher: Arc<RateLimitedFetcher>,
    recovery: Arc<ErrorRecoveryManager>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, recovery: Arc<ErrorRecoveryManager>, sink: Arc<dyn Sink>) -> Self {
        Self { fetcher, recovery, sink }
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryManager> {
        &self.recovery
    }

    /// Absolute http(s) URLs are used as given; anything else is a slug
    /// under the site's `race/`, `rider/` or `team/` path.
    pub fn resolve(&self, kind: SchemaHint, target: &str) -> Result<String> {
        let target = target.trim();
        if target.is_empty() {
            bail!("empty {kind} target");
        }
        if target.starts_with("http://") || target.starts_with("https://") {
            return Ok(Url::parse(target).with_context(|| format!("invalid url {target}"))?.to_string());
        }
        let base = &self.fetcher.config().base_url;
        let base = if base.ends_with('/') { base.clone() } else { format!("{base}/") };
        let prefix = match kind {
            SchemaHint::RaceResult => "race",
            SchemaHint::RiderProfile => "rider",
            SchemaHint::TeamRoster => "team",
        };
        let url = Url::parse(&base)
            .with_context(|| format!("invalid base url {base}"))?
            .join(&format!("{prefix}/{}", target.trim_start_matches('/')))?;
        Ok(url.to_string())
    }

    pub async fn scrape(&self, kind: SchemaHint, target: &str, opts: &ScrapeOptions) -> Result<ScrapeOutcome> {
        let op = operation(kind);
        let url = self.resolve(kind, target)?;
        let admission = self.recovery.circuit_gate(&op).await?;

        let failure = match fetch_and_clean(&self.fetcher, &url, kind, &opts.fetch).await {
            Ok(record) => {
                let data = serde_json::to_value(&record)?;
                self.recovery.record_success(&op, target, Some(data.clone())).await;
                return self.finish(kind, target, url, None, data, opts).await;
            }
            Err(f) => f,
        };

        let mut ctx = RecoveryContext::new(op.as_str(), target).data_type(kind.as_str()).probe(admission);
        if let Some(session) = &opts.session {
            ctx = ctx.session(session.as_str());
        }
        if let Some(html) = failure.html {
            ctx = ctx.raw_html(html, kind);
        }
        let (fetcher, retry_url, fetch_opts) = (self.fetcher.clone(), url.clone(), opts.fetch.clone());
        ctx = ctx.retry(move || -> BoxFuture<'static, Result<Value>> {
            let (fetcher, url, opts) = (fetcher.clone(), retry_url.clone(), fetch_opts.clone());
            Box::pin(async move {
                let record = fetch_and_clean(&fetcher, &url, kind, &opts).await.map_err(|f| f.error)?;
                Ok(serde_json::to_value(record)?)
            })
        });

        let outcome = self
            .recovery
            .recover_from_error(&failure.error, ctx)
            .await
            .map_err(|e| anyhow!(e).context(format!("{kind} {target}: {:#}", failure.error)))?;
        info!(kind = %kind, target, strategy = %outcome.strategy, attempt = outcome.attempt, "scrape recovered");
        let data = outcome.data.unwrap_or(Value::Null);
        self.finish(kind, target, url, Some(outcome.strategy), data, opts).await
    }

    async fn finish(
        &self,
        kind: SchemaHint,
        target: &str,
        url: String,
        recovered_by: Option<RecoveryStrategy>,
        data: Value,
        opts: &ScrapeOptions,
    ) -> Result<ScrapeOutcome> {
        let mut out = ScrapeOutcome {
            kind,
            target: target.to_string(),
            url,
            recovered_by,
            quality_score: None,
            is_valid: false,
            stored: None,
            data,
        };
        let Ok(record) = serde_json::from_value::<CleanedRecord>(out.data.clone()) else {
            warn!(kind = %kind, target, "no cleaned record to store");
            return Ok(out);
        };
        out.quality_score = Some(record.quality_score());
        out.is_valid = record.validation().is_valid;
        if !out.is_valid {
            warn!(kind = %kind, target, errors = ?record.validation().errors, "record failed validation");
        }
        if !opts.dry_run {
            out.stored = Some(self.sink.store(&record).await?);
        }
        Ok(out)
    }
}

/// Scheduler job scraping a fixed list of targets of one kind.
pub struct ScrapeJob {
    pipeline: Arc<Pipeline>,
    kind: SchemaHint,
    targets: Vec<String>,
    options: ScrapeOptions,
}

impl ScrapeJob {
    pub fn new(pipeline: Arc<Pipeline>, kind: SchemaHint, targets: Vec<String>, options: ScrapeOptions) -> Self {
        Self { pipeline, kind, targets, options }
    }
}

#[async_trait]
impl JobHandler for ScrapeJob {
    /// Fails only when every target failed.
    async fn run(&self, ctx: JobContext) -> Result<Value> {
        let opts = ScrapeOptions { session: Some(ctx.execution_id.to_string()), ..self.options.clone() };
        let mut scraped = Vec::new();
        let mut failed = 0usize;
        for target in &self.targets {
            if ctx.is_cancelled() {
                warn!(job = %ctx.job_name, "cancelled, leaving remaining targets");
                break;
            }
            match self.pipeline.scrape(self.kind, target, &opts).await {
                Ok(outcome) => scraped.push(outcome),
                Err(e) => {
                    warn!(job = %ctx.job_name, target, error = %format!("{e:#}"), "target failed");
                    failed += 1;
                }
            }
        }
        if scraped.is_empty() && failed > 0 {
            bail!("all {failed} {} targets failed", self.kind);
        }
        Ok(json!({ "scraped": scraped.len(), "failed": failed, "outcomes": scraped }))
    }
}
