//! Rate-limited, robots-aware HTTP fetching.
//!
//! Every request takes a token from both the per-minute and per-hour budgets,
//! waits out the minimum inter-request gap, and is retried with exponential
//! backoff when the failure is transient. HTTP 429 adds a cooldown instead.

mod agents;
mod limiter;
mod robots;

pub use agents::UserAgentPool;
pub use limiter::{DualRateLimiter, Pacer, TokenBucket};
pub use robots::{RobotsCache, RobotsRules};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cfg::FetchConfig;
use crate::error::FetchError;

/// What a [`Transport`] returns for one HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
    /// Parsed `Retry-After` header, if present.
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    /// 200 response with `body`.
    pub fn ok(body: impl Into<String>) -> Self {
        Self { status: 200, body: body.into(), retry_after: None }
    }

    /// Response with an arbitrary status and empty body.
    pub fn status(status: u16) -> Self {
        Self { status, body: String::new(), retry_after: None }
    }
}

/// A single HTTP GET. Separated out so the fetcher can be driven by a
/// scripted transport in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a GET of `url` with the given agent and timeout.
    async fn get(&self, url: &str, user_agent: &str, timeout: Duration)
        -> Result<TransportResponse, FetchError>;
}

/// [`Transport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with rustls and redirects enabled.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, user_agent: &str, timeout: Duration)
        -> Result<TransportResponse, FetchError>
    {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string(), timeout }
            } else {
                FetchError::Network { url: url.to_string(), message: e.to_string() }
            }
        };
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.map_err(map_err)?;
        Ok(TransportResponse { status, body, retry_after })
    }
}

/// Per-call overrides for [`RateLimitedFetcher::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Use this agent instead of the pool.
    pub user_agent: Option<String>,
    /// Override the configured timeout.
    pub timeout: Option<Duration>,
    /// Override the configured retry count.
    pub max_retries: Option<u32>,
    /// Override the robots.txt setting.
    pub check_robots: Option<bool>,
}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Requested URL.
    pub url: String,
    /// HTTP status code (2xx).
    pub status: u16,
    /// Body text.
    pub body: String,
    /// Time from first attempt to success, including waits.
    pub elapsed: Duration,
    /// Attempts used (1 when the first one succeeded).
    pub attempts: u32,
    /// Agent used for the successful attempt.
    pub user_agent: String,
}

/// Running counters for observability. The same events are also emitted
/// through the `metrics` facade as `fetch_*` counters and histograms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchStats {
    /// HTTP attempts sent (retries included).
    pub total_requests: u64,
    /// `fetch` calls that returned a response.
    pub successful: u64,
    /// `fetch` calls that returned an error.
    pub failed: u64,
    /// Retries performed.
    pub retries: u64,
    /// Failures per error kind (final and intermediate).
    pub by_error: BTreeMap<String, u64>,
}

/// Fetcher enforcing rate limits, robots.txt, agent rotation and retries.
pub struct RateLimitedFetcher {
    cfg: FetchConfig,
    transport: Arc<dyn Transport>,
    limiter: DualRateLimiter,
    pacer: Pacer,
    robots: RobotsCache,
    agents: UserAgentPool,
    stats: Mutex<FetchStats>,
}

impl RateLimitedFetcher {
    /// Fetcher over an arbitrary transport.
    pub fn new(cfg: FetchConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            limiter: DualRateLimiter::new(cfg.requests_per_minute, cfg.requests_per_hour),
            pacer: Pacer::new(Duration::from_millis(cfg.min_request_delay_ms)),
            robots: RobotsCache::new(),
            agents: UserAgentPool::new(cfg.user_agent.clone(), cfg.rotate_user_agents, cfg.rotate_every),
            stats: Mutex::new(FetchStats::default()),
            transport,
            cfg,
        }
    }

    /// Fetcher over a `reqwest` client.
    pub fn with_reqwest(cfg: FetchConfig) -> anyhow::Result<Self> {
        Ok(Self::new(cfg, Arc::new(ReqwestTransport::new()?)))
    }

    /// Configuration in use.
    pub fn config(&self) -> &FetchConfig {
        &self.cfg
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> FetchStats {
        self.stats.lock().await.clone()
    }

    /// GET `url` under all politeness rules.
    pub async fn fetch(&self, url: &str, opts: &FetchOptions) -> Result<RawResponse, FetchError> {
        let started = Instant::now();
        let agent = opts.user_agent.clone().unwrap_or_else(|| self.agents.next_agent());
        let timeout = opts.timeout.unwrap_or_else(|| self.cfg.timeout());
        let max_retries = opts.max_retries.unwrap_or(self.cfg.max_retries);

        if opts.check_robots.unwrap_or(self.cfg.respect_robots) && !self.robots_allow(url, &agent, timeout).await {
            warn!(url, agent = %agent, "blocked by robots.txt");
            let err = FetchError::RobotsBlocked { url: url.to_string() };
            self.record_failure(&err, true).await;
            return Err(err);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let waited = self.limiter.acquire().await;
            self.pacer.pace().await;
            self.stats.lock().await.total_requests += 1;
            counter!("fetch_requests_total").increment(1);
            debug!(url, attempt, agent = %agent, waited_ms = waited.as_millis() as u64, "request");

            let outcome = match self.transport.get(url, &agent, timeout).await {
                Ok(resp) => classify_response(url, resp),
                Err(e) => Err((e, None)),
            };

            match outcome {
                Ok(body) => {
                    let elapsed = started.elapsed();
                    info!(url, status = 200u16, attempt, elapsed_ms = elapsed.as_millis() as u64, "response");
                    self.stats.lock().await.successful += 1;
                    counter!("fetch_success_total").increment(1);
                    histogram!("fetch_duration_ms").record(elapsed.as_millis() as f64);
                    histogram!("fetch_attempts").record(attempt as f64);
                    return Ok(RawResponse {
                        url: url.to_string(),
                        status: 200,
                        body,
                        elapsed,
                        attempts: attempt,
                        user_agent: agent,
                    });
                }
                Err((err, retry_after)) => {
                    let retries_left = attempt <= max_retries;
                    let pause = match &err {
                        FetchError::RateLimited { .. } => Some(
                            retry_after.unwrap_or(Duration::from_millis(self.cfg.rate_limit_cooldown_ms)),
                        ),
                        e if e.is_transient() => Some(self.backoff(attempt)),
                        _ => None,
                    };
                    match pause {
                        Some(pause) if retries_left => {
                            warn!(url, attempt, error = %err, pause_ms = pause.as_millis() as u64, "retrying");
                            self.record_failure(&err, false).await;
                            self.stats.lock().await.retries += 1;
                            counter!("fetch_retries_total").increment(1);
                            sleep(pause).await;
                        }
                        _ => {
                            warn!(url, attempt, error = %err, kind = %err.kind(), "fetch failed");
                            self.record_failure(&err, true).await;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// `base * 2^(attempt-1)` capped, plus up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .cfg
            .retry_base_delay_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.cfg.max_backoff_ms);
        let jitter = if capped >= 4 { rand::rng().random_range(0..=capped / 4) } else { 0 };
        Duration::from_millis(capped + jitter)
    }

    async fn record_failure(&self, err: &FetchError, final_failure: bool) {
        let kind = err.kind().as_str();
        counter!("fetch_errors_total", "kind" => kind).increment(1);
        let mut stats = self.stats.lock().await;
        *stats.by_error.entry(kind.to_string()).or_default() += 1;
        if final_failure {
            stats.failed += 1;
            counter!("fetch_failures_total").increment(1);
        }
    }

    /// robots.txt check, fail-open on any fetch problem.
    async fn robots_allow(&self, url: &str, agent: &str, timeout: Duration) -> bool {
        let Ok(parsed) = url::Url::parse(url) else { return true };
        let Some(host) = parsed.host_str() else { return true };
        let origin = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };

        let rules = match self.robots.get(&origin).await {
            Some(r) => r,
            None => {
                let robots_url = format!("{origin}/robots.txt");
                let rules = match self.transport.get(&robots_url, agent, timeout).await {
                    Ok(resp) if (200..300).contains(&resp.status) => RobotsRules::parse(&resp.body),
                    Ok(resp) => {
                        debug!(robots_url, status = resp.status, "no robots.txt, allowing");
                        RobotsRules::allow_all()
                    }
                    Err(e) => {
                        debug!(robots_url, error = %e, "robots.txt unreachable, allowing");
                        RobotsRules::allow_all()
                    }
                };
                self.robots.insert(&origin, rules.clone()).await;
                rules
            }
        };

        let mut path = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            path.push('?');
            path.push_str(q);
        }
        rules.is_allowed(agent, &path)
    }
}

/// Map a transport response onto success or a typed failure.
fn classify_response(url: &str, resp: TransportResponse)
    -> Result<String, (FetchError, Option<Duration>)>
{
    let url_s = url.to_string();
    match resp.status {
        200..=299 => match suspicious_body(&resp.body) {
            Some(reason) => Err((FetchError::Validation { url: url_s, reason }, None)),
            None => Ok(resp.body),
        },
        429 => Err((FetchError::RateLimited { url: url_s }, resp.retry_after)),
        500..=599 => Err((FetchError::Server { status: resp.status, url: url_s }, None)),
        status => Err((FetchError::Client { status, url: url_s }, None)),
    }
}

/// Reason a 2xx body still looks like an error page, captcha or block page.
fn suspicious_body(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return Some("empty body".to_string());
    }
    let lc = body.to_ascii_lowercase();
    const MARKERS: &[(&str, &str)] = &[
        ("g-recaptcha", "captcha challenge"),
        ("h-captcha", "captcha challenge"),
        ("cf-chl-", "cloudflare challenge"),
        ("access denied", "access denied page"),
        ("are you a robot", "bot check page"),
        ("too many requests", "rate limit page"),
    ];
    MARKERS
        .iter()
        .find(|(needle, _)| lc.contains(needle))
        .map(|(_, reason)| reason.to_string())
}
