use std::sync::atomic::{AtomicU64, Ordering};

const BROWSER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

/// Hands out a user agent per request, moving to the next one every
/// `rotate_every` requests. A fixed agent disables rotation.
pub struct UserAgentPool {
    agents: Vec<String>,
    fixed: Option<String>,
    rotate: bool,
    rotate_every: u64,
    issued: AtomicU64,
}

impl UserAgentPool {
    /// Pool over the built-in browser agents.
    pub fn new(fixed: Option<String>, rotate: bool, rotate_every: u32) -> Self {
        Self::with_agents(
            BROWSER_AGENTS.iter().map(|s| s.to_string()).collect(),
            fixed,
            rotate,
            rotate_every,
        )
    }

    /// Pool over caller-supplied agents.
    pub fn with_agents(agents: Vec<String>, fixed: Option<String>, rotate: bool, rotate_every: u32) -> Self {
        Self {
            agents,
            fixed,
            rotate,
            rotate_every: u64::from(rotate_every.max(1)),
            issued: AtomicU64::new(0),
        }
    }

    /// Agent for the next request.
    pub fn next_agent(&self) -> String {
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }
        if self.agents.is_empty() {
            return concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string();
        }
        let n = self.issued.fetch_add(1, Ordering::Relaxed);
        if !self.rotate {
            return self.agents[0].clone();
        }
        let idx = (n / self.rotate_every) as usize % self.agents.len();
        self.agents[idx].clone()
    }
}
