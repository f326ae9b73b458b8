use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias using the crate [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the HTTP fetching layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS or transport-level failure.
    #[error("network error fetching {url}: {message}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying transport message.
        message: String,
    },
    /// The request did not complete within the configured timeout.
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout {
        /// Requested URL.
        url: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The server answered HTTP 429 and retries were exhausted.
    #[error("rate limited by {url} (HTTP 429)")]
    RateLimited {
        /// Requested URL.
        url: String,
    },
    /// HTTP 5xx after retries were exhausted.
    #[error("server error {status} for {url}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },
    /// HTTP 4xx other than 429; never retried.
    #[error("client error {status} for {url}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },
    /// robots.txt disallows the URL for the active user agent.
    #[error("blocked by robots.txt: {url}")]
    RobotsBlocked {
        /// Requested URL.
        url: String,
    },
    /// The body looks like an error page, captcha or is empty.
    #[error("response from {url} failed content validation: {reason}")]
    Validation {
        /// Requested URL.
        url: String,
        /// What the body looked like.
        reason: String,
    },
}

/// Failures raised by the HTML extractor on structurally unusable input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Input was empty or whitespace only.
    #[error("empty document")]
    Empty,
    /// Input contains no markup at all.
    #[error("input is not HTML")]
    NotHtml,
    /// An element was opened but never closed.
    #[error("unbalanced <{tag}> element")]
    Unbalanced {
        /// Tag name that was left open.
        tag: String,
    },
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Fetch-level failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Extraction failure.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// A cron expression could not be parsed.
    #[error("invalid schedule {expr:?}: {message}")]
    InvalidSchedule {
        /// Offending expression.
        expr: String,
        /// Parser message.
        message: String,
    },
    /// The circuit for an operation is open; calls fail fast.
    #[error("circuit open for {operation}, retry in {retry_in:?}")]
    CircuitOpen {
        /// Operation name.
        operation: String,
        /// Time left until a half-open probe is allowed.
        retry_in: Duration,
    },
    /// Stored data failed an integrity check.
    #[error("data corruption: {0}")]
    DataCorruption(String),
    /// Recovery ran out of strategies or the chosen one failed.
    #[error("recovery failed for {operation}:{target} via {strategy}: {message}")]
    Unrecovered {
        /// Operation name.
        operation: String,
        /// Target identifier.
        target: String,
        /// Strategy that was attempted last.
        strategy: String,
        /// Strategy message.
        message: String,
    },
    /// Backend storage API failure.
    #[error("backend error: {0}")]
    Backend(String),
    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Error taxonomy used for counters, classification and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Transport failure.
    NetworkError,
    /// Request timed out.
    TimeoutError,
    /// HTML could not be parsed.
    ParsingError,
    /// Content or record validation failed.
    ValidationError,
    /// Remote rate limit hit.
    RateLimitError,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 4xx other than 429.
    ClientError,
    /// robots.txt disallow.
    RobotsBlocked,
    /// Stored data failed integrity checks.
    DataCorruption,
    /// Circuit breaker is open.
    CircuitOpen,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Stable kebab-case name used in logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network-error",
            ErrorKind::TimeoutError => "timeout-error",
            ErrorKind::ParsingError => "parsing-error",
            ErrorKind::ValidationError => "validation-error",
            ErrorKind::RateLimitError => "rate-limit-error",
            ErrorKind::ServerError => "server-error",
            ErrorKind::ClientError => "client-error",
            ErrorKind::RobotsBlocked => "robots-blocked",
            ErrorKind::DataCorruption => "data-corruption",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FetchError {
    /// Taxonomy bucket for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network { .. } => ErrorKind::NetworkError,
            FetchError::Timeout { .. } => ErrorKind::TimeoutError,
            FetchError::RateLimited { .. } => ErrorKind::RateLimitError,
            FetchError::Server { .. } => ErrorKind::ServerError,
            FetchError::Client { .. } => ErrorKind::ClientError,
            FetchError::RobotsBlocked { .. } => ErrorKind::RobotsBlocked,
            FetchError::Validation { .. } => ErrorKind::ValidationError,
        }
    }

    /// Whether the fetcher may retry this failure with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::Timeout { .. } | FetchError::Server { .. }
        )
    }
}

impl Error {
    /// Taxonomy bucket for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fetch(e) => e.kind(),
            Error::Parse(_) => ErrorKind::ParsingError,
            Error::InvalidSchedule { .. } => ErrorKind::ValidationError,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::DataCorruption(_) => ErrorKind::DataCorruption,
            Error::Json(_) => ErrorKind::ParsingError,
            Error::Unrecovered { .. }
            | Error::Backend(_)
            | Error::Storage(_)
            | Error::Io(_) => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_map_to_taxonomy() {
        let e = Error::from(FetchError::Server { status: 503, url: "https://x/".into() });
        assert_eq!(e.kind(), ErrorKind::ServerError);
        assert_eq!(e.kind().to_string(), "server-error");

        let robots = FetchError::RobotsBlocked { url: "https://x/private".into() };
        assert_eq!(robots.kind(), ErrorKind::RobotsBlocked);
        assert!(!robots.is_transient());
    }

    #[test]
    fn only_network_timeout_and_5xx_are_transient() {
        assert!(FetchError::Network { url: "u".into(), message: "reset".into() }.is_transient());
        assert!(FetchError::Timeout { url: "u".into(), timeout: Duration::from_secs(1) }.is_transient());
        assert!(FetchError::Server { status: 500, url: "u".into() }.is_transient());
        assert!(!FetchError::Client { status: 404, url: "u".into() }.is_transient());
        assert!(!FetchError::RateLimited { url: "u".into() }.is_transient());
    }

    #[test]
    fn parse_error_is_parsing_kind() {
        let e = Error::from(ParseError::Unbalanced { tag: "table".into() });
        assert_eq!(e.kind(), ErrorKind::ParsingError);
        assert!(e.to_string().contains("<table>"));
    }
}
