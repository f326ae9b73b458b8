use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, FetchError, ParseError};

/// Failure category driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Transport failure or timeout.
    #[serde(rename = "network-error")]
    Network,
    /// Markup or JSON could not be parsed.
    #[serde(rename = "parsing-error")]
    Parsing,
    /// Content or request rejected as invalid.
    #[serde(rename = "validation-error")]
    Validation,
    /// Remote rate limit.
    #[serde(rename = "rate-limit")]
    RateLimit,
    /// HTTP 5xx.
    #[serde(rename = "server-error")]
    Server,
    /// Stored data failed integrity checks.
    #[serde(rename = "data-corruption")]
    DataCorruption,
    /// Anything else.
    #[serde(rename = "unknown-error")]
    Unknown,
}

impl ErrorCategory {
    /// Stable name used in logs and statistics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network-error",
            ErrorCategory::Parsing => "parsing-error",
            ErrorCategory::Validation => "validation-error",
            ErrorCategory::RateLimit => "rate-limit",
            ErrorCategory::Server => "server-error",
            ErrorCategory::DataCorruption => "data-corruption",
            ErrorCategory::Unknown => "unknown-error",
        }
    }

    /// Bucket for a taxonomy kind.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NetworkError | ErrorKind::TimeoutError => ErrorCategory::Network,
            ErrorKind::ParsingError => ErrorCategory::Parsing,
            ErrorKind::ValidationError | ErrorKind::ClientError | ErrorKind::RobotsBlocked => {
                ErrorCategory::Validation
            }
            ErrorKind::RateLimitError => ErrorCategory::RateLimit,
            ErrorKind::ServerError => ErrorCategory::Server,
            ErrorKind::DataCorruption => ErrorCategory::DataCorruption,
            ErrorKind::CircuitOpen | ErrorKind::Unknown => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently a failure needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected noise.
    Low,
    /// Worth watching.
    Medium,
    /// Needs attention soon.
    High,
    /// Data at risk.
    Critical,
}

impl Severity {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a failure in `category`.
pub fn severity(category: ErrorCategory) -> Severity {
    match category {
        ErrorCategory::DataCorruption => Severity::Critical,
        ErrorCategory::Validation | ErrorCategory::RateLimit => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Classify a failure. Typed errors anywhere in the chain win; otherwise
/// the rendered message is matched against known phrases.
pub fn classify(err: &anyhow::Error) -> ErrorCategory {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return ErrorCategory::from_kind(e.kind());
        }
        if let Some(e) = cause.downcast_ref::<FetchError>() {
            return ErrorCategory::from_kind(e.kind());
        }
        if cause.downcast_ref::<ParseError>().is_some() || cause.downcast_ref::<serde_json::Error>().is_some() {
            return ErrorCategory::Parsing;
        }
    }
    classify_message(&format!("{err:#}"))
}

/// Message heuristics for untyped failures.
pub fn classify_message(message: &str) -> ErrorCategory {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));
    if has(&["corrupt", "checksum", "integrity"]) {
        ErrorCategory::DataCorruption
    } else if has(&["429", "rate limit", "too many requests"]) {
        ErrorCategory::RateLimit
    } else if has(&["500", "502", "503", "504", "server error", "bad gateway", "service unavailable"]) {
        ErrorCategory::Server
    } else if has(&["timeout", "timed out", "econnreset", "econnrefused", "connection", "network", "dns"]) {
        ErrorCategory::Network
    } else if has(&["parse", "selector", "unexpected token", "malformed"]) {
        ErrorCategory::Parsing
    } else if has(&["validation", "invalid", "required"]) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::time::Duration;

    #[test]
    fn typed_errors_classify_through_context() {
        let e: anyhow::Result<()> =
            Err(FetchError::Timeout { url: "u".into(), timeout: Duration::from_secs(1) }.into());
        let e = e.context("fetching race").unwrap_err();
        assert_eq!(classify(&e), ErrorCategory::Network);

        let e = anyhow::Error::new(Error::from(FetchError::Client { status: 404, url: "u".into() }));
        assert_eq!(classify(&e), ErrorCategory::Validation);

        let e = anyhow::Error::new(ParseError::NotHtml);
        assert_eq!(classify(&e), ErrorCategory::Parsing);
    }

    #[test]
    fn messages_fall_back_to_heuristics() {
        assert_eq!(classify(&anyhow::anyhow!("HTTP 503 Service Unavailable")), ErrorCategory::Server);
        assert_eq!(classify(&anyhow::anyhow!("Too Many Requests")), ErrorCategory::RateLimit);
        assert_eq!(classify(&anyhow::anyhow!("checksum mismatch")), ErrorCategory::DataCorruption);
        assert_eq!(classify(&anyhow::anyhow!("something odd")), ErrorCategory::Unknown);
    }

    #[test]
    fn severity_levels() {
        assert_eq!(severity(ErrorCategory::DataCorruption), Severity::Critical);
        assert_eq!(severity(ErrorCategory::RateLimit), Severity::Low);
        assert_eq!(severity(ErrorCategory::Network), Severity::Medium);
    }
}
