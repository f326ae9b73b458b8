use std::fmt;

use serde::{Deserialize, Serialize};

use super::classify::ErrorCategory;

/// Named response to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Re-invoke the caller's retry function after a backoff delay.
    Retry,
    /// Last-known-good data for the key, else an empty default.
    Fallback,
    /// Same lookup as `Fallback`.
    Cache,
    /// Re-run extraction and cleaning on the raw page in hand.
    Reparse,
    /// Re-run cleaning on the record in hand.
    Clean,
    /// Most recent verified backup for the data type.
    Restore,
    /// Short cooldown, then retry.
    Delay,
    /// Long cooldown, then retry.
    Throttle,
    /// Placeholder result treated as handled.
    Skip,
    /// Queue for out-of-band inspection; always fails.
    ManualReview,
}

impl RecoveryStrategy {
    /// Kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Cache => "cache",
            RecoveryStrategy::Reparse => "reparse",
            RecoveryStrategy::Clean => "clean",
            RecoveryStrategy::Restore => "restore",
            RecoveryStrategy::Delay => "delay",
            RecoveryStrategy::Throttle => "throttle",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::ManualReview => "manual-review",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered strategies tried for successive failures in `category`.
pub fn strategies_for(category: ErrorCategory) -> &'static [RecoveryStrategy] {
    use RecoveryStrategy::*;
    match category {
        ErrorCategory::Network => &[Retry, Fallback, Cache],
        ErrorCategory::Parsing => &[Reparse, Fallback, Skip],
        ErrorCategory::Validation => &[Clean, Skip],
        ErrorCategory::RateLimit => &[Throttle, Delay],
        ErrorCategory::Server => &[Delay, Retry, Cache],
        ErrorCategory::DataCorruption => &[Restore, Fallback],
        ErrorCategory::Unknown => &[Retry, Skip],
    }
}

/// Strategy for the `attempt`-th (1-based) consecutive failure.
pub fn select(category: ErrorCategory, attempt: u32) -> RecoveryStrategy {
    let list = strategies_for(category);
    attempt
        .checked_sub(1)
        .and_then(|i| list.get(i as usize))
        .copied()
        .unwrap_or(RecoveryStrategy::ManualReview)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::Parsing,
        ErrorCategory::Validation,
        ErrorCategory::RateLimit,
        ErrorCategory::Server,
        ErrorCategory::DataCorruption,
        ErrorCategory::Unknown,
    ];

    #[test]
    fn kth_failure_walks_the_list_then_manual_review() {
        for cat in ALL {
            let list = strategies_for(cat);
            for k in 1..=list.len() as u32 + 3 {
                let expected = if k as usize > list.len() {
                    RecoveryStrategy::ManualReview
                } else {
                    list[k as usize - 1]
                };
                assert_eq!(select(cat, k), expected, "{cat} attempt {k}");
            }
        }
    }

    #[test]
    fn names_are_kebab_case() {
        assert_eq!(RecoveryStrategy::ManualReview.to_string(), "manual-review");
        assert_eq!(serde_json::to_value(RecoveryStrategy::Reparse).unwrap(), "reparse");
    }
}
