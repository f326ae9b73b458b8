use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use pelo_core::Error;

/// A validated cron expression.
///
/// Accepts the classic 5-field form (minute resolution) and the 6/7-field
/// form with a leading seconds field. 5-field input fires at second 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let trimmed = expr.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::InvalidSchedule {
                    expr: expr.to_string(),
                    message: format!("expected 5 to 7 fields, found {n}"),
                })
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| Error::InvalidSchedule {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { expr: trimmed.to_string(), schedule })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Wall time from `now` until the next fire time.
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now).map(|t| (t - now).to_std().unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_form_fires_on_the_minute() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 12, 3, 17).unwrap();
        assert_eq!(s.next_after(from), Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap()));
        assert_eq!(s.until_next(from), Some(Duration::from_secs(103)));
    }

    #[test]
    fn seconds_form_and_day_names() {
        let s = CronSchedule::parse("0 0 3 * * Mon").unwrap();
        // 2026-03-01 is a Sunday.
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(s.next_after(from), Some(Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap()));
        assert_eq!(s.expr(), "0 0 3 * * Mon");
    }

    #[test]
    fn garbage_is_an_invalid_schedule() {
        for bad in ["", "every day", "* * *", "61 * * * *"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidSchedule { .. }), "{bad:?} -> {err}");
        }
    }
}
