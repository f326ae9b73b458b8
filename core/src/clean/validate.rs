use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CareerStats, RaceResult, RiderProfile, TeamRoster, TeamStint};

/// Team name length accepted by the backend.
pub const TEAM_NAME_LEN: (usize, usize) = (2, 100);
/// Country length accepted by the backend.
pub const COUNTRY_LEN: (usize, usize) = (2, 50);
/// First/last name length accepted by the backend.
pub const PERSON_NAME_LEN: (usize, usize) = (2, 50);

/// Schema errors and detected inconsistencies attached to a cleaned record.
/// Errors make the record invalid; warnings are corrections or oddities that
/// were logged and kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// No errors were recorded.
    pub is_valid: bool,
    /// Schema violations.
    pub errors: Vec<String>,
    /// Inconsistencies that were detected or auto-corrected.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub(crate) fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub(crate) fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub(crate) fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// A problem in a finishing-position sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionIssue {
    /// More than one rider holds this position.
    Duplicate(u32),
    /// This position is missing from the sequence.
    Gap(u32),
}

impl fmt::Display for PositionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionIssue::Duplicate(p) => write!(f, "duplicate position {p}"),
            PositionIssue::Gap(p) => write!(f, "missing position {p}"),
        }
    }
}

/// Check a position sequence under competition ranking: a tie at `n` for
/// `k` riders is a duplicate, and the next expected position is `n + k`.
pub fn check_positions(positions: &[u32]) -> Vec<PositionIssue> {
    let mut sorted = positions.to_vec();
    sorted.sort_unstable();
    let mut issues = Vec::new();
    let mut expected = 1u32;
    let mut i = 0;
    while i < sorted.len() {
        let p = sorted[i];
        let run = sorted[i..].iter().take_while(|&&q| q == p).count();
        if p > expected {
            issues.push(PositionIssue::Gap(expected));
        }
        if run > 1 {
            issues.push(PositionIssue::Duplicate(p));
        }
        expected = p.saturating_add(run as u32);
        i += run;
    }
    issues
}

/// Raise podiums to at least wins, and top-10s to at least podiums.
pub fn reconcile_career(stats: &mut CareerStats) -> Vec<String> {
    let mut notes = Vec::new();
    if let (Some(wins), Some(podiums)) = (stats.wins, stats.podiums) {
        if wins > podiums {
            notes.push(format!("podiums raised from {podiums} to {wins} to cover wins"));
            stats.podiums = Some(wins);
        }
    }
    if let (Some(podiums), Some(top10s)) = (stats.podiums, stats.top10s) {
        if podiums > top10s {
            notes.push(format!("top10s raised from {top10s} to {podiums} to cover podiums"));
            stats.top10s = Some(podiums);
        }
    }
    notes
}

/// Fix team-history ranges whose start is one year after their end; any
/// larger inversion is reported as an error and left as is.
pub fn reconcile_team_history(history: &mut [TeamStint], v: &mut ValidationResult) {
    for (i, stint) in history.iter_mut().enumerate() {
        let (Some(start), Some(end)) = (stint.start_year, stint.end_year) else { continue };
        if start <= end {
            continue;
        }
        if start - end == 1 {
            stint.start_year = Some(end);
            stint.end_year = Some(start);
            v.warn(format!("team_history[{i}]: swapped years {start}-{end}"));
        } else {
            v.error(format!("team_history[{i}]: start year {start} after end year {end}"));
        }
    }
}

fn check_len(v: &mut ValidationResult, field: &str, value: &str, (lo, hi): (usize, usize)) {
    let n = value.chars().count();
    if n < lo || n > hi {
        v.error(format!("{field}: length {n} outside {lo}-{hi}"));
    }
}

/// Required fields of a race result.
pub fn validate_race(r: &RaceResult, v: &mut ValidationResult) {
    if r.race_name.is_none() {
        v.error("race_name: required");
    }
    if r.date.is_none() {
        v.error("date: required");
    }
    for (i, row) in r.results.iter().enumerate() {
        if row.rider_name.is_none() {
            v.error(format!("results[{i}].rider_name: required"));
        }
    }
}

/// Required fields and backend limits of a rider profile.
pub fn validate_rider(p: &RiderProfile, v: &mut ValidationResult) {
    if p.name.is_none() {
        v.error("name: required");
        return;
    }
    check_len(v, "first_name", &p.first_name, PERSON_NAME_LEN);
    check_len(v, "last_name", &p.last_name, PERSON_NAME_LEN);
}

/// Required fields and backend limits of a team roster.
pub fn validate_team(t: &TeamRoster, v: &mut ValidationResult) {
    match &t.team_name {
        Some(name) => check_len(v, "team_name", name, TEAM_NAME_LEN),
        None => v.error("team_name: required"),
    }
    if let Some(country) = &t.country {
        check_len(v, "country", country, COUNTRY_LEN);
    }
    for (i, r) in t.riders.iter().enumerate() {
        if r.name.is_none() {
            v.error(format!("riders[{i}].name: required"));
        }
    }
}
