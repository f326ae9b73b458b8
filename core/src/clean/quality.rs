use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::validate::ValidationResult;
use super::{RaceResult, RiderProfile, TeamRoster};

/// Weighted 0..=1 quality score plus the sub-scores it was built from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuality {
    /// Weighted composite.
    pub overall_score: f64,
    /// Sub-scores by name.
    pub scores: BTreeMap<String, f64>,
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn filled(fields: &[bool]) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }
    fields.iter().filter(|f| **f).count() as f64 / fields.len() as f64
}

fn average<T>(items: &[T], f: impl Fn(&T) -> f64) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    items.iter().map(f).sum::<f64>() / items.len() as f64
}

/// 1.0 minus 0.1 per error and 0.05 per warning.
fn consistency(v: &ValidationResult) -> f64 {
    (1.0 - 0.1 * v.errors.len() as f64 - 0.05 * v.warnings.len() as f64).clamp(0.0, 1.0)
}

fn weighted(parts: &[(&str, f64, f64)]) -> DataQuality {
    let total: f64 = parts.iter().map(|(_, w, _)| w).sum();
    let sum: f64 = parts.iter().map(|(_, w, s)| w * s).sum();
    DataQuality {
        overall_score: round3(if total > 0.0 { sum / total } else { 0.0 }),
        scores: parts.iter().map(|(n, _, s)| (n.to_string(), round3(*s))).collect(),
    }
}

/// Race: info 20, stage data 30, result completeness 40, consistency 10.
pub fn race_quality(r: &RaceResult, v: &ValidationResult) -> DataQuality {
    let info = filled(&[r.race_name.is_some(), r.date.is_some(), r.race_type.is_some()]);
    let stage = filled(&[r.stage.is_some(), r.distance_km.is_some(), r.elevation_m.is_some()]);
    let results = average(&r.results, |row| {
        filled(&[
            row.position.is_some() || !row.status.is_finisher(),
            row.rider_name.is_some(),
            row.team.is_some(),
            row.time.is_some(),
        ])
    });
    weighted(&[
        ("info", 20.0, info),
        ("stageData", 30.0, stage),
        ("resultCompleteness", 40.0, results),
        ("consistency", 10.0, consistency(v)),
    ])
}

/// Rider: basic 30, physical 20, career 25, history 15, consistency 10.
pub fn rider_quality(p: &RiderProfile, v: &ValidationResult) -> DataQuality {
    let basic = filled(&[p.name.is_some(), p.date_of_birth.is_some(), p.nationality.is_some(), p.team.is_some()]);
    let physical = filled(&[p.height_cm.is_some(), p.weight_kg.is_some()]);
    let c = &p.career;
    let career = filled(&[c.wins.is_some(), c.podiums.is_some(), c.top10s.is_some(), c.race_days.is_some()]);
    let history = if p.team_history.is_empty() { 0.0 } else { 1.0 };
    weighted(&[
        ("basicInfo", 30.0, basic),
        ("physical", 20.0, physical),
        ("career", 25.0, career),
        ("teamHistory", 15.0, history),
        ("consistency", 10.0, consistency(v)),
    ])
}

/// Team: info 30, roster 50, consistency 20.
pub fn team_quality(t: &TeamRoster, v: &ValidationResult) -> DataQuality {
    let info = filled(&[t.team_name.is_some(), t.country.is_some(), t.season.is_some()]);
    let roster = average(&t.riders, |r| {
        filled(&[r.name.is_some(), r.nationality.is_some(), r.date_of_birth.is_some(), r.role.is_some()])
    });
    weighted(&[("info", 30.0, info), ("roster", 50.0, roster), ("consistency", 20.0, consistency(v))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clean::TeamStint;

    #[test]
    fn empty_team_scores_only_consistency() {
        let q = team_quality(&TeamRoster::default(), &ValidationResult::default());
        assert_eq!(q.overall_score, 0.2);
        assert_eq!(q.scores["roster"], 0.0);
    }

    #[test]
    fn errors_lower_consistency() {
        let mut v = ValidationResult::default();
        v.error("a");
        v.error("b");
        v.warn("c");
        assert!((consistency(&v) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn rider_weights_add_up() {
        let p = RiderProfile {
            name: Some("A B".into()),
            team_history: vec![TeamStint::default()],
            ..Default::default()
        };
        let q = rider_quality(&p, &ValidationResult::default());
        // 30 * 0.25 + 15 + 10 = 32.5
        assert_eq!(q.overall_score, 0.325);
    }
}
