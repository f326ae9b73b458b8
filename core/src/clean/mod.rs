//! Normalization, validation and data-quality scoring of extracted records.
//!
//! Cleaning never fails: unusable values become `None`, inconsistencies are
//! corrected or recorded, and schema violations land in
//! [`ValidationResult::errors`].

mod domain;
mod quality;
mod standardize;
mod validate;

pub use domain::{ResultStatus, Specialization, TeamCategory};
pub use quality::DataQuality;
pub use standardize::*;
pub use validate::{check_positions, PositionIssue, ValidationResult, COUNTRY_LEN, PERSON_NAME_LEN, TEAM_NAME_LEN};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extract::{
    ExtractedRecord, RawCareerStats, RawRaceResult, RawResultRow, RawRiderProfile, RawRosterEntry,
    RawTeamRoster, RawTeamStint,
};

/// One cleaned result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    /// Finishing position; `None` for non-finishers.
    pub position: Option<u32>,
    /// Rider name in "Given Surname" order.
    pub rider_name: Option<String>,
    /// Nationality code or country name.
    pub nationality: Option<String>,
    /// Team name.
    pub team: Option<String>,
    /// Time or gap as `HH:MM:SS`.
    pub time: Option<String>,
    /// Result status.
    pub status: ResultStatus,
    /// Points awarded.
    pub points: Option<u32>,
}

/// A cleaned race or stage result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceResult {
    /// Race title.
    pub race_name: Option<String>,
    /// Race date.
    pub date: Option<NaiveDate>,
    /// Stage number.
    pub stage: Option<u32>,
    /// Distance in kilometres.
    pub distance_km: Option<f64>,
    /// Elevation gain in metres.
    pub elevation_m: Option<u32>,
    /// Race type label.
    pub race_type: Option<String>,
    /// Result rows in page order.
    pub results: Vec<ResultRow>,
}

/// Career counters after monotonicity correction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareerStats {
    /// Wins.
    pub wins: Option<u32>,
    /// Podium finishes, at least `wins`.
    pub podiums: Option<u32>,
    /// Top-10 finishes, at least `podiums`.
    pub top10s: Option<u32>,
    /// Race days.
    pub race_days: Option<u32>,
}

/// One team stint with parsed years.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStint {
    /// Team name.
    pub team: Option<String>,
    /// First season.
    pub start_year: Option<i32>,
    /// Last season.
    pub end_year: Option<i32>,
}

/// A cleaned rider profile. `first_name`/`last_name` are empty when the
/// name is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderProfile {
    /// Display name.
    pub name: Option<String>,
    /// Given name(s).
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Date of birth.
    pub date_of_birth: Option<NaiveDate>,
    /// Nationality code or country name.
    pub nationality: Option<String>,
    /// Height in centimetres.
    pub height_cm: Option<u32>,
    /// Weight in kilograms.
    pub weight_kg: Option<f64>,
    /// Team name.
    pub team: Option<String>,
    /// Specialization, when recognised.
    pub specialization: Option<Specialization>,
    /// Career counters.
    pub career: CareerStats,
    /// Team history.
    pub team_history: Vec<TeamStint>,
}

/// One cleaned roster line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Display name.
    pub name: Option<String>,
    /// Nationality code or country name.
    pub nationality: Option<String>,
    /// Date of birth.
    pub date_of_birth: Option<NaiveDate>,
    /// Role within the team.
    pub role: Option<String>,
}

/// A cleaned team roster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoster {
    /// Team name.
    pub team_name: Option<String>,
    /// Registration country.
    pub country: Option<String>,
    /// Category, `Continental` when unknown.
    pub category: TeamCategory,
    /// Season.
    pub season: Option<i32>,
    /// Riders.
    pub riders: Vec<RosterEntry>,
}

/// A cleaned record with its quality metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cleaned<T> {
    /// Normalized fields.
    pub record: T,
    /// Quality score and sub-scores.
    pub data_quality: DataQuality,
    /// Schema errors and detected inconsistencies.
    pub validation_result: ValidationResult,
}

/// Any cleaned record, tagged by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CleanedRecord {
    /// Race or stage result.
    RaceResult(Cleaned<RaceResult>),
    /// Rider profile.
    RiderProfile(Cleaned<RiderProfile>),
    /// Team roster.
    TeamRoster(Cleaned<TeamRoster>),
}

impl CleanedRecord {
    /// Overall quality score.
    pub fn quality_score(&self) -> f64 {
        match self {
            CleanedRecord::RaceResult(c) => c.data_quality.overall_score,
            CleanedRecord::RiderProfile(c) => c.data_quality.overall_score,
            CleanedRecord::TeamRoster(c) => c.data_quality.overall_score,
        }
    }

    /// Validation outcome.
    pub fn validation(&self) -> &ValidationResult {
        match self {
            CleanedRecord::RaceResult(c) => &c.validation_result,
            CleanedRecord::RiderProfile(c) => &c.validation_result,
            CleanedRecord::TeamRoster(c) => &c.validation_result,
        }
    }

    /// Render back to raw form; cleaning the result reproduces this record.
    pub fn to_raw(&self) -> ExtractedRecord {
        match self {
            CleanedRecord::RaceResult(c) => ExtractedRecord::RaceResult(c.record.to_raw()),
            CleanedRecord::RiderProfile(c) => ExtractedRecord::RiderProfile(c.record.to_raw()),
            CleanedRecord::TeamRoster(c) => ExtractedRecord::TeamRoster(c.record.to_raw()),
        }
    }
}

/// Clean any extracted record.
pub fn clean(raw: &ExtractedRecord) -> CleanedRecord {
    match raw {
        ExtractedRecord::RaceResult(r) => CleanedRecord::RaceResult(clean_race_result(r)),
        ExtractedRecord::RiderProfile(r) => CleanedRecord::RiderProfile(clean_rider_profile(r)),
        ExtractedRecord::TeamRoster(r) => CleanedRecord::TeamRoster(clean_team_roster(r)),
    }
}

fn opt<T>(raw: &Option<String>, f: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    raw.as_deref().and_then(f)
}

fn clean_row(row: &RawResultRow) -> ResultRow {
    let pos_raw = row.position.as_deref().unwrap_or("").trim().trim_end_matches('.');
    let position = pos_raw.parse::<u32>().ok().filter(|p| *p > 0);
    let status = row
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(standardize_status)
        .or_else(|| (position.is_none() && ResultStatus::is_code(pos_raw)).then(|| standardize_status(pos_raw)))
        .unwrap_or_default();
    ResultRow {
        position,
        rider_name: opt(&row.rider_name, standardize_name),
        nationality: opt(&row.nationality, standardize_nationality),
        team: opt(&row.team, standardize_text),
        time: opt(&row.time, standardize_time),
        status,
        points: opt(&row.points, standardize_count),
    }
}

/// Clean a race result and score it.
pub fn clean_race_result(raw: &RawRaceResult) -> Cleaned<RaceResult> {
    let record = RaceResult {
        race_name: opt(&raw.race_name, standardize_text),
        date: opt(&raw.date, standardize_date),
        stage: opt(&raw.stage, standardize_stage),
        distance_km: opt(&raw.distance, standardize_distance),
        elevation_m: opt(&raw.elevation, standardize_elevation),
        race_type: opt(&raw.race_type, standardize_text),
        results: raw.results.iter().map(clean_row).collect(),
    };

    let mut v = ValidationResult::default();
    let positions: Vec<u32> = record.results.iter().filter_map(|r| r.position).collect();
    for issue in check_positions(&positions) {
        warn!(race = record.race_name.as_deref().unwrap_or("?"), %issue, "result position inconsistency");
        v.warn(format!("results: {issue}"));
    }
    validate::validate_race(&record, &mut v);
    let v = v.finish();
    let q = quality::race_quality(&record, &v);
    info!(
        record = "race-result",
        score = q.overall_score,
        rows = record.results.len(),
        errors = v.errors.len(),
        "data quality measured"
    );
    Cleaned { record, data_quality: q, validation_result: v }
}

/// Clean a rider profile and score it.
pub fn clean_rider_profile(raw: &RawRiderProfile) -> Cleaned<RiderProfile> {
    let name = opt(&raw.name, standardize_rider_name);
    let c = &raw.career;
    let mut record = RiderProfile {
        first_name: name.as_ref().map(|n| n.first.clone()).unwrap_or_default(),
        last_name: name.as_ref().map(|n| n.last.clone()).unwrap_or_default(),
        name: name.map(|n| n.full),
        date_of_birth: opt(&raw.date_of_birth, standardize_date),
        nationality: opt(&raw.nationality, standardize_nationality),
        height_cm: opt(&raw.height, standardize_height),
        weight_kg: opt(&raw.weight, standardize_weight),
        team: opt(&raw.team, standardize_text),
        specialization: opt(&raw.specialization, Specialization::lookup),
        career: CareerStats {
            wins: opt(&c.wins, standardize_count),
            podiums: opt(&c.podiums, standardize_count),
            top10s: opt(&c.top10s, standardize_count),
            race_days: opt(&c.race_days, standardize_count),
        },
        team_history: raw
            .team_history
            .iter()
            .map(|s| TeamStint {
                team: opt(&s.team, standardize_text),
                start_year: opt(&s.start_year, standardize_year),
                end_year: opt(&s.end_year, standardize_year),
            })
            .collect(),
    };

    let mut v = ValidationResult::default();
    for note in validate::reconcile_career(&mut record.career) {
        warn!(rider = record.name.as_deref().unwrap_or("?"), %note, "career stats corrected");
        v.warn(note);
    }
    validate::reconcile_team_history(&mut record.team_history, &mut v);
    validate::validate_rider(&record, &mut v);
    let v = v.finish();
    let q = quality::rider_quality(&record, &v);
    info!(record = "rider-profile", score = q.overall_score, errors = v.errors.len(), "data quality measured");
    Cleaned { record, data_quality: q, validation_result: v }
}

/// Clean a team roster and score it.
pub fn clean_team_roster(raw: &RawTeamRoster) -> Cleaned<TeamRoster> {
    let record = TeamRoster {
        team_name: opt(&raw.team_name, standardize_text),
        country: opt(&raw.country, standardize_nationality),
        category: raw.category.as_deref().map(TeamCategory::lookup).unwrap_or_default(),
        season: opt(&raw.season, standardize_year),
        riders: raw
            .riders
            .iter()
            .map(|r| RosterEntry {
                name: opt(&r.name, standardize_name),
                nationality: opt(&r.nationality, standardize_nationality),
                date_of_birth: opt(&r.date_of_birth, standardize_date),
                role: opt(&r.role, standardize_text),
            })
            .collect(),
    };
    let mut v = ValidationResult::default();
    validate::validate_team(&record, &mut v);
    let v = v.finish();
    let q = quality::team_quality(&record, &v);
    info!(
        record = "team-roster",
        score = q.overall_score,
        riders = record.riders.len(),
        errors = v.errors.len(),
        "data quality measured"
    );
    Cleaned { record, data_quality: q, validation_result: v }
}

fn iso(d: &Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format("%Y-%m-%d").to_string())
}

fn num<T: ToString>(v: &Option<T>) -> Option<String> {
    v.as_ref().map(ToString::to_string)
}

impl RaceResult {
    /// Raw form that cleans back to `self`.
    pub fn to_raw(&self) -> RawRaceResult {
        RawRaceResult {
            race_name: self.race_name.clone(),
            date: iso(&self.date),
            stage: num(&self.stage),
            distance: self.distance_km.map(|d| format!("{d} km")),
            elevation: self.elevation_m.map(|e| format!("{e} m")),
            race_type: self.race_type.clone(),
            results: self
                .results
                .iter()
                .map(|r| RawResultRow {
                    position: num(&r.position),
                    rider_name: r.rider_name.clone(),
                    nationality: r.nationality.clone(),
                    team: r.team.clone(),
                    time: r.time.clone(),
                    status: Some(r.status.display_code().to_string()),
                    points: num(&r.points),
                })
                .collect(),
        }
    }
}

impl RiderProfile {
    /// Raw form that cleans back to `self`.
    pub fn to_raw(&self) -> RawRiderProfile {
        RawRiderProfile {
            name: self.name.clone(),
            date_of_birth: iso(&self.date_of_birth),
            nationality: self.nationality.clone(),
            height: self.height_cm.map(|h| format!("{h} cm")),
            weight: self.weight_kg.map(|w| format!("{w} kg")),
            team: self.team.clone(),
            specialization: self.specialization.map(|s| s.as_str().to_string()),
            career: RawCareerStats {
                wins: num(&self.career.wins),
                podiums: num(&self.career.podiums),
                top10s: num(&self.career.top10s),
                race_days: num(&self.career.race_days),
            },
            team_history: self
                .team_history
                .iter()
                .map(|s| RawTeamStint {
                    team: s.team.clone(),
                    start_year: num(&s.start_year),
                    end_year: num(&s.end_year),
                })
                .collect(),
        }
    }
}

impl TeamRoster {
    /// Raw form that cleans back to `self`.
    pub fn to_raw(&self) -> RawTeamRoster {
        RawTeamRoster {
            team_name: self.team_name.clone(),
            country: self.country.clone(),
            category: Some(self.category.as_str().to_string()),
            season: num(&self.season),
            riders: self
                .riders
                .iter()
                .map(|r| RawRosterEntry {
                    name: r.name.clone(),
                    nationality: r.nationality.clone(),
                    date_of_birth: iso(&r.date_of_birth),
                    role: r.role.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pos: &str, name: &str, time: &str) -> RawResultRow {
        RawResultRow {
            position: Some(pos.into()),
            rider_name: Some(name.into()),
            team: Some("Visma | Lease a Bike".into()),
            time: Some(time.into()),
            ..Default::default()
        }
    }

    fn race(rows: Vec<RawResultRow>) -> RawRaceResult {
        RawRaceResult {
            race_name: Some("Tour de France".into()),
            date: Some("2024-06-29".into()),
            stage: Some("1".into()),
            distance: Some("206 km".into()),
            elevation: Some("3600 m".into()),
            race_type: Some("Stage race".into()),
            results: rows,
        }
    }

    #[test]
    fn race_rows_are_normalized() {
        let raw = race(vec![
            row("1", "BARDET Romain", "5:26:58"),
            row("2", "VAN DEN BROEK Frank", "s.t."),
            row("DNF", "Some Rider", ""),
        ]);
        let c = clean_race_result(&raw);
        let rows = &c.record.results;
        assert_eq!(rows[0].rider_name.as_deref(), Some("Romain Bardet"));
        assert_eq!(rows[0].time.as_deref(), Some("05:26:58"));
        assert_eq!(rows[1].time.as_deref(), Some("00:00:00"));
        assert_eq!(rows[2].position, None);
        assert_eq!(rows[2].status, ResultStatus::Dnf);
        assert_eq!(c.record.distance_km, Some(206.0));
        assert!(c.validation_result.is_valid);
    }

    #[test]
    fn position_issues_are_recorded_not_fatal() {
        let raw = race(vec![row("1", "A Rider", "1:00:00"), row("3", "B Rider", "1:00:00")]);
        let c = clean_race_result(&raw);
        assert!(c.validation_result.is_valid);
        assert_eq!(c.validation_result.warnings, vec!["results: missing position 2".to_string()]);
        assert!(c.data_quality.scores["consistency"] < 1.0);
    }

    #[test]
    fn missing_required_fields_invalidate() {
        let c = clean_race_result(&RawRaceResult::default());
        assert!(!c.validation_result.is_valid);
        assert_eq!(c.validation_result.errors.len(), 2);
        assert_eq!(c.data_quality.scores["resultCompleteness"], 0.0);
    }

    #[test]
    fn cleaning_is_idempotent_on_normalized_input() {
        let raw = race(vec![row("1", "Romain Bardet", "05:26:58"), row("2", "Frank van den Broek", "00:00:00")]);
        let once = clean(&ExtractedRecord::RaceResult(raw));
        let twice = clean(&once.to_raw());
        assert_eq!(once, twice);

        let rider = RawRiderProfile {
            name: Some("Tadej Pogacar".into()),
            date_of_birth: Some("1998-09-21".into()),
            nationality: Some("SLO".into()),
            height: Some("176 cm".into()),
            weight: Some("66 kg".into()),
            specialization: Some("ALL_ROUNDER".into()),
            career: RawCareerStats {
                wins: Some("88".into()),
                podiums: Some("140".into()),
                top10s: Some("200".into()),
                race_days: Some("600".into()),
            },
            team_history: vec![RawTeamStint {
                team: Some("UAE Team Emirates".into()),
                start_year: Some("2019".into()),
                end_year: Some("2024".into()),
            }],
            ..Default::default()
        };
        let once = clean(&ExtractedRecord::RiderProfile(rider));
        assert_eq!(once, clean(&once.to_raw()));
    }

    #[test]
    fn rider_profile_corrections() {
        let raw = RawRiderProfile {
            name: Some("POGAČAR Tadej".into()),
            height: Some("250".into()),
            career: RawCareerStats { wins: Some("9".into()), podiums: Some("3".into()), ..Default::default() },
            ..Default::default()
        };
        let c = clean_rider_profile(&raw);
        assert_eq!(c.record.name.as_deref(), Some("Tadej Pogacar"));
        assert_eq!(c.record.first_name, "Tadej");
        assert_eq!(c.record.last_name, "Pogacar");
        assert_eq!(c.record.height_cm, None);
        assert_eq!(c.record.career.podiums, Some(9));
        assert_eq!(c.validation_result.warnings.len(), 1);
    }

    #[test]
    fn team_defaults_to_continental() {
        let raw = RawTeamRoster {
            team_name: Some("  Lidl -  Trek ".into()),
            country: Some("usa".into()),
            season: Some("2024".into()),
            ..Default::default()
        };
        let c = clean_team_roster(&raw);
        assert_eq!(c.record.team_name.as_deref(), Some("Lidl - Trek"));
        assert_eq!(c.record.category, TeamCategory::Continental);
        assert_eq!(c.record.country.as_deref(), Some("USA"));
        assert_eq!(c.record.season, Some(2024));
    }

    #[test]
    fn cleaned_record_serializes_quality_metadata() {
        let c = clean(&ExtractedRecord::TeamRoster(RawTeamRoster::default()));
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "team-roster");
        assert_eq!(v["validationResult"]["isValid"], false);
        assert!(v["dataQuality"]["overallScore"].is_number());
    }
}
