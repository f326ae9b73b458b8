use serde::{Deserialize, Serialize};

/// One row of a results table, as scraped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResultRow {
    /// Position cell (may hold a status code such as `DNF`).
    pub position: Option<String>,
    /// Rider name.
    pub rider_name: Option<String>,
    /// Rider nationality.
    pub nationality: Option<String>,
    /// Team name.
    pub team: Option<String>,
    /// Finishing time or gap.
    pub time: Option<String>,
    /// Explicit status cell.
    pub status: Option<String>,
    /// Points awarded.
    pub points: Option<String>,
}

/// A scraped race or stage result page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRaceResult {
    /// Race title.
    pub race_name: Option<String>,
    /// Race date in any supported format.
    pub date: Option<String>,
    /// Stage number, when the page is a stage.
    pub stage: Option<String>,
    /// Distance with unit.
    pub distance: Option<String>,
    /// Elevation gain with unit.
    pub elevation: Option<String>,
    /// Race type label.
    pub race_type: Option<String>,
    /// Result rows in page order.
    pub results: Vec<RawResultRow>,
}

/// Career counters as scraped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCareerStats {
    /// Wins.
    pub wins: Option<String>,
    /// Podium finishes.
    pub podiums: Option<String>,
    /// Top-10 finishes.
    pub top10s: Option<String>,
    /// Race days.
    pub race_days: Option<String>,
}

/// One team stint in a rider's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTeamStint {
    /// Team name.
    pub team: Option<String>,
    /// First season.
    pub start_year: Option<String>,
    /// Last season.
    pub end_year: Option<String>,
}

/// A scraped rider profile page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRiderProfile {
    /// Full name.
    pub name: Option<String>,
    /// Date of birth in any supported format.
    pub date_of_birth: Option<String>,
    /// Nationality.
    pub nationality: Option<String>,
    /// Height with unit.
    pub height: Option<String>,
    /// Weight with unit.
    pub weight: Option<String>,
    /// Current team.
    pub team: Option<String>,
    /// Specialization label.
    pub specialization: Option<String>,
    /// Career counters.
    pub career: RawCareerStats,
    /// Team history rows.
    pub team_history: Vec<RawTeamStint>,
}

/// One roster line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRosterEntry {
    /// Rider name.
    pub name: Option<String>,
    /// Nationality.
    pub nationality: Option<String>,
    /// Date of birth.
    pub date_of_birth: Option<String>,
    /// Role within the team.
    pub role: Option<String>,
}

/// A scraped team roster page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTeamRoster {
    /// Team name.
    pub team_name: Option<String>,
    /// Registration country.
    pub country: Option<String>,
    /// Category label.
    pub category: Option<String>,
    /// Season.
    pub season: Option<String>,
    /// Riders.
    pub riders: Vec<RawRosterEntry>,
}

/// Output of [`super::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExtractedRecord {
    /// Race or stage result.
    RaceResult(RawRaceResult),
    /// Rider profile.
    RiderProfile(RawRiderProfile),
    /// Team roster.
    TeamRoster(RawTeamRoster),
}
