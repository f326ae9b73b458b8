//! HTML to structured record extraction.
//!
//! Pure functions over page text. Missing optional data yields `None` or an
//! empty list; only structurally unusable input is a [`ParseError`].

mod html;
mod records;

pub use records::{
    ExtractedRecord, RawCareerStats, RawRaceResult, RawResultRow, RawRiderProfile, RawRosterEntry,
    RawTeamRoster, RawTeamStint,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use html::{has_class, text, Doc};

/// Which record shape a page should be read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaHint {
    /// Race or stage results.
    RaceResult,
    /// Rider profile.
    RiderProfile,
    /// Team roster.
    TeamRoster,
}

impl SchemaHint {
    /// Stable kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaHint::RaceResult => "race-result",
            SchemaHint::RiderProfile => "rider-profile",
            SchemaHint::TeamRoster => "team-roster",
        }
    }
}

impl fmt::Display for SchemaHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "race-result" | "race-results" | "race" | "results" => Ok(SchemaHint::RaceResult),
            "rider-profile" | "rider-profiles" | "rider" | "riders" => Ok(SchemaHint::RiderProfile),
            "team-roster" | "team-rosters" | "team" | "teams" => Ok(SchemaHint::TeamRoster),
            other => Err(format!("unknown record type {other}")),
        }
    }
}

/// Parse `html` into the record shape named by `hint`.
pub fn parse(html: &str, hint: SchemaHint) -> Result<ExtractedRecord, ParseError> {
    if html.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if !looks_like_markup(html) {
        return Err(ParseError::NotHtml);
    }
    let doc = Doc::new(html);
    Ok(match hint {
        SchemaHint::RaceResult => ExtractedRecord::RaceResult(parse_race(&doc)?),
        SchemaHint::RiderProfile => ExtractedRecord::RiderProfile(parse_rider(&doc)?),
        SchemaHint::TeamRoster => ExtractedRecord::TeamRoster(parse_team(&doc)?),
    })
}

fn looks_like_markup(s: &str) -> bool {
    match s.find('<') {
        Some(lt) => s[lt..]
            .chars()
            .nth(1)
            .map(|c| c.is_ascii_alphabetic() || c == '!' || c == '/')
            .unwrap_or(false),
        None => false,
    }
}

fn title(doc: &Doc<'_>) -> Result<Option<String>, ParseError> {
    Ok(doc.next("h1", 0)?.map(|el| text(el.inner)).filter(|t| !t.is_empty()))
}

/// A table as rows of cell texts plus lowercased header labels, if any.
struct Table {
    header: Vec<String>,
    rows: Vec<Row>,
}

struct Row {
    cells: Vec<String>,
    /// Country code from a flag marker anywhere in the row.
    flag: Option<String>,
}

impl Table {
    fn read(doc: &Doc<'_>, class: &str) -> Result<Option<Self>, ParseError> {
        let Some(table) = doc.by_class(class)? else { return Ok(None) };
        let inner = Doc::new(table.inner);
        let mut header = Vec::new();
        let mut rows = Vec::new();
        for tr in inner.all("tr")? {
            let row = Doc::new(tr.inner);
            let th = row.all("th")?;
            if !th.is_empty() {
                header = th.iter().map(|c| text(c.inner).to_ascii_lowercase()).collect();
                continue;
            }
            let cells: Vec<String> = row.all("td")?.iter().map(|c| text(c.inner)).collect();
            if cells.iter().any(|c| !c.is_empty()) {
                rows.push(Row { cells, flag: flag_in(&row)? });
            }
        }
        Ok(Some(Self { header, rows }))
    }

    /// Column index for the first header matching any of `names`, else `default`.
    fn column(&self, names: &[&str], default: Option<usize>) -> Option<usize> {
        if self.header.is_empty() {
            return default;
        }
        self.header.iter().position(|h| names.iter().any(|n| h == n || h.starts_with(n)))
    }
}

fn cell(row: &Row, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| row.cells.get(i)).filter(|s| !s.is_empty()).cloned()
}

/// Nationality from a `<span class="flag xx">` marker, if present.
fn flag_in(doc: &Doc<'_>) -> Result<Option<String>, ParseError> {
    let mut pos = 0;
    while let Some(span) = doc.next("span", pos)? {
        pos = span.end;
        if has_class(span.attrs, "flag") {
            let lc = span.attrs.to_ascii_lowercase();
            let code = lc
                .split(|c: char| c == '"' || c == '\'' || c.is_whitespace())
                .find(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_alphabetic()));
            if let Some(code) = code {
                return Ok(Some(code.to_ascii_uppercase()));
            }
        }
    }
    Ok(None)
}

fn parse_race(doc: &Doc<'_>) -> Result<RawRaceResult, ParseError> {
    let mut out = RawRaceResult {
        race_name: title(doc)?,
        date: doc.text_of_class("date")?,
        stage: doc.text_of_class("stage")?,
        distance: doc.text_of_class("distance")?,
        elevation: doc.text_of_class("elevation")?,
        race_type: doc.text_of_class("race-type")?,
        results: Vec::new(),
    };

    let Some(table) = Table::read(doc, "results")? else { return Ok(out) };
    let pos = table.column(&["pos", "rnk", "rank", "#"], Some(0));
    let rider = table.column(&["rider", "name"], Some(1));
    let team = table.column(&["team"], Some(2));
    let time = table.column(&["time", "gap"], Some(3));
    let status = table.column(&["status"], Some(4));
    let nat = table.column(&["nat", "nationality"], None);
    let pts = table.column(&["pts", "points"], None);

    for row in &table.rows {
        out.results.push(RawResultRow {
            position: cell(row, pos),
            rider_name: cell(row, rider),
            nationality: cell(row, nat).or_else(|| row.flag.clone()),
            team: cell(row, team),
            time: cell(row, time),
            status: cell(row, status),
            points: cell(row, pts),
        });
    }
    Ok(out)
}

fn parse_rider(doc: &Doc<'_>) -> Result<RawRiderProfile, ParseError> {
    let mut out = RawRiderProfile {
        name: title(doc)?,
        date_of_birth: doc.text_of_class("dob")?,
        nationality: doc.text_of_class("nationality")?,
        height: doc.text_of_class("height")?,
        weight: doc.text_of_class("weight")?,
        team: doc.text_of_class("team")?,
        specialization: doc.text_of_class("specialization")?,
        career: RawCareerStats {
            wins: doc.text_of_class("wins")?,
            podiums: doc.text_of_class("podiums")?,
            top10s: doc.text_of_class("top10s")?,
            race_days: doc.text_of_class("race-days")?,
        },
        team_history: Vec::new(),
    };

    if let Some(table) = Table::read(doc, "teams")? {
        let team = table.column(&["team"], Some(0));
        let from = table.column(&["from", "start"], Some(1));
        let to = table.column(&["to", "until", "end"], Some(2));
        for row in &table.rows {
            out.team_history.push(RawTeamStint {
                team: cell(row, team),
                start_year: cell(row, from),
                end_year: cell(row, to),
            });
        }
    }
    Ok(out)
}

fn parse_team(doc: &Doc<'_>) -> Result<RawTeamRoster, ParseError> {
    let mut out = RawTeamRoster {
        team_name: title(doc)?,
        country: doc.text_of_class("country")?,
        category: doc.text_of_class("category")?,
        season: doc.text_of_class("season")?,
        riders: Vec::new(),
    };

    if let Some(table) = Table::read(doc, "roster")? {
        let name = table.column(&["rider", "name"], Some(0));
        let nat = table.column(&["nat", "nationality", "country"], Some(1));
        let dob = table.column(&["dob", "born", "date of birth"], Some(2));
        let role = table.column(&["role", "position"], Some(3));
        for row in &table.rows {
            out.riders.push(RawRosterEntry {
                name: cell(row, name),
                nationality: cell(row, nat),
                date_of_birth: cell(row, dob),
                role: cell(row, role),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RACE: &str = r#"
<html><body>
<h1>Tour de France 2024 &ndash; Stage 1</h1>
<div class="info">
  <span class="date">29 June 2024</span>
  <span class="stage">1</span>
  <span class="distance">206 km</span>
  <span class="elevation">3600 m</span>
</div>
<table class="results">
  <thead><tr><th>Pos</th><th>Rider</th><th>Team</th><th>Time</th></tr></thead>
  <tbody>
  <tr><td>1</td><td><span class="flag fr"></span> <a href="/rider/romain-bardet">BARDET Romain</a></td><td>Team dsm-firmenich PostNL</td><td>5:26:58</td></tr>
  <tr><td>2</td><td><a>VAN DEN BROEK Frank</a></td><td>Team dsm-firmenich PostNL</td><td>s.t.</td></tr>
  <tr><td>DNF</td><td><a>Some Rider</a></td><td></td><td></td></tr>
  </tbody>
</table>
</body></html>"#;

    #[test]
    fn race_results_follow_header_columns() {
        let ExtractedRecord::RaceResult(r) = parse(RACE, SchemaHint::RaceResult).unwrap() else {
            panic!("wrong record type")
        };
        assert_eq!(r.date.as_deref(), Some("29 June 2024"));
        assert_eq!(r.distance.as_deref(), Some("206 km"));
        assert_eq!(r.results.len(), 3);
        assert_eq!(r.results[0].rider_name.as_deref(), Some("BARDET Romain"));
        assert_eq!(r.results[0].nationality.as_deref(), Some("FR"));
        assert_eq!(r.results[1].time.as_deref(), Some("s.t."));
        assert_eq!(r.results[2].position.as_deref(), Some("DNF"));
        assert_eq!(r.results[2].team, None);
        assert_eq!(r.race_type, None);
    }

    #[test]
    fn rider_profile_tolerates_missing_fields() {
        let html = r#"<h1>Tadej Pogačar</h1><span class="nationality">Slovenia</span>
            <span class="height">1.76 m</span><span class="wins">88</span>
            <table class="teams"><tr><td>UAE Team Emirates</td><td>2019</td><td>2024</td></tr></table>"#;
        let ExtractedRecord::RiderProfile(p) = parse(html, SchemaHint::RiderProfile).unwrap() else {
            panic!("wrong record type")
        };
        assert_eq!(p.name.as_deref(), Some("Tadej Pogačar"));
        assert_eq!(p.weight, None);
        assert_eq!(p.career.wins.as_deref(), Some("88"));
        assert_eq!(p.career.podiums, None);
        assert_eq!(p.team_history[0].start_year.as_deref(), Some("2019"));
    }

    #[test]
    fn team_page_without_roster_is_not_an_error() {
        let html = "<h1>Lidl - Trek</h1><span class=\"country\">USA</span>";
        let ExtractedRecord::TeamRoster(t) = parse(html, SchemaHint::TeamRoster).unwrap() else {
            panic!("wrong record type")
        };
        assert_eq!(t.team_name.as_deref(), Some("Lidl - Trek"));
        assert!(t.riders.is_empty());
    }

    #[test]
    fn roster_rows_without_header_use_default_order() {
        let html = r#"<h1>Team</h1><table class="roster">
            <tr><td>Mads Pedersen</td><td>DK</td><td>18/12/1995</td><td>Leader</td></tr></table>"#;
        let ExtractedRecord::TeamRoster(t) = parse(html, SchemaHint::TeamRoster).unwrap() else {
            panic!("wrong record type")
        };
        assert_eq!(t.riders[0].nationality.as_deref(), Some("DK"));
        assert_eq!(t.riders[0].role.as_deref(), Some("Leader"));
    }

    #[test]
    fn structurally_broken_input_is_rejected() {
        assert_eq!(parse("   ", SchemaHint::RaceResult).unwrap_err(), ParseError::Empty);
        assert_eq!(parse("just text", SchemaHint::RaceResult).unwrap_err(), ParseError::NotHtml);
        assert!(matches!(
            parse("<h1>x</h1><table class=\"results\"><tr><td>1</td>", SchemaHint::RaceResult),
            Err(ParseError::Unbalanced { .. })
        ));
    }

    #[test]
    fn hint_parses_aliases() {
        assert!("races".parse::<SchemaHint>().is_err());
        assert_eq!("race-results".parse::<SchemaHint>().unwrap(), SchemaHint::RaceResult);
        assert_eq!("Team".parse::<SchemaHint>().unwrap(), SchemaHint::TeamRoster);
    }
}
