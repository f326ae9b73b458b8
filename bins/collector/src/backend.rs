use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pelo_core::cfg::BackendConfig;
use pelo_core::clean::{
    remove_diacritics, standardize_rider_name, CleanedRecord, RiderProfile, RosterEntry, Specialization,
    TeamCategory, TeamRoster, COUNTRY_LEN, PERSON_NAME_LEN, TEAM_NAME_LEN,
};
use pelo_core::extract::SchemaHint;
use pelo_core::recovery::ErrorRecoveryManager;

const UNKNOWN_COUNTRY: &str = "Unknown";
const UNKNOWN_NATIONALITY: &str = "Unknown";

/// Where cleaned records go once a scrape succeeds.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn store(&self, record: &CleanedRecord) -> Result<StoreReport>;
}

/// Per-record tally. Item failures are counted here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub backed_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Created,
    Updated,
}

impl StoreReport {
    fn record(&mut self, outcome: Result<Upsert>, what: &str) {
        match outcome {
            Ok(Upsert::Created) => self.created += 1,
            Ok(Upsert::Updated) => self.updated += 1,
            Err(e) => {
                warn!(item = what, error = %format!("{e:#}"), "backend write failed");
                self.failed += 1;
            }
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn len_ok(s: &str, (min, max): (usize, usize)) -> bool {
    (min..=max).contains(&s.chars().count())
}

/// Team body with the backend's required fields filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPayload {
    pub name: String,
    pub country: String,
    pub category: TeamCategory,
    pub active: bool,
}

impl TeamPayload {
    /// `None` when the roster has no usable team name.
    pub fn from_roster(roster: &TeamRoster) -> Option<Self> {
        let name = roster.team_name.as_deref().map(str::trim).filter(|n| n.chars().count() >= TEAM_NAME_LEN.0)?;
        let country = roster
            .country
            .as_deref()
            .map(str::trim)
            .filter(|c| c.chars().count() >= COUNTRY_LEN.0)
            .map(|c| clip(c, COUNTRY_LEN.1))
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        Some(Self { name: clip(name, TEAM_NAME_LEN.1), country, category: roster.category, active: true })
    }
}

/// Rider body. Date of birth and team are required by the backend and have
/// no sensible fallback, so riders without them are skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderPayload {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub date_of_birth: NaiveDate,
    pub nationality: String,
    pub team: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialization: Option<Specialization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<u32>,
}

fn slug(s: &str) -> String {
    remove_diacritics(s)
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

impl RiderPayload {
    fn base(
        first: &str,
        last: &str,
        dob: Option<NaiveDate>,
        nationality: Option<&str>,
        team: Option<&str>,
    ) -> Option<Self> {
        if !len_ok(first, PERSON_NAME_LEN) || !len_ok(last, PERSON_NAME_LEN) {
            return None;
        }
        let team = team.map(str::trim).filter(|t| !t.is_empty())?;
        Some(Self {
            first_name: first.to_string(),
            last_name: last.to_string(),
            // The backend keys riders by a unique email; scraped riders get a
            // stable placeholder.
            email: format!("{}.{}@riders.invalid", slug(first), slug(last)),
            date_of_birth: dob?,
            nationality: nationality.map(str::trim).filter(|n| !n.is_empty()).unwrap_or(UNKNOWN_NATIONALITY).to_string(),
            team: clip(team, TEAM_NAME_LEN.1),
            specialization: None,
            height_cm: None,
            weight_kg: None,
        })
    }

    pub fn from_profile(p: &RiderProfile) -> Option<Self> {
        let mut payload =
            Self::base(&p.first_name, &p.last_name, p.date_of_birth, p.nationality.as_deref(), p.team.as_deref())?;
        payload.specialization = p.specialization;
        payload.height_cm = p.height_cm;
        payload.weight_kg = p.weight_kg.map(|w| w.round() as u32);
        Some(payload)
    }

    pub fn from_roster_entry(entry: &RosterEntry, team: &str) -> Option<Self> {
        let name = standardize_rider_name(entry.name.as_deref()?)?;
        Self::base(&name.first, &name.last, entry.date_of_birth, entry.nationality.as_deref(), Some(team))
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Existing {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

/// Client for the backend REST API (`/teams`, `/riders`). Race results have
/// no endpoint and are kept as local backups instead.
pub struct BackendClient {
    http: reqwest::Client,
    base: Url,
    recovery: Arc<ErrorRecoveryManager>,
}

impl BackendClient {
    pub fn new(cfg: &BackendConfig, recovery: Arc<ErrorRecoveryManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("build backend http client")?;
        let base = Url::parse(&cfg.base_url).with_context(|| format!("parse backend url {}", cfg.base_url))?;
        Ok(Self { http, base, recovery })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("backend url {} cannot take a path", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn upsert_team(&self, team: &TeamPayload) -> Result<Upsert> {
        let lookup = self.http.get(self.endpoint(&["teams", "name", &team.name])?).send().await.context("look up team")?;
        match lookup.status() {
            StatusCode::NOT_FOUND => {
                self.http
                    .post(self.endpoint(&["teams"])?)
                    .json(team)
                    .send()
                    .await?
                    .error_for_status()
                    .context("create team")?;
                Ok(Upsert::Created)
            }
            s if s.is_success() => {
                let existing: Existing = lookup.json().await.context("decode team")?;
                self.http
                    .put(self.endpoint(&["teams", &existing.id.to_string()])?)
                    .json(team)
                    .send()
                    .await?
                    .error_for_status()
                    .context("update team")?;
                Ok(Upsert::Updated)
            }
            s => Err(anyhow!("team lookup returned {s}")),
        }
    }

    async fn upsert_rider(&self, rider: &RiderPayload) -> Result<Upsert> {
        let mut search = self.endpoint(&["riders", "search"])?;
        search.query_pairs_mut().append_pair("name", &rider.full_name());
        let found: Vec<Existing> = self
            .http
            .get(search)
            .send()
            .await?
            .error_for_status()
            .context("search riders")?
            .json()
            .await
            .context("decode rider search")?;
        let same = |a: &Option<String>, b: &str| a.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(b));
        let existing = found.iter().find(|e| same(&e.first_name, &rider.first_name) && same(&e.last_name, &rider.last_name));

        let req = match existing {
            Some(e) => self.http.put(self.endpoint(&["riders", &e.id.to_string()])?),
            None => self.http.post(self.endpoint(&["riders"])?),
        };
        req.json(rider).send().await?.error_for_status().context("write rider")?;
        Ok(if existing.is_some() { Upsert::Updated } else { Upsert::Created })
    }

    async fn store_roster(&self, roster: &TeamRoster, report: &mut StoreReport) {
        let Some(team) = TeamPayload::from_roster(roster) else {
            warn!("roster without a usable team name, skipping");
            report.skipped += 1 + roster.riders.len();
            return;
        };
        report.record(self.upsert_team(&team).await, &team.name);
        for entry in &roster.riders {
            match RiderPayload::from_roster_entry(entry, &team.name) {
                Some(rider) => {
                    let name = rider.full_name();
                    report.record(self.upsert_rider(&rider).await, &name);
                }
                None => {
                    debug!(rider = ?entry.name, "roster entry missing required fields, skipping");
                    report.skipped += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Sink for BackendClient {
    async fn store(&self, record: &CleanedRecord) -> Result<StoreReport> {
        let mut report = StoreReport::default();
        match record {
            CleanedRecord::RaceResult(c) => {
                let backup = self.recovery.create_backup(SchemaHint::RaceResult.as_str(), serde_json::to_value(record)?)?;
                report.backed_up = true;
                info!(backup = %backup.id, race = ?c.record.race_name, rows = c.record.results.len(), "race result kept as backup");
            }
            CleanedRecord::RiderProfile(c) => match RiderPayload::from_profile(&c.record) {
                Some(rider) => {
                    let name = rider.full_name();
                    report.record(self.upsert_rider(&rider).await, &name);
                }
                None => {
                    warn!(rider = ?c.record.name, "profile missing required fields, skipping");
                    report.skipped += 1;
                }
            },
            CleanedRecord::TeamRoster(c) => self.store_roster(&c.record, &mut report).await,
        }
        info!(
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "record stored"
        );
        Ok(report)
    }
}

/// Sink used when the backend is disabled: logs what would have been sent.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn store(&self, record: &CleanedRecord) -> Result<StoreReport> {
        info!(
            quality = record.quality_score(),
            valid = record.validation().is_valid,
            "backend disabled, record not sent"
        );
        Ok(StoreReport { skipped: 1, ..StoreReport::default() })
    }
}

pub fn sink_from_config(cfg: &BackendConfig, recovery: Arc<ErrorRecoveryManager>) -> Result<Arc<dyn Sink>> {
    if cfg.enabled {
        Ok(Arc::new(BackendClient::new(cfg, recovery)?))
    } else {
        Ok(Arc::new(LogSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pelo_core::cfg::RecoveryConfig;
    use pelo_core::clean::{clean_race_result, clean_team_roster};
    use pelo_core::extract::{RawRaceResult, RawResultRow, RawRosterEntry, RawTeamRoster};
    use pelo_core::store::open_default;

    fn roster(name: Option<&str>, country: Option<&str>) -> TeamRoster {
        TeamRoster {
            team_name: name.map(str::to_string),
            country: country.map(str::to_string),
            ..TeamRoster::default()
        }
    }

    #[test]
    fn team_payload_applies_fallbacks() {
        let t = TeamPayload::from_roster(&roster(Some("UAE Team Emirates"), None)).unwrap();
        assert_eq!(t.country, "Unknown");
        assert_eq!(t.category, TeamCategory::Continental);

        let long = "x".repeat(140);
        let t = TeamPayload::from_roster(&roster(Some(&long), Some("Belgium"))).unwrap();
        assert_eq!(t.name.chars().count(), 100);
        assert_eq!(t.country, "Belgium");

        assert!(TeamPayload::from_roster(&roster(Some("X"), None)).is_none());
        assert!(TeamPayload::from_roster(&roster(None, None)).is_none());
    }

    #[test]
    fn rider_payload_requires_birth_date_and_team() {
        let entry = RosterEntry {
            name: Some("POGAČAR Tadej".into()),
            nationality: Some("SI".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1998, 9, 21),
            role: None,
        };
        let r = RiderPayload::from_roster_entry(&entry, "UAE Team Emirates").unwrap();
        assert_eq!((r.first_name.as_str(), r.last_name.as_str()), ("Tadej", "Pogacar"));
        assert_eq!(r.email, "tadej.pogacar@riders.invalid");
        assert_eq!(r.team, "UAE Team Emirates");

        let no_dob = RosterEntry { date_of_birth: None, ..entry.clone() };
        assert!(RiderPayload::from_roster_entry(&no_dob, "UAE Team Emirates").is_none());
        assert!(RiderPayload::from_roster_entry(&entry, "  ").is_none());

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["dateOfBirth"], "1998-09-21");
        assert!(json.get("heightCm").is_none());
    }

    #[test]
    fn profile_payload_rounds_weight() {
        let p = RiderProfile {
            name: Some("Wout van Aert".into()),
            first_name: "Wout".into(),
            last_name: "van Aert".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1994, 9, 15),
            team: Some("Visma".into()),
            weight_kg: Some(77.6),
            height_cm: Some(190),
            ..RiderProfile::default()
        };
        let r = RiderPayload::from_profile(&p).unwrap();
        assert_eq!(r.weight_kg, Some(78));
        assert_eq!(r.nationality, "Unknown");
        assert_eq!(r.email, "wout.van-aert@riders.invalid");
    }

    #[tokio::test]
    async fn race_results_are_backed_up_locally() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), open_default(dir.path()).unwrap()));
        let cfg = BackendConfig { base_url: "http://127.0.0.1:9/api".into(), ..BackendConfig::default() };
        let client = BackendClient::new(&cfg, recovery.clone()).unwrap();

        let raw = RawRaceResult {
            race_name: Some("Tour de France".into()),
            date: Some("2024-07-21".into()),
            results: vec![RawResultRow { position: Some("1".into()), rider_name: Some("Tadej Pogacar".into()), ..RawResultRow::default() }],
            ..RawRaceResult::default()
        };
        let record = CleanedRecord::RaceResult(clean_race_result(&raw));
        let report = client.store(&record).await.unwrap();
        assert!(report.backed_up);
        let backup = recovery.latest_backup("race-result").unwrap().unwrap();
        assert_eq!(backup.payload["type"], "race-result");
        assert_eq!(backup.payload["record"]["raceName"], "Tour de France");
    }

    #[tokio::test]
    async fn unreachable_backend_counts_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = Arc::new(ErrorRecoveryManager::new(RecoveryConfig::default(), open_default(dir.path()).unwrap()));
        let cfg = BackendConfig { base_url: "http://127.0.0.1:9/api".into(), timeout_ms: 500, ..BackendConfig::default() };
        let client = BackendClient::new(&cfg, recovery).unwrap();

        let raw = RawTeamRoster {
            team_name: Some("Lidl-Trek".into()),
            riders: vec![
                RawRosterEntry { name: Some("Mads Pedersen".into()), date_of_birth: Some("1995-12-18".into()), ..RawRosterEntry::default() },
                RawRosterEntry { name: Some("Nobody".into()), ..RawRosterEntry::default() },
            ],
            ..RawTeamRoster::default()
        };
        let record = CleanedRecord::TeamRoster(clean_team_roster(&raw));
        let report = client.store(&record).await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.created + report.updated, 0);
    }

    #[tokio::test]
    async fn disabled_backend_only_logs() {
        let record = CleanedRecord::TeamRoster(clean_team_roster(&RawTeamRoster::default()));
        let report = LogSink.store(&record).await.unwrap();
        assert_eq!(report.skipped, 1);
    }
}
