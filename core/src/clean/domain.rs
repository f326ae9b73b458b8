use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a rider in a race.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    /// Classified finisher.
    #[default]
    Finished,
    /// Did not finish.
    Dnf,
    /// Did not start.
    Dns,
    /// Disqualified.
    Dsq,
    /// Outside time limit.
    Otl,
    /// Hors délai.
    Hd,
    /// Abandoned.
    Ab,
    /// Not placed.
    Np,
    /// Disqualified (alternate code).
    Dq,
    /// Relegated by the jury.
    Relegated,
    /// Result not yet confirmed.
    Pending,
}

impl ResultStatus {
    /// Case-insensitive lookup by name or display code; unknown input is `Finished`.
    pub fn lookup(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DNF" => ResultStatus::Dnf,
            "DNS" => ResultStatus::Dns,
            "DSQ" => ResultStatus::Dsq,
            "OTL" => ResultStatus::Otl,
            "HD" => ResultStatus::Hd,
            "AB" => ResultStatus::Ab,
            "NP" => ResultStatus::Np,
            "DQ" => ResultStatus::Dq,
            "REL" | "RELEGATED" => ResultStatus::Relegated,
            "PND" | "PENDING" => ResultStatus::Pending,
            _ => ResultStatus::Finished,
        }
    }

    /// Whether `raw` names a known non-finished status.
    pub fn is_code(raw: &str) -> bool {
        let upper = raw.trim().to_ascii_uppercase();
        !matches!(upper.as_str(), "" | "FIN" | "FINISHED") && ResultStatus::lookup(&upper) != ResultStatus::Finished
    }

    /// Short code shown in result tables.
    pub fn display_code(&self) -> &'static str {
        match self {
            ResultStatus::Finished => "FIN",
            ResultStatus::Dnf => "DNF",
            ResultStatus::Dns => "DNS",
            ResultStatus::Dsq => "DSQ",
            ResultStatus::Otl => "OTL",
            ResultStatus::Hd => "HD",
            ResultStatus::Ab => "AB",
            ResultStatus::Np => "NP",
            ResultStatus::Dq => "DQ",
            ResultStatus::Relegated => "REL",
            ResultStatus::Pending => "PND",
        }
    }

    /// Counts in the general classification.
    pub fn is_finisher(&self) -> bool {
        matches!(self, ResultStatus::Finished | ResultStatus::Relegated)
    }

    /// Left the race without a classified finish.
    pub fn did_not_finish(&self) -> bool {
        matches!(
            self,
            ResultStatus::Dnf | ResultStatus::Dns | ResultStatus::Otl | ResultStatus::Hd | ResultStatus::Ab
        )
    }

    /// Removed by the jury.
    pub fn was_disqualified(&self) -> bool {
        matches!(self, ResultStatus::Dsq | ResultStatus::Dq)
    }

    /// Sort key placing finishers first and non-starters last.
    pub fn sorting_priority(&self) -> u8 {
        match self {
            ResultStatus::Finished => 1,
            ResultStatus::Relegated => 2,
            ResultStatus::Pending => 3,
            ResultStatus::Otl | ResultStatus::Hd => 4,
            ResultStatus::Dnf | ResultStatus::Ab => 5,
            ResultStatus::Np => 6,
            ResultStatus::Dsq | ResultStatus::Dq => 7,
            ResultStatus::Dns => 8,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_code())
    }
}

/// UCI team registration level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamCategory {
    /// UCI WorldTeam.
    WorldTour,
    /// UCI ProTeam.
    ProTeam,
    /// UCI Continental team.
    #[default]
    Continental,
    /// National selection.
    National,
    /// Development squad.
    Development,
    /// Amateur team.
    Amateur,
    /// Club team.
    Club,
}

impl TeamCategory {
    /// Lenient lookup over the labels sites use; unknown input is `Continental`.
    pub fn lookup(raw: &str) -> Self {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let key = key.strip_prefix("uci").unwrap_or(&key);
        match key {
            "worldtour" | "worldteam" | "wt" => TeamCategory::WorldTour,
            "proteam" | "procontinental" | "pt" | "prt" => TeamCategory::ProTeam,
            "national" | "nationalteam" => TeamCategory::National,
            "development" | "developmentteam" | "devo" => TeamCategory::Development,
            "amateur" => TeamCategory::Amateur,
            "club" => TeamCategory::Club,
            _ => TeamCategory::Continental,
        }
    }

    /// Wire name used by the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamCategory::WorldTour => "WORLD_TOUR",
            TeamCategory::ProTeam => "PRO_TEAM",
            TeamCategory::Continental => "CONTINENTAL",
            TeamCategory::National => "NATIONAL",
            TeamCategory::Development => "DEVELOPMENT",
            TeamCategory::Amateur => "AMATEUR",
            TeamCategory::Club => "CLUB",
        }
    }
}

impl fmt::Display for TeamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rider specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Specialization {
    /// Sprinter.
    Sprinter,
    /// Climber.
    Climber,
    /// Time trialist.
    TimeTrialist,
    /// All-rounder / GC rider.
    AllRounder,
    /// Domestique.
    Domestique,
    /// Classics specialist.
    ClassicsSpecialist,
    /// Breakaway specialist.
    BreakawaySpecialist,
    /// Puncheur.
    Puncheur,
}

impl Specialization {
    /// Lenient lookup; `None` for labels that match nothing.
    pub fn lookup(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_lowercase();
        Some(match key.as_str() {
            "sprinter" | "sprint" => Specialization::Sprinter,
            "climber" | "climbing" => Specialization::Climber,
            "timetrialist" | "timetrial" | "tt" => Specialization::TimeTrialist,
            "allrounder" | "gc" | "gcrider" => Specialization::AllRounder,
            "domestique" | "helper" => Specialization::Domestique,
            "classicsspecialist" | "classics" | "oneday" | "onedayraces" => Specialization::ClassicsSpecialist,
            "breakawayspecialist" | "breakaway" => Specialization::BreakawaySpecialist,
            "puncheur" | "hills" => Specialization::Puncheur,
            _ => return None,
        })
    }

    /// Wire name used by the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialization::Sprinter => "SPRINTER",
            Specialization::Climber => "CLIMBER",
            Specialization::TimeTrialist => "TIME_TRIALIST",
            Specialization::AllRounder => "ALL_ROUNDER",
            Specialization::Domestique => "DOMESTIQUE",
            Specialization::ClassicsSpecialist => "CLASSICS_SPECIALIST",
            Specialization::BreakawaySpecialist => "BREAKAWAY_SPECIALIST",
            Specialization::Puncheur => "PUNCHEUR",
        }
    }
}
