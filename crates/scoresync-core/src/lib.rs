//! Core domain model and configuration value objects for scoresync.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scoresync-core";

/// Sport id assumed when a competition payload omits `sportId`.
pub const DEFAULT_SPORT_ID: i64 = 1;
/// Image version assumed for countries, competitions and sports without one.
pub const DEFAULT_IMAGE_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sport {
    pub id: i64,
    pub name: String,
    pub name_for_url: Option<String>,
    pub draw_support: bool,
    pub image_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: i64,
    pub name: String,
    pub name_for_url: Option<String>,
    pub image_version: Option<i64>,
}

/// Capability flags advertised by the upstream API for a competition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompetitionFlags {
    pub has_standings: bool,
    pub has_live_standings: bool,
    pub has_standings_groups: bool,
    pub has_brackets: bool,
    pub has_stats: bool,
    pub has_history: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: i64,
    pub country_id: Option<i64>,
    pub sport_id: i64,
    pub name: String,
    pub long_name: Option<String>,
    pub name_for_url: Option<String>,
    pub flags: CompetitionFlags,
    /// Lower is more popular; `None` sorts after every ranked competition.
    pub popularity_rank: Option<i64>,
    pub image_version: Option<i64>,
    pub current_stage_type: Option<i64>,
    pub competitors_type: Option<i64>,
    pub current_phase_num: Option<i64>,
    pub current_season_num: Option<i64>,
    pub current_stage_num: Option<i64>,
    pub is_international: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    pub competition_id: i64,
    pub season_num: i64,
    pub season_name: Option<String>,
    pub is_current: bool,
    pub teams_populated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub name_for_url: Option<String>,
    pub country_id: Option<i64>,
    /// Competition context of the most recent sync that touched this team.
    /// Overwritten on every upsert; it is not a stable "home league" fact.
    pub main_competition_id: Option<i64>,
    pub image_version: Option<i64>,
    pub is_national: bool,
}

/// Team <-> competition membership, unique on (team, competition, season).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamCompetition {
    pub team_id: i64,
    pub competition_id: i64,
    pub season_num: Option<i64>,
    pub is_active: bool,
}

/// One row of a standings table. Position and points are informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub team: Team,
    pub position: Option<i64>,
    pub points: Option<f64>,
}

/// A competition selected for a team sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub competition_id: i64,
    pub name: String,
    pub has_standings: bool,
    pub popularity_rank: Option<i64>,
    pub season_num: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    CurrentSeason,
    FullPopulation,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::CurrentSeason => "current_season",
            UpdateKind::FullPopulation => "full_population",
        }
    }
}

/// Audit record appended once per completed sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRun {
    pub run_id: Uuid,
    pub kind: UpdateKind,
    pub competitions_processed: i64,
    pub teams_updated: i64,
    pub finished_at: DateTime<Utc>,
}

/// Audit row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub update_type: String,
    pub competitions_processed: i64,
    pub teams_updated: i64,
    pub timestamp: String,
}

/// Upstream API parameters. Every request carries the same query context and headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub app_type_id: u32,
    pub lang_id: u32,
    pub timezone_name: String,
    pub user_country_id: u32,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub headers: Vec<(String, String)>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://webws.365scores.com".to_string(),
            app_type_id: 5,
            lang_id: 9,
            timezone_name: "UTC".to_string(),
            user_country_id: 331,
            user_agent: "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/138.0.0.0 Mobile Safari/537.36"
                .to_string(),
            timeout_secs: 30,
            headers: [
                ("Accept", "*/*"),
                ("Accept-Language", "en-US,en;q=0.9"),
                ("Cache-Control", "no-cache"),
                ("Pragma", "no-cache"),
                ("Origin", "https://www.365scores.com"),
                ("Referer", "https://www.365scores.com/"),
                ("Sec-Fetch-Dest", "empty"),
                ("Sec-Fetch-Mode", "cors"),
                ("Sec-Fetch-Site", "same-site"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    pub daily_batch_size: u32,
    pub population_batch_size: u32,
    pub request_interval_ms: u64,
    /// Competitions probed when the daily update starts from an empty store.
    pub seed_competition_ids: Vec<i64>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            daily_batch_size: 100,
            population_batch_size: 50,
            request_interval_ms: 1_000,
            seed_competition_ids: vec![7, 8, 13, 9, 11, 52, 102],
        }
    }
}

impl SyncPolicy {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationThresholds {
    pub min_countries: i64,
    pub min_competitions: i64,
    pub min_teams: i64,
    /// Share of teams without a country above which validation warns.
    pub max_teams_without_country_ratio: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_countries: 50,
            min_competitions: 100,
            min_teams: 1_000,
            max_teams_without_country_ratio: 0.10,
        }
    }
}
