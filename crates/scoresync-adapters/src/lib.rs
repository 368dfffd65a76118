//! Upstream sports API access: payload decoding, standings extraction, HTTP and
//! fixture-backed sources, and request pacing.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use scoresync_core::{
    ApiConfig, Competition, CompetitionFlags, Country, Sport, StandingEntry, Team,
    DEFAULT_IMAGE_VERSION, DEFAULT_SPORT_ID,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "scoresync-adapters";

// Absent and `null` collapse to the field's default. List entries that fail to
// decode are dropped instead of failing the whole payload.

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(lenient_optional_list(deserializer)?.unwrap_or_default())
}

fn lenient_optional_list<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Vec<JsonValue>>::deserialize(deserializer)?;
    Ok(raw.map(|items| {
        items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect()
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SportPayload {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(rename = "nameForURL")]
    pub name_for_url: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub draw_support: bool,
    pub image_version: Option<i64>,
}

impl SportPayload {
    pub fn to_sport(&self) -> Option<Sport> {
        Some(Sport {
            id: self.id?,
            name: self.name.clone().unwrap_or_default(),
            name_for_url: self.name_for_url.clone(),
            draw_support: self.draw_support,
            image_version: self.image_version.or(Some(DEFAULT_IMAGE_VERSION)),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CountryPayload {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(rename = "nameForURL")]
    pub name_for_url: Option<String>,
    pub image_version: Option<i64>,
}

impl CountryPayload {
    pub fn to_country(&self) -> Option<Country> {
        Some(Country {
            id: self.id?,
            name: self.name.clone().unwrap_or_default(),
            name_for_url: self.name_for_url.clone(),
            image_version: self.image_version.or(Some(DEFAULT_IMAGE_VERSION)),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompetitionPayload {
    pub id: Option<i64>,
    pub country_id: Option<i64>,
    pub sport_id: Option<i64>,
    pub name: Option<String>,
    pub long_name: Option<String>,
    #[serde(rename = "nameForURL")]
    pub name_for_url: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub has_standings: bool,
    #[serde(deserialize_with = "nullable")]
    pub has_live_standings: bool,
    #[serde(deserialize_with = "nullable")]
    pub has_standings_groups: bool,
    #[serde(deserialize_with = "nullable")]
    pub has_brackets: bool,
    #[serde(deserialize_with = "nullable")]
    pub has_stats: bool,
    #[serde(deserialize_with = "nullable")]
    pub has_history: bool,
    pub popularity_rank: Option<i64>,
    pub image_version: Option<i64>,
    pub current_stage_type: Option<i64>,
    pub competitors_type: Option<i64>,
    pub current_phase_num: Option<i64>,
    pub current_season_num: Option<i64>,
    pub current_stage_num: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub is_international: bool,
}

impl CompetitionPayload {
    pub fn to_competition(&self) -> Option<Competition> {
        Some(Competition {
            id: self.id?,
            country_id: self.country_id,
            sport_id: self.sport_id.unwrap_or(DEFAULT_SPORT_ID),
            name: self.name.clone().unwrap_or_default(),
            long_name: self.long_name.clone(),
            name_for_url: self.name_for_url.clone(),
            flags: CompetitionFlags {
                has_standings: self.has_standings,
                has_live_standings: self.has_live_standings,
                has_standings_groups: self.has_standings_groups,
                has_brackets: self.has_brackets,
                has_stats: self.has_stats,
                has_history: self.has_history,
            },
            popularity_rank: self.popularity_rank,
            image_version: self.image_version.or(Some(DEFAULT_IMAGE_VERSION)),
            current_stage_type: self.current_stage_type,
            competitors_type: self.competitors_type,
            current_phase_num: self.current_phase_num,
            current_season_num: self.current_season_num,
            current_stage_num: self.current_stage_num,
            is_international: self.is_international,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompetitorPayload {
    pub id: Option<i64>,
    pub name: Option<String>,
    #[serde(rename = "nameForURL")]
    pub name_for_url: Option<String>,
    pub country_id: Option<i64>,
    pub image_version: Option<i64>,
    #[serde(deserialize_with = "nullable")]
    pub is_national: bool,
}

impl CompetitorPayload {
    /// Team row for this competitor, attributed to the competition being synced.
    pub fn to_team(&self, competition_id: i64) -> Option<Team> {
        Some(Team {
            id: self.id?,
            name: self.name.clone().unwrap_or_default(),
            name_for_url: self.name_for_url.clone(),
            country_id: self.country_id,
            main_competition_id: Some(competition_id),
            image_version: self.image_version,
            is_national: self.is_national,
        })
    }
}

/// `GET /web/competitions/` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompetitionsPayload {
    #[serde(deserialize_with = "lenient_list")]
    pub sports: Vec<SportPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub countries: Vec<CountryPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub competitions: Vec<CompetitionPayload>,
}

impl CompetitionsPayload {
    pub fn sports(&self) -> Vec<Sport> {
        self.sports.iter().filter_map(SportPayload::to_sport).collect()
    }

    pub fn countries(&self) -> Vec<Country> {
        self.countries.iter().filter_map(CountryPayload::to_country).collect()
    }

    pub fn competitions(&self) -> Vec<Competition> {
        self.competitions
            .iter()
            .filter_map(CompetitionPayload::to_competition)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StandingsRow {
    pub competitor: Option<CompetitorPayload>,
    pub position: Option<i64>,
    pub points: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StandingsTable {
    #[serde(deserialize_with = "lenient_optional_list")]
    pub rows: Option<Vec<StandingsRow>>,
}

/// `GET /web/standings/?competitions=<id>` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StandingsPayload {
    #[serde(deserialize_with = "lenient_list")]
    pub countries: Vec<CountryPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub competitions: Vec<CompetitionPayload>,
    #[serde(deserialize_with = "lenient_optional_list")]
    pub standings: Option<Vec<StandingsTable>>,
}

impl StandingsPayload {
    /// The competition this payload describes, keyed by the id it was requested
    /// under. `None` when the upstream did not include one or it has no name.
    pub fn competition(&self, competition_id: i64) -> Option<Competition> {
        let mut described = self.competitions.first()?.clone();
        described.id = Some(competition_id);
        described.to_competition()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("payload has no standings tables")]
    MissingStandings,
    #[error("standings tables carry no rows")]
    MissingRows,
}

/// One entry per distinct competitor across every standings table of the payload.
pub fn extract_standings(
    payload: &StandingsPayload,
    competition_id: i64,
) -> Result<Vec<StandingEntry>, ShapeError> {
    let tables = match payload.standings.as_deref() {
        Some(tables) if !tables.is_empty() => tables,
        _ => return Err(ShapeError::MissingStandings),
    };
    if tables.iter().all(|t| t.rows.is_none()) {
        return Err(ShapeError::MissingRows);
    }

    let mut seen = HashSet::new();
    let entries = tables
        .iter()
        .filter_map(|t| t.rows.as_deref())
        .flatten()
        .filter_map(|row| {
            let team = row.competitor.as_ref()?.to_team(competition_id)?;
            seen.insert(team.id).then(|| StandingEntry {
                team,
                position: row.position,
                points: row.points,
            })
        })
        .collect();
    Ok(entries)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read side of the upstream API. Every failure is soft: callers get `None`.
#[async_trait]
pub trait SportsApi: Send + Sync {
    async fn competitions(&self) -> Option<CompetitionsPayload>;

    async fn standings(&self, competition_id: i64) -> Option<StandingsPayload>;
}

fn decode_payload<T: DeserializeOwned>(value: JsonValue, what: &str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(payload = what, error = %err, "payload does not match expected shape");
            None
        }
    }
}

#[derive(Debug)]
pub struct HttpSportsApi {
    client: reqwest::Client,
    config: ApiConfig,
    competitions_url: Url,
    standings_url: Url,
}

impl HttpSportsApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing api base url {}", config.base_url))?;
        let competitions_url = base
            .join("/web/competitions/")
            .context("building competitions endpoint")?;
        let standings_url = base
            .join("/web/standings/")
            .context("building standings endpoint")?;

        Ok(Self {
            client,
            config,
            competitions_url,
            standings_url,
        })
    }

    fn with_context_params(&self, endpoint: &Url, extra: &[(&str, String)]) -> Url {
        let mut url = endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("appTypeId", &self.config.app_type_id.to_string())
                .append_pair("langId", &self.config.lang_id.to_string())
                .append_pair("timezoneName", &self.config.timezone_name)
                .append_pair("userCountryId", &self.config.user_country_id.to_string());
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        url
    }

    pub fn competitions_url(&self) -> Url {
        self.with_context_params(&self.competitions_url, &[])
    }

    pub fn standings_url(&self, competition_id: i64) -> Url {
        self.with_context_params(
            &self.standings_url,
            &[
                ("competitions", competition_id.to_string()),
                ("live", "false".to_string()),
            ],
        )
    }

    /// GET `url` and parse the body as JSON. Non-200 statuses, transport errors and
    /// invalid JSON are logged and reported as `None`.
    pub async fn fetch_json(&self, url: &Url) -> Option<JsonValue> {
        let span = info_span!("http_fetch", url = %url);
        match self.try_fetch_json(url).instrument(span).await {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url = %url, error = %err, "upstream fetch failed");
                None
            }
        }
    }

    async fn try_fetch_json(&self, url: &Url) -> Result<JsonValue, FetchError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "upstream response received");
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl SportsApi for HttpSportsApi {
    async fn competitions(&self) -> Option<CompetitionsPayload> {
        let value = self.fetch_json(&self.competitions_url()).await?;
        decode_payload(value, "competitions")
    }

    async fn standings(&self, competition_id: i64) -> Option<StandingsPayload> {
        let value = self.fetch_json(&self.standings_url(competition_id)).await?;
        decode_payload(value, "standings")
    }
}

/// Replays captured upstream responses from disk:
/// `<root>/competitions.json` and `<root>/standings/<competition_id>.json`.
#[derive(Debug, Clone)]
pub struct FixtureSportsApi {
    root: PathBuf,
}

impl FixtureSportsApi {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn load<T: DeserializeOwned>(&self, path: PathBuf) -> Option<T> {
        match read_json_file(&path) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "fixture unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl SportsApi for FixtureSportsApi {
    async fn competitions(&self) -> Option<CompetitionsPayload> {
        self.load(self.root.join("competitions.json"))
    }

    async fn standings(&self, competition_id: i64) -> Option<StandingsPayload> {
        self.load(
            self.root
                .join("standings")
                .join(format!("{competition_id}.json")),
        )
    }
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Pacing applied before each upstream request.
#[async_trait]
pub trait RateGate: Send + Sync {
    async fn ready(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

#[async_trait]
impl RateGate for Unthrottled {
    async fn ready(&self) {}
}

/// Spaces consecutive requests at least `interval` apart. The first request is not delayed.
#[derive(Debug)]
pub struct FixedIntervalGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FixedIntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RateGate for FixedIntervalGate {
    async fn ready(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let due = previous + self.interval;
            if due > Instant::now() {
                tokio::time::sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .join("api")
    }

    fn standings_from(value: JsonValue) -> StandingsPayload {
        serde_json::from_value(value).expect("standings payload")
    }

    #[test]
    fn competitions_fixture_decodes_with_defaults() {
        let payload: CompetitionsPayload =
            read_json_file(fixtures_root().join("competitions.json")).unwrap();

        let countries = payload.countries();
        assert_eq!(countries.len(), 2);
        assert_eq!(countries[0].name_for_url.as_deref(), Some("england"));

        let competitions = payload.competitions();
        assert_eq!(competitions.len(), 1);
        let premier = &competitions[0];
        assert!(premier.flags.has_standings);
        assert!(!premier.flags.has_history);
        assert_eq!(premier.sport_id, DEFAULT_SPORT_ID);
        assert_eq!(premier.current_season_num, Some(2025));

        assert_eq!(payload.sports().len(), 1);
    }

    #[test]
    fn missing_fields_fall_back_to_enumerated_defaults() {
        let payload: CompetitionsPayload = serde_json::from_value(json!({
            "countries": [{ "id": 9 }, { "name": "no id" }],
            "competitions": [{ "id": 3, "hasStandings": null, "popularityRank": null }],
            "sports": null
        }))
        .unwrap();

        let countries = payload.countries();
        assert_eq!(countries.len(), 1);
        assert_eq!(countries[0].name, "");
        assert_eq!(countries[0].image_version, Some(DEFAULT_IMAGE_VERSION));

        let competition = &payload.competitions()[0];
        assert!(!competition.flags.has_standings);
        assert_eq!(competition.popularity_rank, None);
        assert_eq!(competition.country_id, None);
        assert!(payload.sports().is_empty());
    }

    #[test]
    fn malformed_list_entries_are_dropped() {
        let payload: CompetitionsPayload = serde_json::from_value(json!({
            "countries": [{ "id": "not-a-number" }, { "id": 2, "name": "Spain" }]
        }))
        .unwrap();
        let countries = payload.countries();
        assert_eq!(countries.len(), 1);
        assert_eq!(countries[0].id, 2);
    }

    #[test]
    fn extraction_reports_missing_standings_and_rows() {
        let no_standings = standings_from(json!({ "competitions": [] }));
        assert_eq!(extract_standings(&no_standings, 7), Err(ShapeError::MissingStandings));

        let empty_standings = standings_from(json!({ "standings": [] }));
        assert_eq!(extract_standings(&empty_standings, 7), Err(ShapeError::MissingStandings));

        let no_rows = standings_from(json!({ "standings": [{ "group": 1 }] }));
        assert_eq!(extract_standings(&no_rows, 7), Err(ShapeError::MissingRows));
    }

    #[test]
    fn extraction_reads_every_table_once_per_team() {
        let payload = standings_from(json!({
            "standings": [
                { "rows": [
                    { "competitor": { "id": 1, "name": "A", "countryId": 1 }, "position": 1, "points": 9 },
                    { "competitor": { "name": "no id" }, "position": 2 },
                    { "position": 3 }
                ]},
                { "rows": [
                    { "competitor": { "id": 2, "name": "B", "isNational": true }, "position": 1, "points": 7.5 },
                    { "competitor": { "id": 1, "name": "A" }, "position": 2 }
                ]}
            ]
        }));

        let entries = extract_standings(&payload, 52).unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.team.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(entries[0].team.main_competition_id, Some(52));
        assert_eq!(entries[0].team.country_id, Some(1));
        assert_eq!(entries[0].points, Some(9.0));
        assert!(entries[1].team.is_national);
        assert_eq!(entries[1].team.image_version, None);
    }

    #[test]
    fn standings_urls_carry_fixed_query_context() {
        let api = HttpSportsApi::new(ApiConfig::default()).unwrap();
        let url = api.standings_url(7);
        assert_eq!(url.path(), "/web/standings/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        for expected in [
            ("appTypeId", "5"),
            ("langId", "9"),
            ("timezoneName", "UTC"),
            ("userCountryId", "331"),
            ("competitions", "7"),
            ("live", "false"),
        ] {
            assert!(
                pairs.iter().any(|(k, v)| k == expected.0 && v == expected.1),
                "missing {expected:?}"
            );
        }
        assert_eq!(api.competitions_url().path(), "/web/competitions/");
    }

    #[test]
    fn invalid_base_url_is_rejected_at_construction() {
        let config = ApiConfig {
            base_url: "not a url".into(),
            ..ApiConfig::default()
        };
        assert!(HttpSportsApi::new(config).is_err());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_soft_failure() {
        let api = HttpSportsApi::new(ApiConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout_secs: 2,
            ..ApiConfig::default()
        })
        .unwrap();
        assert!(api.standings(7).await.is_none());
        assert!(api.competitions().await.is_none());
    }

    #[tokio::test]
    async fn fixture_api_replays_captured_payloads() {
        let api = FixtureSportsApi::new(fixtures_root());
        let standings = api.standings(7).await.expect("fixture for 7");
        assert_eq!(extract_standings(&standings, 7).unwrap().len(), 3);
        assert_eq!(standings.competition(7).map(|c| c.name), Some("Premier League".to_string()));
        assert!(api.standings(999_999).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_interval_gate_spaces_requests() {
        let gate = FixedIntervalGate::new(Duration::from_secs(1));
        let start = Instant::now();
        gate.ready().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        gate.ready().await;
        gate.ready().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
