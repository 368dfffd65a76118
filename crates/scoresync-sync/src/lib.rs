//! Synchronization driver: pulls upstream listings and standings into the store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scoresync_adapters::{
    extract_standings, FixedIntervalGate, FixtureSportsApi, HttpSportsApi, RateGate, ShapeError,
    SportsApi, StandingsPayload, Unthrottled,
};
use scoresync_core::{
    ApiConfig, SyncPolicy, SyncTarget, Team, UpdateKind, UpdateRun, ValidationThresholds,
};
use scoresync_storage::{Store, Table};
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod report;
pub mod validate;

pub use report::DatabaseReport;
pub use validate::{CheckStatus, ValidationReport};

pub const CRATE_NAME: &str = "scoresync-sync";

pub const DEFAULT_DB_PATH: &str = "./db/soccer_data.db";

/// Optional YAML overrides. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub api: ApiConfig,
    pub policy: SyncPolicy,
    pub thresholds: ValidationThresholds,
}

impl ConfigFile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("parsing scoresync config yaml")
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading config {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub api: ApiConfig,
    pub policy: SyncPolicy,
    pub thresholds: ValidationThresholds,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            api: ApiConfig::default(),
            policy: SyncPolicy::default(),
            thresholds: ValidationThresholds::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the YAML file (`config_file` or `SCORESYNC_CONFIG`), then
    /// individual environment overrides.
    pub fn from_env(config_file: Option<&Path>) -> Result<Self> {
        let file = config_file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("SCORESYNC_CONFIG").ok().map(PathBuf::from));
        let base = match file {
            Some(path) => Self::from_file(ConfigFile::read(&path)?),
            None => Self::default(),
        };
        Ok(base.with_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(file: ConfigFile) -> Self {
        Self {
            api: file.api,
            policy: file.policy,
            thresholds: file.thresholds,
            ..Self::default()
        }
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("SCORESYNC_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(base) = lookup("SCORESYNC_API_BASE") {
            self.api.base_url = base;
        }
        if let Some(secs) = lookup("SCORESYNC_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.api.timeout_secs = secs;
        }
        if let Some(ms) = lookup("SCORESYNC_REQUEST_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.policy.request_interval_ms = ms;
        }
        self
    }
}

/// What happened to one competition during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetitionOutcome {
    Updated { teams: usize },
    /// Competition does not advertise standings; no request was made.
    NoStandings,
    /// Fetch failed or the body did not decode.
    Unavailable,
    Malformed(ShapeError),
    /// Standings rows present but none carried a competitor id.
    NoTeams,
}

impl CompetitionOutcome {
    pub fn teams(&self) -> usize {
        match self {
            CompetitionOutcome::Updated { teams } => *teams,
            _ => 0,
        }
    }

    pub fn is_soft_failure(&self) -> bool {
        matches!(
            self,
            CompetitionOutcome::Unavailable
                | CompetitionOutcome::Malformed(_)
                | CompetitionOutcome::NoTeams
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompetitionResult {
    pub competition_id: i64,
    pub outcome: CompetitionOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: UpdateKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sports_upserted: usize,
    pub countries_upserted: usize,
    pub competitions_upserted: usize,
    /// Per-competition results in processing order.
    pub results: Vec<CompetitionResult>,
}

impl SyncRunSummary {
    pub fn competitions_considered(&self) -> usize {
        self.results.len()
    }

    /// Competitions that yielded at least one team.
    pub fn competitions_updated(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.teams() > 0).count()
    }

    pub fn teams_updated(&self) -> usize {
        self.results.iter().map(|r| r.outcome.teams()).sum()
    }

    pub fn soft_failures(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_soft_failure()).count()
    }
}

#[derive(Debug, Default)]
struct RunTally {
    sports: usize,
    countries: usize,
    competitions: usize,
    results: Vec<CompetitionResult>,
}

pub fn api_from_config(api: &ApiConfig, fixtures: Option<&Path>) -> Result<Box<dyn SportsApi>> {
    match fixtures {
        Some(root) => {
            info!(root = %root.display(), "replaying upstream fixtures");
            Ok(Box::new(FixtureSportsApi::new(root)))
        }
        None => Ok(Box::new(HttpSportsApi::new(api.clone())?)),
    }
}

pub struct SyncPipeline {
    store: Store,
    api: Box<dyn SportsApi>,
    gate: Box<dyn RateGate>,
    policy: SyncPolicy,
}

impl SyncPipeline {
    pub fn new(store: Store, api: Box<dyn SportsApi>, policy: SyncPolicy) -> Self {
        let gate: Box<dyn RateGate> = if policy.request_interval_ms == 0 {
            Box::new(Unthrottled)
        } else {
            Box::new(FixedIntervalGate::new(policy.request_interval()))
        };
        Self {
            store,
            api,
            gate,
            policy,
        }
    }

    pub fn with_gate(mut self, gate: Box<dyn RateGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Refresh teams of the most popular standings-capable competitions. An empty
    /// store is first seeded from the configured seed competitions.
    pub async fn run_daily_update(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("daily_update", %run_id);
        async {
            let mut tally = RunTally::default();
            let stored = self
                .store
                .count_rows(Table::Competitions)
                .await
                .context("counting stored competitions")?;

            if stored == 0 {
                info!(
                    seeds = self.policy.seed_competition_ids.len(),
                    "no competitions stored; probing seed competitions"
                );
                self.bootstrap_from_seeds(&mut tally).await?;
            } else {
                let targets = self
                    .store
                    .sync_targets(self.policy.daily_batch_size)
                    .await
                    .context("selecting competitions to update")?;
                info!(competitions = targets.len(), "updating current season teams");
                self.sync_targets(&targets, &mut tally).await?;
            }

            if tally.results.is_empty() {
                warn!("no active competitions available to update");
            }
            self.finish(run_id, UpdateKind::CurrentSeason, started_at, tally)
                .await
        }
        .instrument(span)
        .await
    }

    /// Load the full competitions listing, then sync teams for the top
    /// standings-capable competitions.
    pub async fn run_full_population(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("full_population", %run_id);
        async {
            let mut tally = RunTally::default();

            self.gate.ready().await;
            match self.api.competitions().await {
                Some(listing) => {
                    tally.sports = self
                        .store
                        .upsert_sports(&listing.sports())
                        .await
                        .context("writing sports")?;
                    tally.countries = self
                        .store
                        .upsert_countries(&listing.countries())
                        .await
                        .context("writing countries")?;
                    tally.competitions = self
                        .store
                        .upsert_competitions(&listing.competitions())
                        .await
                        .context("writing competitions")?;
                    info!(
                        sports = tally.sports,
                        countries = tally.countries,
                        competitions = tally.competitions,
                        "competitions listing stored"
                    );
                }
                None => warn!("competitions listing unavailable; using stored competitions"),
            }

            let targets = self
                .store
                .sync_targets(self.policy.population_batch_size)
                .await
                .context("selecting competitions to populate")?;
            info!(competitions = targets.len(), "populating teams");
            self.sync_targets(&targets, &mut tally).await?;

            self.finish(run_id, UpdateKind::FullPopulation, started_at, tally)
                .await
        }
        .instrument(span)
        .await
    }

    async fn sync_targets(&self, targets: &[SyncTarget], tally: &mut RunTally) -> Result<()> {
        for (idx, target) in targets.iter().enumerate() {
            let span = info_span!(
                "competition_sync",
                competition_id = target.competition_id,
                name = %target.name
            );
            let outcome = self.sync_target(target).instrument(span).await?;
            tally.results.push(CompetitionResult {
                competition_id: target.competition_id,
                outcome,
            });

            if (idx + 1) % 10 == 0 {
                let teams: usize = tally.results.iter().map(|r| r.outcome.teams()).sum();
                info!(processed = idx + 1, total = targets.len(), teams, "progress");
            }
        }
        Ok(())
    }

    /// Fetch and store one competition's teams. Upstream problems become a soft
    /// outcome; store errors propagate.
    pub async fn sync_target(&self, target: &SyncTarget) -> Result<CompetitionOutcome> {
        if !target.has_standings {
            debug!("skipping competition without standings");
            return Ok(CompetitionOutcome::NoStandings);
        }

        self.gate.ready().await;
        let Some(payload) = self.api.standings(target.competition_id).await else {
            warn!("standings unavailable; counting zero teams");
            return Ok(CompetitionOutcome::Unavailable);
        };
        self.apply_standings(target.competition_id, target.season_num, &payload)
            .await
    }

    async fn apply_standings(
        &self,
        competition_id: i64,
        season_num: Option<i64>,
        payload: &StandingsPayload,
    ) -> Result<CompetitionOutcome> {
        let entries = match extract_standings(payload, competition_id) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(competition_id, reason = %err, "malformed standings; counting zero teams");
                return Ok(CompetitionOutcome::Malformed(err));
            }
        };
        if entries.is_empty() {
            warn!(competition_id, "standings carried no teams");
            return Ok(CompetitionOutcome::NoTeams);
        }

        let teams: Vec<Team> = entries.into_iter().map(|entry| entry.team).collect();
        let written = self
            .store
            .apply_competition_teams(competition_id, season_num, &teams)
            .await
            .with_context(|| format!("writing teams for competition {competition_id}"))?;
        info!(competition_id, teams = written, "teams updated");
        Ok(CompetitionOutcome::Updated { teams: written })
    }

    async fn bootstrap_from_seeds(&self, tally: &mut RunTally) -> Result<()> {
        for &seed in &self.policy.seed_competition_ids {
            let span = info_span!("seed_probe", competition_id = seed);
            let outcome = self.bootstrap_seed(seed, tally).instrument(span).await?;
            if let Some(outcome) = outcome {
                tally.results.push(CompetitionResult {
                    competition_id: seed,
                    outcome,
                });
            }
        }
        Ok(())
    }

    /// `None` when the seed could not be confirmed as an active competition.
    async fn bootstrap_seed(
        &self,
        seed: i64,
        tally: &mut RunTally,
    ) -> Result<Option<CompetitionOutcome>> {
        self.gate.ready().await;
        let Some(payload) = self.api.standings(seed).await else {
            warn!("seed competition unavailable");
            return Ok(None);
        };
        let Some(mut competition) = payload.competition(seed) else {
            warn!("seed payload does not describe a competition");
            return Ok(None);
        };
        competition.flags.has_standings = true;

        tally.countries += self
            .store
            .upsert_countries(&payload.countries.iter().filter_map(|c| c.to_country()).collect::<Vec<_>>())
            .await
            .context("writing seed countries")?;
        tally.competitions += self
            .store
            .upsert_competitions(std::slice::from_ref(&competition))
            .await
            .with_context(|| format!("writing seed competition {seed}"))?;
        info!(name = %competition.name, "seed competition added");

        let outcome = self
            .apply_standings(seed, competition.current_season_num, &payload)
            .await?;
        Ok(Some(outcome))
    }

    async fn finish(
        &self,
        run_id: Uuid,
        kind: UpdateKind,
        started_at: DateTime<Utc>,
        tally: RunTally,
    ) -> Result<SyncRunSummary> {
        let summary = SyncRunSummary {
            run_id,
            kind,
            started_at,
            finished_at: Utc::now(),
            sports_upserted: tally.sports,
            countries_upserted: tally.countries,
            competitions_upserted: tally.competitions,
            results: tally.results,
        };

        self.store
            .append_update_log(&UpdateRun {
                run_id,
                kind,
                competitions_processed: summary.competitions_updated() as i64,
                teams_updated: summary.teams_updated() as i64,
                finished_at: summary.finished_at,
            })
            .await
            .context("appending update log")?;

        info!(
            kind = kind.as_str(),
            considered = summary.competitions_considered(),
            updated = summary.competitions_updated(),
            teams = summary.teams_updated(),
            soft_failures = summary.soft_failures(),
            "sync run complete"
        );
        Ok(summary)
    }
}
