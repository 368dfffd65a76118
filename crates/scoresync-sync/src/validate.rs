//! Threshold and integrity checks over a populated store.

use anyhow::Result;
use scoresync_core::{UpdateLogEntry, ValidationThresholds};
use scoresync_storage::{ActiveLinks, CompetitionFeature, CountryTeamCount, Store, Table};

use crate::report::{format_megabytes, percentage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Reported but does not fail validation.
    Warn,
    Fail,
}

impl CheckStatus {
    fn label(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Warn => "WARN",
            CheckStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub id: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(id: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseStats {
    pub size_bytes: Option<u64>,
    pub links: ActiveLinks,
    pub competitions_with_standings: i64,
    pub competitions_with_stats: i64,
    pub competitions_with_popularity: i64,
    pub top_countries: Vec<CountryTeamCount>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub checks: Vec<Check>,
    pub counts: Vec<(Table, i64)>,
    pub latest_update: Option<UpdateLogEntry>,
    /// Absent when required tables are missing.
    pub stats: Option<DatabaseStats>,
}

fn threshold_check(id: &str, actual: i64, minimum: i64) -> Check {
    if actual >= minimum {
        Check::new(id, CheckStatus::Pass, format!("{actual} {id} (minimum {minimum})"))
    } else {
        Check::new(
            id,
            CheckStatus::Fail,
            format!("only {actual} {id}; expected at least {minimum}"),
        )
    }
}

impl ValidationReport {
    pub async fn run(store: &Store, thresholds: &ValidationThresholds) -> Result<Self> {
        let mut checks = Vec::new();
        let mut missing = false;
        for table in Table::ENTITY_TABLES {
            if store.table_exists(table).await? {
                checks.push(Check::new(
                    format!("table.{}", table.as_str()),
                    CheckStatus::Pass,
                    "present",
                ));
            } else {
                missing = true;
                checks.push(Check::new(
                    format!("table.{}", table.as_str()),
                    CheckStatus::Fail,
                    "missing",
                ));
            }
        }
        if missing {
            return Ok(Self {
                checks,
                counts: Vec::new(),
                latest_update: None,
                stats: None,
            });
        }

        let mut counts = Vec::with_capacity(Table::ENTITY_TABLES.len());
        for table in Table::ENTITY_TABLES {
            counts.push((table, store.count_rows(table).await?));
        }
        let count_of = |wanted: Table| {
            counts
                .iter()
                .find(|(table, _)| *table == wanted)
                .map(|(_, n)| *n)
                .unwrap_or_default()
        };
        let teams = count_of(Table::Teams);

        checks.push(threshold_check(
            "countries",
            count_of(Table::Countries),
            thresholds.min_countries,
        ));
        checks.push(threshold_check(
            "competitions",
            count_of(Table::Competitions),
            thresholds.min_competitions,
        ));
        checks.push(threshold_check("teams", teams, thresholds.min_teams));

        let without_country = store.teams_without_country().await?;
        let ratio = percentage(without_country, teams) / 100.0;
        checks.push(if ratio > thresholds.max_teams_without_country_ratio {
            Check::new(
                "teams_without_country",
                CheckStatus::Warn,
                format!("{without_country} teams without countries ({:.1}%)", ratio * 100.0),
            )
        } else {
            Check::new(
                "teams_without_country",
                CheckStatus::Pass,
                format!("teams with countries: {}/{teams}", teams - without_country),
            )
        });

        let without_competition = store.teams_without_competition().await?;
        checks.push(if without_competition > 0 {
            Check::new(
                "teams_without_competition",
                CheckStatus::Warn,
                format!("{without_competition} teams without competitions"),
            )
        } else {
            Check::new(
                "teams_without_competition",
                CheckStatus::Pass,
                "all teams have competition assignments",
            )
        });

        let latest_update = match store.recent_updates(1).await? {
            None => {
                checks.push(Check::new(
                    "latest_update",
                    CheckStatus::Warn,
                    "update log table not found",
                ));
                None
            }
            Some(mut entries) if !entries.is_empty() => {
                let latest = entries.swap_remove(0);
                checks.push(Check::new(
                    "latest_update",
                    CheckStatus::Pass,
                    format!(
                        "{} ({}): {} competitions, {} teams",
                        latest.timestamp,
                        latest.update_type,
                        latest.competitions_processed,
                        latest.teams_updated
                    ),
                ));
                Some(latest)
            }
            Some(_) => {
                checks.push(Check::new(
                    "latest_update",
                    CheckStatus::Warn,
                    "no update records found",
                ));
                None
            }
        };

        let stats = DatabaseStats {
            size_bytes: store.file_size_bytes().await?,
            links: store.active_links().await?,
            competitions_with_standings: store
                .competitions_with(CompetitionFeature::Standings)
                .await?,
            competitions_with_stats: store.competitions_with(CompetitionFeature::Stats).await?,
            competitions_with_popularity: store.competitions_with_popularity().await?,
            top_countries: store.top_countries_by_teams(5, false).await?,
        };

        Ok(Self {
            checks,
            counts,
            latest_update,
            stats: Some(stats),
        })
    }

    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn check(&self, id: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec!["# Database Validation".to_string(), String::new()];

        lines.push("## Checks".to_string());
        for check in &self.checks {
            lines.push(format!(
                "- [{}] {}: {}",
                check.status.label(),
                check.id,
                check.detail
            ));
        }
        lines.push(String::new());

        if !self.counts.is_empty() {
            lines.push("## Record Counts".to_string());
            for (table, count) in &self.counts {
                lines.push(format!("- {}: {count}", table.as_str()));
            }
            lines.push(String::new());
        }

        if let Some(stats) = &self.stats {
            let competitions = self
                .counts
                .iter()
                .find(|(table, _)| *table == Table::Competitions)
                .map(|(_, n)| *n)
                .unwrap_or_default();
            lines.push("## Detailed Statistics".to_string());
            if let Some(bytes) = stats.size_bytes {
                lines.push(format!("- Database size: {}", format_megabytes(bytes)));
            }
            lines.push(format!(
                "- Active team-competition relationships: {}",
                stats.links.relations
            ));
            lines.push(format!(
                "- Competitions with standings: {}/{competitions}",
                stats.competitions_with_standings
            ));
            lines.push(format!(
                "- Competitions with stats: {}/{competitions}",
                stats.competitions_with_stats
            ));
            lines.push(format!(
                "- Competitions with popularity: {}/{competitions}",
                stats.competitions_with_popularity
            ));
            lines.push("- Top countries by team count:".to_string());
            for row in &stats.top_countries {
                lines.push(format!("  - {}: {} teams", row.country, row.teams));
            }
            lines.push(String::new());
        }

        lines.push(if self.passed() {
            "**Validation passed**".to_string()
        } else {
            "**Validation failed**".to_string()
        });
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use scoresync_core::{
        Competition, CompetitionFlags, Country, Team, UpdateKind, UpdateRun, DEFAULT_SPORT_ID,
    };
    use uuid::Uuid;

    use super::*;

    fn countries(n: i64) -> Vec<Country> {
        (1..=n)
            .map(|id| Country {
                id,
                name: format!("Country {id}"),
                name_for_url: None,
                image_version: Some(1),
            })
            .collect()
    }

    async fn seeded_store(country_count: i64) -> Store {
        let store = Store::in_memory().await.unwrap();
        store.upsert_countries(&countries(country_count)).await.unwrap();
        store
            .upsert_competitions(&[Competition {
                id: 7,
                country_id: Some(1),
                sport_id: DEFAULT_SPORT_ID,
                name: "Premier League".into(),
                long_name: None,
                name_for_url: None,
                flags: CompetitionFlags {
                    has_standings: true,
                    ..Default::default()
                },
                popularity_rank: Some(1),
                image_version: Some(1),
                current_stage_type: None,
                competitors_type: None,
                current_phase_num: None,
                current_season_num: Some(2025),
                current_stage_num: None,
                is_international: false,
            }])
            .await
            .unwrap();
        store
            .apply_competition_teams(
                7,
                Some(2025),
                &[Team {
                    id: 110,
                    name: "Arsenal".into(),
                    name_for_url: None,
                    country_id: Some(1),
                    main_competition_id: Some(7),
                    image_version: None,
                    is_national: false,
                }],
            )
            .await
            .unwrap();
        store
            .append_update_log(&UpdateRun {
                run_id: Uuid::new_v4(),
                kind: UpdateKind::CurrentSeason,
                competitions_processed: 1,
                teams_updated: 1,
                finished_at: Utc::now(),
            })
            .await
            .unwrap();
        store
    }

    fn lenient_thresholds() -> ValidationThresholds {
        ValidationThresholds {
            min_competitions: 1,
            min_teams: 1,
            ..ValidationThresholds::default()
        }
    }

    #[tokio::test]
    async fn too_few_countries_fails_only_that_check() {
        let store = seeded_store(40).await;
        let report = ValidationReport::run(&store, &lenient_thresholds()).await.unwrap();

        assert!(!report.passed());
        let failed: Vec<&str> = report.failures().map(|c| c.id.as_str()).collect();
        assert_eq!(failed, vec!["countries"]);
        for id in ["competitions", "teams", "teams_without_country", "teams_without_competition", "latest_update"] {
            assert_eq!(report.check(id).map(|c| c.status), Some(CheckStatus::Pass), "{id}");
        }
        assert!(report.to_markdown().contains("[FAIL] countries: only 40 countries"));
    }

    #[tokio::test]
    async fn meeting_thresholds_passes() {
        let store = seeded_store(50).await;
        let report = ValidationReport::run(&store, &lenient_thresholds()).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.latest_update.as_ref().map(|u| u.teams_updated), Some(1));
        let stats = report.stats.as_ref().unwrap();
        assert_eq!(stats.links.relations, 1);
        assert_eq!(stats.top_countries[0].country, "Country 1");
    }

    #[tokio::test]
    async fn orphan_teams_warn_without_failing() {
        let store = seeded_store(50).await;
        store
            .upsert_team(&Team {
                id: 999,
                name: "Unlinked".into(),
                name_for_url: None,
                country_id: None,
                main_competition_id: None,
                image_version: None,
                is_national: false,
            })
            .await
            .unwrap();
        let report = ValidationReport::run(&store, &lenient_thresholds()).await.unwrap();
        assert!(report.passed());
        assert_eq!(
            report.check("teams_without_country").map(|c| c.status),
            Some(CheckStatus::Warn)
        );
        assert_eq!(
            report.check("teams_without_competition").map(|c| c.status),
            Some(CheckStatus::Warn)
        );
    }

    #[tokio::test]
    async fn empty_store_warns_on_missing_updates() {
        let store = Store::in_memory().await.unwrap();
        let report = ValidationReport::run(&store, &ValidationThresholds::default())
            .await
            .unwrap();
        assert_eq!(
            report.check("latest_update").map(|c| c.status),
            Some(CheckStatus::Warn)
        );
        assert_eq!(report.check("table.teams").map(|c| c.status), Some(CheckStatus::Pass));
        assert!(!report.to_markdown().contains("NaN"));
    }
}
