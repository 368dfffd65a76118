//! SQLite persistence for scoresync: schema, natural-key upserts, audit log and
//! the read-only aggregates used by reporting and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use scoresync_core::{
    Competition, CompetitionFlags, Country, Season, Sport, SyncTarget, Team, TeamCompetition,
    UpdateLogEntry, UpdateRun,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "scoresync-storage";

const CREATE_SPORTS: &str = r#"
CREATE TABLE IF NOT EXISTS sports (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    name_for_url TEXT,
    draw_support BOOLEAN DEFAULT FALSE,
    image_version INTEGER,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)"#;

const CREATE_COUNTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS countries (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    name_for_url TEXT,
    image_version INTEGER,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
)"#;

const CREATE_COMPETITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS competitions (
    id INTEGER PRIMARY KEY,
    country_id INTEGER,
    sport_id INTEGER,
    name TEXT NOT NULL,
    long_name TEXT,
    name_for_url TEXT,
    has_standings BOOLEAN DEFAULT FALSE,
    has_live_standings BOOLEAN DEFAULT FALSE,
    has_standings_groups BOOLEAN DEFAULT FALSE,
    has_brackets BOOLEAN DEFAULT FALSE,
    has_stats BOOLEAN DEFAULT FALSE,
    has_history BOOLEAN DEFAULT FALSE,
    popularity_rank INTEGER,
    image_version INTEGER,
    current_stage_type INTEGER,
    competitors_type INTEGER,
    current_phase_num INTEGER,
    current_season_num INTEGER,
    current_stage_num INTEGER,
    is_international BOOLEAN DEFAULT FALSE,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (country_id) REFERENCES countries (id),
    FOREIGN KEY (sport_id) REFERENCES sports (id)
)"#;

const CREATE_SEASONS: &str = r#"
CREATE TABLE IF NOT EXISTS seasons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    competition_id INTEGER NOT NULL,
    season_num INTEGER NOT NULL,
    season_name TEXT,
    is_current BOOLEAN DEFAULT FALSE,
    teams_populated BOOLEAN DEFAULT FALSE,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (competition_id) REFERENCES competitions (id),
    UNIQUE(competition_id, season_num)
)"#;

const CREATE_TEAMS: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    name_for_url TEXT,
    country_id INTEGER,
    main_competition_id INTEGER,
    image_version INTEGER,
    is_national BOOLEAN DEFAULT FALSE,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (country_id) REFERENCES countries (id),
    FOREIGN KEY (main_competition_id) REFERENCES competitions (id)
)"#;

const CREATE_TEAM_COMPETITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS team_competitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id INTEGER NOT NULL,
    competition_id INTEGER NOT NULL,
    season_num INTEGER,
    is_active BOOLEAN DEFAULT TRUE,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (team_id) REFERENCES teams (id),
    FOREIGN KEY (competition_id) REFERENCES competitions (id),
    UNIQUE(team_id, competition_id, season_num)
)"#;

const CREATE_UPDATE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS update_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT,
    update_type TEXT,
    competitions_processed INTEGER,
    teams_updated INTEGER,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
)"#;

const SCHEMA: &[&str] = &[
    CREATE_SPORTS,
    CREATE_COUNTRIES,
    CREATE_COMPETITIONS,
    CREATE_SEASONS,
    CREATE_TEAMS,
    CREATE_TEAM_COMPETITIONS,
    CREATE_UPDATE_LOG,
    "CREATE INDEX IF NOT EXISTS idx_teams_country ON teams(country_id)",
    "CREATE INDEX IF NOT EXISTS idx_teams_competition ON teams(main_competition_id)",
    "CREATE INDEX IF NOT EXISTS idx_competitions_country ON competitions(country_id)",
    "CREATE INDEX IF NOT EXISTS idx_competitions_popularity ON competitions(popularity_rank)",
    "CREATE INDEX IF NOT EXISTS idx_team_competitions_team ON team_competitions(team_id)",
    "CREATE INDEX IF NOT EXISTS idx_team_competitions_comp ON team_competitions(competition_id)",
    "CREATE INDEX IF NOT EXISTS idx_seasons_competition ON seasons(competition_id)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database not found at {}; run create-schema first", path.display())]
    Missing { path: PathBuf },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Tables managed by the store. Names are fixed, so they are safe to splice into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sports,
    Countries,
    Competitions,
    Seasons,
    Teams,
    TeamCompetitions,
    UpdateLog,
}

impl Table {
    /// The six entity tables every populated store must have.
    pub const ENTITY_TABLES: [Table; 6] = [
        Table::Countries,
        Table::Competitions,
        Table::Teams,
        Table::TeamCompetitions,
        Table::Sports,
        Table::Seasons,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Sports => "sports",
            Table::Countries => "countries",
            Table::Competitions => "competitions",
            Table::Seasons => "seasons",
            Table::Teams => "teams",
            Table::TeamCompetitions => "team_competitions",
            Table::UpdateLog => "update_log",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetitionFeature {
    Standings,
    Stats,
    Brackets,
}

impl CompetitionFeature {
    fn column(&self) -> &'static str {
        match self {
            CompetitionFeature::Standings => "has_standings",
            CompetitionFeature::Stats => "has_stats",
            CompetitionFeature::Brackets => "has_brackets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveLinks {
    pub relations: i64,
    pub teams: i64,
    pub competitions: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryTeamCount {
    pub country: String,
    pub teams: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularCompetition {
    pub name: String,
    pub popularity_rank: i64,
    pub has_standings: bool,
    pub has_stats: bool,
}

/// Handle to the local relational store. One handle per logical unit of work.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Store {
    /// Create the database file (and its directory) if needed and apply the schema.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self::connect(&path, true).await?;
        store.apply_schema().await?;
        info!(path = %path.display(), "database schema ready");
        Ok(store)
    }

    /// Open an existing database. A missing file is a fatal precondition failure.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = fs::try_exists(&path).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        if !exists {
            return Err(StoreError::Missing { path });
        }
        Self::connect(&path, false).await
    }

    /// Private in-memory store with the schema applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(false)
            .create_if_missing(true);
        let pool = single_connection_pool()
            .idle_timeout(Option::<Duration>::None)
            .max_lifetime(Option::<Duration>::None)
            .connect_with(options)
            .await?;
        let store = Self { pool, path: None };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn connect(path: &Path, create_if_missing: bool) -> Result<Self> {
        // Teams may reference countries the upstream listing never returned.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .foreign_keys(false)
            .busy_timeout(Duration::from_secs(30))
            .create_if_missing(create_if_missing);
        let pool = single_connection_pool().connect_with(options).await?;
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Idempotent `CREATE ... IF NOT EXISTS` for every table and index.
    pub async fn apply_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn upsert_countries(&self, countries: &[Country]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for country in countries {
            upsert_country_in(&mut tx, country).await?;
        }
        tx.commit().await?;
        Ok(countries.len())
    }

    pub async fn upsert_sports(&self, sports: &[Sport]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for sport in sports {
            upsert_sport_in(&mut tx, sport).await?;
        }
        tx.commit().await?;
        Ok(sports.len())
    }

    pub async fn upsert_competitions(&self, competitions: &[Competition]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for competition in competitions {
            upsert_competition_in(&mut tx, competition).await?;
        }
        tx.commit().await?;
        Ok(competitions.len())
    }

    pub async fn upsert_team(&self, team: &Team) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_team_in(&mut conn, team).await
    }

    pub async fn link_team(&self, link: &TeamCompetition) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        link_team_in(&mut tx, link).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Write one competition's standings teams and their active join rows as one
    /// transaction. Returns the number of teams written.
    pub async fn apply_competition_teams(
        &self,
        competition_id: i64,
        season_num: Option<i64>,
        teams: &[Team],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for team in teams {
            upsert_team_in(&mut tx, team).await?;
            link_team_in(
                &mut tx,
                &TeamCompetition {
                    team_id: team.id,
                    competition_id,
                    season_num,
                    is_active: true,
                },
            )
            .await?;
        }
        if let (Some(season_num), false) = (season_num, teams.is_empty()) {
            upsert_current_season_in(
                &mut tx,
                &Season {
                    competition_id,
                    season_num,
                    season_name: None,
                    is_current: true,
                    teams_populated: true,
                },
            )
            .await?;
        }
        tx.commit().await?;
        debug!(competition_id, teams = teams.len(), "competition teams committed");
        Ok(teams.len())
    }

    pub async fn append_update_log(&self, run: &UpdateRun) -> Result<()> {
        sqlx::query(CREATE_UPDATE_LOG).execute(&self.pool).await?;
        sqlx::query(
            r#"
            INSERT INTO update_log (run_id, update_type, competitions_processed, teams_updated, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.kind.as_str())
        .bind(run.competitions_processed)
        .bind(run.teams_updated)
        .bind(run.finished_at.format("%Y-%m-%d %H:%M:%S").to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Standings-capable competitions, most popular first, unranked last.
    pub async fn sync_targets(&self, limit: u32) -> Result<Vec<SyncTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, has_standings, popularity_rank, current_season_num
              FROM competitions
             WHERE has_standings = 1
             ORDER BY popularity_rank IS NULL, popularity_rank ASC, id ASC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SyncTarget> {
                Ok(SyncTarget {
                    competition_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    has_standings: row.try_get("has_standings")?,
                    popularity_rank: row.try_get("popularity_rank")?,
                    season_num: row.try_get("current_season_num")?,
                })
            })
            .collect()
    }

    pub async fn country(&self, id: i64) -> Result<Option<Country>> {
        let row = sqlx::query("SELECT id, name, name_for_url, image_version FROM countries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Country> {
            Ok(Country {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                name_for_url: row.try_get("name_for_url")?,
                image_version: row.try_get("image_version")?,
            })
        })
        .transpose()
    }

    pub async fn competition(&self, id: i64) -> Result<Option<Competition>> {
        let row = sqlx::query("SELECT * FROM competitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(competition_from_row).transpose()
    }

    pub async fn team(&self, id: i64) -> Result<Option<Team>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, name_for_url, country_id, main_competition_id, image_version, is_national
              FROM teams
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Team> {
            Ok(Team {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                name_for_url: row.try_get("name_for_url")?,
                country_id: row.try_get("country_id")?,
                main_competition_id: row.try_get("main_competition_id")?,
                image_version: row.try_get("image_version")?,
                is_national: row.try_get("is_national")?,
            })
        })
        .transpose()
    }

    pub async fn team_competitions(&self, team_id: i64) -> Result<Vec<TeamCompetition>> {
        let rows = sqlx::query(
            r#"
            SELECT team_id, competition_id, season_num, is_active
              FROM team_competitions
             WHERE team_id = ?
             ORDER BY competition_id, season_num
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<TeamCompetition> {
                Ok(TeamCompetition {
                    team_id: row.try_get("team_id")?,
                    competition_id: row.try_get("competition_id")?,
                    season_num: row.try_get("season_num")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }

    pub async fn seasons(&self, competition_id: i64) -> Result<Vec<Season>> {
        let rows = sqlx::query(
            r#"
            SELECT competition_id, season_num, season_name, is_current, teams_populated
              FROM seasons
             WHERE competition_id = ?
             ORDER BY season_num
            "#,
        )
        .bind(competition_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<Season> {
                Ok(Season {
                    competition_id: row.try_get("competition_id")?,
                    season_num: row.try_get("season_num")?,
                    season_name: row.try_get("season_name")?,
                    is_current: row.try_get("is_current")?,
                    teams_populated: row.try_get("teams_populated")?,
                })
            })
            .collect()
    }

    pub async fn existing_tables(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn table_exists(&self, table: Table) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(found > 0)
    }

    pub async fn count_rows(&self, table: Table) -> Result<i64> {
        self.scalar(&format!("SELECT COUNT(*) FROM {}", table.as_str()))
            .await
    }

    pub async fn teams_without_country(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM teams WHERE country_id IS NULL")
            .await
    }

    pub async fn teams_without_competition(&self) -> Result<i64> {
        self.scalar(
            r#"
            SELECT COUNT(*)
              FROM teams t
              LEFT JOIN team_competitions tc ON t.id = tc.team_id
             WHERE tc.team_id IS NULL
            "#,
        )
        .await
    }

    pub async fn competitions_with(&self, feature: CompetitionFeature) -> Result<i64> {
        self.scalar(&format!(
            "SELECT COUNT(*) FROM competitions WHERE {} = 1",
            feature.column()
        ))
        .await
    }

    pub async fn competitions_with_popularity(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM competitions WHERE popularity_rank IS NOT NULL")
            .await
    }

    pub async fn active_links(&self) -> Result<ActiveLinks> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS relations,
                   COUNT(DISTINCT team_id) AS teams,
                   COUNT(DISTINCT competition_id) AS competitions
              FROM team_competitions
             WHERE is_active = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ActiveLinks {
            relations: row.try_get("relations")?,
            teams: row.try_get("teams")?,
            competitions: row.try_get("competitions")?,
        })
    }

    /// Countries ordered by how many teams reference them.
    pub async fn top_countries_by_teams(
        &self,
        limit: u32,
        non_empty_only: bool,
    ) -> Result<Vec<CountryTeamCount>> {
        let having = if non_empty_only { "HAVING team_count > 0" } else { "" };
        let sql = format!(
            r#"
            SELECT c.name AS name, COUNT(t.id) AS team_count
              FROM countries c
              LEFT JOIN teams t ON c.id = t.country_id
             GROUP BY c.id, c.name
             {having}
             ORDER BY team_count DESC, c.name ASC
             LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<CountryTeamCount> {
                Ok(CountryTeamCount {
                    country: row.try_get("name")?,
                    teams: row.try_get("team_count")?,
                })
            })
            .collect()
    }

    pub async fn most_popular_competitions(&self, limit: u32) -> Result<Vec<PopularCompetition>> {
        let rows = sqlx::query(
            r#"
            SELECT name, popularity_rank, has_standings, has_stats
              FROM competitions
             WHERE popularity_rank IS NOT NULL
             ORDER BY popularity_rank ASC, id ASC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<PopularCompetition> {
                Ok(PopularCompetition {
                    name: row.try_get("name")?,
                    popularity_rank: row.try_get("popularity_rank")?,
                    has_standings: row.try_get("has_standings")?,
                    has_stats: row.try_get("has_stats")?,
                })
            })
            .collect()
    }

    /// Most recent audit rows, or `None` when the audit table does not exist.
    pub async fn recent_updates(&self, limit: u32) -> Result<Option<Vec<UpdateLogEntry>>> {
        if !self.table_exists(Table::UpdateLog).await? {
            return Ok(None);
        }
        let rows = sqlx::query(
            r#"
            SELECT update_type, competitions_processed, teams_updated, CAST(timestamp AS TEXT) AS ts
              FROM update_log
             ORDER BY timestamp DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let entries = rows
            .iter()
            .map(|row| -> Result<UpdateLogEntry> {
                Ok(UpdateLogEntry {
                    update_type: row.try_get::<Option<String>, _>("update_type")?.unwrap_or_default(),
                    competitions_processed: row
                        .try_get::<Option<i64>, _>("competitions_processed")?
                        .unwrap_or_default(),
                    teams_updated: row.try_get::<Option<i64>, _>("teams_updated")?.unwrap_or_default(),
                    timestamp: row.try_get::<Option<String>, _>("ts")?.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(entries))
    }

    /// Size of the backing file; `None` for in-memory stores.
    pub async fn file_size_bytes(&self) -> Result<Option<u64>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let meta = fs::metadata(path).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Some(meta.len()))
    }

    async fn scalar(&self, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await?)
    }
}

fn single_connection_pool() -> SqlitePoolOptions {
    SqlitePoolOptions::new().max_connections(1)
}

fn competition_from_row(row: &SqliteRow) -> Result<Competition> {
    Ok(Competition {
        id: row.try_get("id")?,
        country_id: row.try_get("country_id")?,
        sport_id: row
            .try_get::<Option<i64>, _>("sport_id")?
            .unwrap_or(scoresync_core::DEFAULT_SPORT_ID),
        name: row.try_get("name")?,
        long_name: row.try_get("long_name")?,
        name_for_url: row.try_get("name_for_url")?,
        flags: CompetitionFlags {
            has_standings: row.try_get("has_standings")?,
            has_live_standings: row.try_get("has_live_standings")?,
            has_standings_groups: row.try_get("has_standings_groups")?,
            has_brackets: row.try_get("has_brackets")?,
            has_stats: row.try_get("has_stats")?,
            has_history: row.try_get("has_history")?,
        },
        popularity_rank: row.try_get("popularity_rank")?,
        image_version: row.try_get("image_version")?,
        current_stage_type: row.try_get("current_stage_type")?,
        competitors_type: row.try_get("competitors_type")?,
        current_phase_num: row.try_get("current_phase_num")?,
        current_season_num: row.try_get("current_season_num")?,
        current_stage_num: row.try_get("current_stage_num")?,
        is_international: row.try_get("is_international")?,
    })
}

// Upserts overwrite every payload column in place. The row is never deleted, so
// rows referencing it by id are left untouched.

async fn upsert_country_in(conn: &mut SqliteConnection, country: &Country) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO countries (id, name, name_for_url, image_version)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            name_for_url = excluded.name_for_url,
            image_version = excluded.image_version
        "#,
    )
    .bind(country.id)
    .bind(&country.name)
    .bind(country.name_for_url.as_deref())
    .bind(country.image_version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_sport_in(conn: &mut SqliteConnection, sport: &Sport) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sports (id, name, name_for_url, draw_support, image_version)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            name_for_url = excluded.name_for_url,
            draw_support = excluded.draw_support,
            image_version = excluded.image_version
        "#,
    )
    .bind(sport.id)
    .bind(&sport.name)
    .bind(sport.name_for_url.as_deref())
    .bind(sport.draw_support)
    .bind(sport.image_version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_competition_in(conn: &mut SqliteConnection, competition: &Competition) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO competitions (
            id, country_id, sport_id, name, long_name, name_for_url,
            has_standings, has_live_standings, has_standings_groups, has_brackets, has_stats, has_history,
            popularity_rank, image_version, current_stage_type, competitors_type,
            current_phase_num, current_season_num, current_stage_num, is_international
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            country_id = excluded.country_id,
            sport_id = excluded.sport_id,
            name = excluded.name,
            long_name = excluded.long_name,
            name_for_url = excluded.name_for_url,
            has_standings = excluded.has_standings,
            has_live_standings = excluded.has_live_standings,
            has_standings_groups = excluded.has_standings_groups,
            has_brackets = excluded.has_brackets,
            has_stats = excluded.has_stats,
            has_history = excluded.has_history,
            popularity_rank = excluded.popularity_rank,
            image_version = excluded.image_version,
            current_stage_type = excluded.current_stage_type,
            competitors_type = excluded.competitors_type,
            current_phase_num = excluded.current_phase_num,
            current_season_num = excluded.current_season_num,
            current_stage_num = excluded.current_stage_num,
            is_international = excluded.is_international
        "#,
    )
    .bind(competition.id)
    .bind(competition.country_id)
    .bind(competition.sport_id)
    .bind(&competition.name)
    .bind(competition.long_name.as_deref())
    .bind(competition.name_for_url.as_deref())
    .bind(competition.flags.has_standings)
    .bind(competition.flags.has_live_standings)
    .bind(competition.flags.has_standings_groups)
    .bind(competition.flags.has_brackets)
    .bind(competition.flags.has_stats)
    .bind(competition.flags.has_history)
    .bind(competition.popularity_rank)
    .bind(competition.image_version)
    .bind(competition.current_stage_type)
    .bind(competition.competitors_type)
    .bind(competition.current_phase_num)
    .bind(competition.current_season_num)
    .bind(competition.current_stage_num)
    .bind(competition.is_international)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_team_in(conn: &mut SqliteConnection, team: &Team) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO teams (id, name, name_for_url, country_id, main_competition_id, image_version, is_national)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            name_for_url = excluded.name_for_url,
            country_id = excluded.country_id,
            main_competition_id = excluded.main_competition_id,
            image_version = excluded.image_version,
            is_national = excluded.is_national
        "#,
    )
    .bind(team.id)
    .bind(&team.name)
    .bind(team.name_for_url.as_deref())
    .bind(team.country_id)
    .bind(team.main_competition_id)
    .bind(team.image_version)
    .bind(team.is_national)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Replace the join row for (team, competition, season) in place. SQLite treats
/// NULLs as distinct inside UNIQUE constraints, so the key is matched with `IS`
/// and a row is only inserted when none matched.
async fn link_team_in(conn: &mut SqliteConnection, link: &TeamCompetition) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE team_competitions
           SET is_active = ?
         WHERE team_id = ? AND competition_id = ? AND season_num IS ?
        "#,
    )
    .bind(link.is_active)
    .bind(link.team_id)
    .bind(link.competition_id)
    .bind(link.season_num)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() > 0 {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO team_competitions (team_id, competition_id, season_num, is_active) VALUES (?, ?, ?, ?)",
    )
    .bind(link.team_id)
    .bind(link.competition_id)
    .bind(link.season_num)
    .bind(link.is_active)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_current_season_in(conn: &mut SqliteConnection, season: &Season) -> Result<()> {
    if season.is_current {
        sqlx::query("UPDATE seasons SET is_current = 0 WHERE competition_id = ? AND season_num <> ?")
            .bind(season.competition_id)
            .bind(season.season_num)
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query(
        r#"
        INSERT INTO seasons (competition_id, season_num, season_name, is_current, teams_populated)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(competition_id, season_num) DO UPDATE SET
            season_name = excluded.season_name,
            is_current = excluded.is_current,
            teams_populated = excluded.teams_populated
        "#,
    )
    .bind(season.competition_id)
    .bind(season.season_num)
    .bind(season.season_name.as_deref())
    .bind(season.is_current)
    .bind(season.teams_populated)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scoresync_core::{UpdateKind, DEFAULT_IMAGE_VERSION, DEFAULT_SPORT_ID};
    use tempfile::tempdir;

    fn country(id: i64, name: &str) -> Country {
        Country {
            id,
            name: name.to_string(),
            name_for_url: Some(name.to_ascii_lowercase()),
            image_version: Some(DEFAULT_IMAGE_VERSION),
        }
    }

    fn competition(id: i64, rank: Option<i64>, has_standings: bool) -> Competition {
        Competition {
            id,
            country_id: Some(1),
            sport_id: DEFAULT_SPORT_ID,
            name: format!("Competition {id}"),
            long_name: None,
            name_for_url: None,
            flags: CompetitionFlags {
                has_standings,
                ..Default::default()
            },
            popularity_rank: rank,
            image_version: Some(DEFAULT_IMAGE_VERSION),
            current_stage_type: None,
            competitors_type: None,
            current_phase_num: None,
            current_season_num: Some(2025),
            current_stage_num: None,
            is_international: false,
        }
    }

    fn team(id: i64, country_id: Option<i64>, main_competition_id: i64) -> Team {
        Team {
            id,
            name: format!("Team {id}"),
            name_for_url: Some(format!("team-{id}")),
            country_id,
            main_competition_id: Some(main_competition_id),
            image_version: None,
            is_national: false,
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.apply_schema().await.unwrap();
        let tables = store.existing_tables().await.unwrap();
        for table in Table::ENTITY_TABLES {
            assert!(tables.iter().any(|t| t == table.as_str()), "missing {}", table.as_str());
        }
        assert!(tables.iter().any(|t| t == "update_log"));
    }

    #[tokio::test]
    async fn opening_missing_database_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db").join("absent.db");
        let err = Store::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn created_database_can_be_reopened() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("db").join("scores.db");
        let store = Store::create(&path).await.unwrap();
        store.upsert_countries(&[country(1, "England")]).await.unwrap();
        store.close().await;

        let reopened = Store::open(&path).await.unwrap();
        assert_eq!(reopened.count_rows(Table::Countries).await.unwrap(), 1);
        assert!(reopened.file_size_bytes().await.unwrap().unwrap() > 0);
    }

    #[tokio::test]
    async fn repeated_country_upserts_do_not_duplicate() {
        let store = Store::in_memory().await.unwrap();
        let batch = [country(1, "England"), country(2, "Spain")];
        store.upsert_countries(&batch).await.unwrap();
        store.upsert_countries(&batch).await.unwrap();
        assert_eq!(store.count_rows(Table::Countries).await.unwrap(), 2);

        store.upsert_countries(&[country(2, "Espana")]).await.unwrap();
        let spain = store.country(2).await.unwrap().unwrap();
        assert_eq!(spain.name, "Espana");
        assert_eq!(store.count_rows(Table::Countries).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn join_key_keeps_only_latest_write() {
        let store = Store::in_memory().await.unwrap();
        for season_num in [Some(2025), None] {
            store
                .link_team(&TeamCompetition {
                    team_id: 1,
                    competition_id: 10,
                    season_num,
                    is_active: true,
                })
                .await
                .unwrap();
            store
                .link_team(&TeamCompetition {
                    team_id: 1,
                    competition_id: 10,
                    season_num,
                    is_active: false,
                })
                .await
                .unwrap();
        }

        let links = store.team_competitions(1).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| !l.is_active));
        assert_eq!(store.count_rows(Table::TeamCompetitions).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replacing_a_team_keeps_its_join_rows() {
        let store = Store::in_memory().await.unwrap();
        store.apply_competition_teams(10, Some(2025), &[team(1, Some(1), 10)]).await.unwrap();

        let mut renamed = team(1, Some(1), 10);
        renamed.name = "Renamed".into();
        store.upsert_team(&renamed).await.unwrap();

        assert_eq!(store.team(1).await.unwrap().unwrap().name, "Renamed");
        assert_eq!(store.team_competitions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replace_overwrites_columns_with_nulls() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_team(&team(1, Some(5), 10)).await.unwrap();
        store.upsert_team(&team(1, None, 11)).await.unwrap();

        let stored = store.team(1).await.unwrap().unwrap();
        assert_eq!(stored.country_id, None);
        assert_eq!(stored.main_competition_id, Some(11));
    }

    #[tokio::test]
    async fn sync_targets_order_by_popularity_with_unranked_last() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_competitions(&[
                competition(1, Some(50), true),
                competition(2, None, true),
                competition(3, Some(10), true),
                competition(4, Some(1), false),
            ])
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .sync_targets(10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.competition_id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);

        let capped = store.sync_targets(2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].season_num, Some(2025));
    }

    #[tokio::test]
    async fn applying_the_same_standings_twice_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let teams = [team(1, Some(1), 10), team(2, None, 10)];
        store.apply_competition_teams(10, Some(2025), &teams).await.unwrap();
        store.apply_competition_teams(10, Some(2025), &teams).await.unwrap();

        assert_eq!(store.count_rows(Table::Teams).await.unwrap(), 2);
        assert_eq!(store.count_rows(Table::TeamCompetitions).await.unwrap(), 2);
        assert_eq!(store.count_rows(Table::Seasons).await.unwrap(), 1);
        let links = store.active_links().await.unwrap();
        assert_eq!(links, ActiveLinks { relations: 2, teams: 2, competitions: 1 });
    }

    async fn join_rows(store: &Store) -> Vec<(i64, i64, Option<i64>, bool, String)> {
        sqlx::query_as(
            r#"
            SELECT id, team_id, season_num, is_active, CAST(created_at AS TEXT)
              FROM team_competitions
             ORDER BY id
            "#,
        )
        .fetch_all(&store.pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn reapplying_standings_keeps_join_row_identity() {
        let store = Store::in_memory().await.unwrap();
        for season_num in [Some(2025), None] {
            store.apply_competition_teams(10, season_num, &[team(1, None, 10)]).await.unwrap();
        }
        let first = join_rows(&store).await;
        assert_eq!(first.len(), 2);

        for season_num in [Some(2025), None] {
            store.apply_competition_teams(10, season_num, &[team(1, None, 10)]).await.unwrap();
        }
        assert_eq!(join_rows(&store).await, first);
    }

    #[tokio::test]
    async fn newer_season_becomes_current() {
        let store = Store::in_memory().await.unwrap();
        store.apply_competition_teams(10, Some(2024), &[team(1, None, 10)]).await.unwrap();
        store.apply_competition_teams(10, Some(2025), &[team(1, None, 10)]).await.unwrap();

        let seasons = store.seasons(10).await.unwrap();
        assert_eq!(seasons.len(), 2);
        assert!(!seasons[0].is_current);
        assert!(seasons[1].is_current && seasons[1].teams_populated);
    }

    #[tokio::test]
    async fn update_log_reads_back_newest_first() {
        let store = Store::in_memory().await.unwrap();
        for (hour, kind) in [(6, UpdateKind::FullPopulation), (7, UpdateKind::CurrentSeason)] {
            store
                .append_update_log(&UpdateRun {
                    run_id: uuid_for_test(hour),
                    kind,
                    competitions_processed: hour,
                    teams_updated: hour * 10,
                    finished_at: Utc.with_ymd_and_hms(2026, 2, 24, hour as u32, 0, 0).single().unwrap(),
                })
                .await
                .unwrap();
        }

        let recent = store.recent_updates(5).await.unwrap().unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].update_type, "current_season");
        assert_eq!(recent[0].teams_updated, 70);
        assert_eq!(recent[0].timestamp, "2026-02-24 07:00:00");
    }

    #[tokio::test]
    async fn team_distribution_skips_empty_countries_when_asked() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_countries(&[country(1, "England"), country(2, "Spain")])
            .await
            .unwrap();
        store
            .apply_competition_teams(10, None, &[team(1, Some(1), 10), team(2, Some(1), 10), team(3, None, 10)])
            .await
            .unwrap();

        let all = store.top_countries_by_teams(10, false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], CountryTeamCount { country: "England".into(), teams: 2 });

        let non_empty = store.top_countries_by_teams(10, true).await.unwrap();
        assert_eq!(non_empty.len(), 1);
        assert_eq!(store.teams_without_country().await.unwrap(), 1);
        assert_eq!(store.teams_without_competition().await.unwrap(), 0);
    }

    fn uuid_for_test(seed: i64) -> uuid::Uuid {
        uuid::Uuid::from_u128(seed as u128)
    }
}
