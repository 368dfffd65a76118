//! Read-only Markdown summary of the store.

use anyhow::Result;
use chrono::{DateTime, Utc};
use scoresync_core::UpdateLogEntry;
use scoresync_storage::{
    ActiveLinks, CompetitionFeature, CountryTeamCount, PopularCompetition, Store, Table,
};

const TABLE_LABELS: [(Table, &str); 6] = [
    (Table::Countries, "Countries/Regions"),
    (Table::Sports, "Sports"),
    (Table::Competitions, "Competitions/Leagues"),
    (Table::Seasons, "Season Records"),
    (Table::Teams, "Teams"),
    (Table::TeamCompetitions, "Team-Competition Relations"),
];

/// Share of `part` in `whole` as a percentage; zero when `whole` is zero.
pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseReport {
    pub generated_at: DateTime<Utc>,
    /// `None` count means the table is missing.
    pub table_counts: Vec<(Table, Option<i64>)>,
    pub size_bytes: Option<u64>,
    /// `None` when the audit table does not exist.
    pub recent_updates: Option<Vec<UpdateLogEntry>>,
    pub competitions: i64,
    pub with_standings: i64,
    pub with_stats: i64,
    pub with_brackets: i64,
    pub with_popularity: i64,
    pub popular: Vec<PopularCompetition>,
    pub team_distribution: Vec<CountryTeamCount>,
    pub links: ActiveLinks,
    pub teams: i64,
    pub teams_without_country: i64,
}

impl DatabaseReport {
    pub async fn collect(store: &Store) -> Result<Self> {
        let mut table_counts = Vec::with_capacity(TABLE_LABELS.len());
        for (table, _) in TABLE_LABELS {
            let count = if store.table_exists(table).await? {
                Some(store.count_rows(table).await?)
            } else {
                None
            };
            table_counts.push((table, count));
        }

        Ok(Self {
            generated_at: Utc::now(),
            table_counts,
            size_bytes: store.file_size_bytes().await?,
            recent_updates: store.recent_updates(5).await?,
            competitions: store.count_rows(Table::Competitions).await?,
            with_standings: store.competitions_with(CompetitionFeature::Standings).await?,
            with_stats: store.competitions_with(CompetitionFeature::Stats).await?,
            with_brackets: store.competitions_with(CompetitionFeature::Brackets).await?,
            with_popularity: store.competitions_with_popularity().await?,
            popular: store.most_popular_competitions(10).await?,
            team_distribution: store.top_countries_by_teams(10, true).await?,
            links: store.active_links().await?,
            teams: store.count_rows(Table::Teams).await?,
            teams_without_country: store.teams_without_country().await?,
        })
    }

    pub fn average_teams_per_competition(&self) -> f64 {
        if self.links.competitions == 0 {
            0.0
        } else {
            self.links.relations as f64 / self.links.competitions as f64
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Sports Database Update Report".to_string(),
            String::new(),
            format!("Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")),
            String::new(),
            "## Database Overview".to_string(),
        ];
        for (table, count) in &self.table_counts {
            let label = TABLE_LABELS
                .iter()
                .find(|(t, _)| t == table)
                .map(|(_, label)| *label)
                .unwrap_or_else(|| table.as_str());
            match count {
                Some(count) => lines.push(format!("- {label}: {count}")),
                None => lines.push(format!("- {label}: table not found")),
            }
        }
        if let Some(bytes) = self.size_bytes {
            lines.push(format!("- Database size: {}", format_megabytes(bytes)));
        }
        lines.push(String::new());

        lines.push("## Recent Update Activity".to_string());
        match &self.recent_updates {
            None => lines.push("- update log not available".to_string()),
            Some(updates) if updates.is_empty() => lines.push("- no update records found".to_string()),
            Some(updates) => {
                for update in updates {
                    lines.push(format!(
                        "- {}: {} - {} competitions, {} teams",
                        update.timestamp,
                        update.update_type,
                        update.competitions_processed,
                        update.teams_updated
                    ));
                }
            }
        }
        lines.push(String::new());

        lines.push("## Competition Analysis".to_string());
        for (label, count) in [
            ("With standings", self.with_standings),
            ("With stats", self.with_stats),
            ("With brackets", self.with_brackets),
        ] {
            lines.push(format!(
                "- {label}: {count}/{} ({:.1}%)",
                self.competitions,
                percentage(count, self.competitions)
            ));
        }
        lines.push(String::new());

        lines.push("## Top 10 Most Popular Competitions".to_string());
        if self.popular.is_empty() {
            lines.push("- none ranked".to_string());
        }
        for (idx, comp) in self.popular.iter().enumerate() {
            let mut features = Vec::new();
            if comp.has_standings {
                features.push("standings");
            }
            if comp.has_stats {
                features.push("stats");
            }
            let features = if features.is_empty() {
                "-".to_string()
            } else {
                features.join(", ")
            };
            lines.push(format!(
                "{}. {} | rank {} | {}",
                idx + 1,
                comp.name,
                comp.popularity_rank,
                features
            ));
        }
        lines.push(String::new());

        lines.push("## Team Distribution by Country".to_string());
        if self.team_distribution.is_empty() {
            lines.push("- no teams linked to a country".to_string());
        }
        for row in &self.team_distribution {
            lines.push(format!("- {}: {} teams", row.country, row.teams));
        }
        lines.push(String::new());

        lines.push("## Active Team-Competition Relationships".to_string());
        lines.push(format!("- Teams in active competitions: {}", self.links.teams));
        lines.push(format!(
            "- Competitions with active teams: {}",
            self.links.competitions
        ));
        lines.push(format!("- Total active relationships: {}", self.links.relations));
        lines.push(format!(
            "- Avg teams per competition: {:.1}",
            self.average_teams_per_competition()
        ));
        lines.push(String::new());

        lines.push("## Data Quality Metrics".to_string());
        let with_country = self.teams - self.teams_without_country;
        lines.push(format!(
            "- Teams with country data: {with_country}/{} ({:.1}%)",
            self.teams,
            percentage(with_country, self.teams)
        ));
        lines.push(format!(
            "- Competitions with popularity: {}/{} ({:.1}%)",
            self.with_popularity,
            self.competitions,
            percentage(self.with_popularity, self.competitions)
        ));

        lines.join("\n")
    }
}
