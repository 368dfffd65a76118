use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scoresync_adapters::Unthrottled;
use scoresync_storage::Store;
use scoresync_sync::{
    api_from_config, AppConfig, DatabaseReport, SyncPipeline, SyncRunSummary, ValidationReport,
};

#[derive(Debug, Parser)]
#[command(name = "scoresync")]
#[command(about = "Sync sports metadata from the upstream scores API into SQLite")]
struct Cli {
    /// SQLite database file (overrides SCORESYNC_DB_PATH).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// YAML file with api/policy/thresholds sections (overrides SCORESYNC_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Replay captured payloads from this directory instead of calling the API.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database file and every table.
    CreateSchema,
    /// Load the full competitions listing, then teams for the top competitions.
    Populate,
    /// Refresh current-season teams of the most popular competitions.
    Update,
    /// Print a Markdown summary of the database contents.
    Report {
        /// Write Markdown here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check table presence, minimum counts, orphans and update recency.
    Validate {
        /// Exit non-zero when any check fails.
        #[arg(long)]
        strict: bool,
    },
}

fn pipeline(config: &AppConfig, store: Store, fixtures: Option<PathBuf>) -> Result<SyncPipeline> {
    let api = api_from_config(&config.api, fixtures.as_deref())?;
    let pipeline = SyncPipeline::new(store, api, config.policy.clone());
    // Replayed fixtures need no pacing.
    Ok(match fixtures {
        Some(_) => pipeline.with_gate(Box::new(Unthrottled)),
        None => pipeline,
    })
}

fn print_summary(label: &str, summary: &SyncRunSummary) {
    println!(
        "{label} complete: run_id={} competitions={} updated={} teams={} soft_failures={}",
        summary.run_id,
        summary.competitions_considered(),
        summary.competitions_updated(),
        summary.teams_updated(),
        summary.soft_failures()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command.unwrap_or(Commands::Update) {
        Commands::CreateSchema => {
            let store = Store::create(&config.db_path).await?;
            println!("schema ready at {}", config.db_path.display());
            store.close().await;
        }
        Commands::Populate => {
            let store = Store::open(&config.db_path).await?;
            let summary = pipeline(&config, store.clone(), cli.fixtures)?
                .run_full_population()
                .await?;
            println!(
                "listing stored: sports={} countries={} competitions={}",
                summary.sports_upserted, summary.countries_upserted, summary.competitions_upserted
            );
            print_summary("population", &summary);
            store.close().await;
        }
        Commands::Update => {
            let store = Store::open(&config.db_path).await?;
            let summary = pipeline(&config, store.clone(), cli.fixtures)?
                .run_daily_update()
                .await?;
            print_summary("update", &summary);
            store.close().await;
        }
        Commands::Report { output } => {
            let store = Store::open(&config.db_path).await?;
            let markdown = DatabaseReport::collect(&store).await?.to_markdown();
            store.close().await;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, format!("{markdown}\n"))
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("report written to {}", path.display());
                }
                None => println!("{markdown}"),
            }
        }
        Commands::Validate { strict } => {
            let store = Store::open(&config.db_path).await?;
            let report = ValidationReport::run(&store, &config.thresholds).await?;
            store.close().await;
            println!("{}", report.to_markdown());
            if strict && !report.passed() {
                let failed: Vec<&str> = report.failures().map(|c| c.id.as_str()).collect();
                bail!("validation failed: {}", failed.join(", "));
            }
        }
    }

    Ok(())
}
