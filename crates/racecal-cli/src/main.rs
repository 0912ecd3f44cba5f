use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use racecal_core::RaceType;
use racecal_sync::{maybe_build_scheduler, sync_window, Services, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "racecal")]
#[command(about = "Race schedule aggregation and calendar sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the sync scheduler when enabled).
    Serve,
    /// Publish stored races to the calendar.
    Reconcile {
        /// Limit to one race type; all race types otherwise.
        #[arg(long)]
        race_type: Option<RaceType>,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        finish: Option<NaiveDate>,
    },
    /// Scrape places and races from the configured source into storage.
    Refresh {
        #[arg(long)]
        race_type: RaceType,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        finish: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let services = Services::from_config(&config)
        .await
        .with_context(|| format!("loading services from {}", config.sources_file.display()))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(&config, services.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, window_days = config.sync_window_days, "scheduler started");
            }
            racecal_web::serve(config.web_port, services).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Reconcile {
            race_type,
            start,
            finish,
        } => {
            let (default_start, default_finish) = sync_window(Local::now().date_naive(), config.sync_window_days);
            let (start, finish) = (start.unwrap_or(default_start), finish.unwrap_or(default_finish));
            check_range(start, finish)?;
            let summaries = match race_type {
                Some(race_type) => vec![services.reconcile_calendar(race_type, start, finish).await?],
                None => services.reconcile_all(start, finish).await,
            };
            for s in &summaries {
                match &s.error {
                    Some(err) => println!("{}: failed: {err}", s.race_type),
                    None => println!(
                        "{}: fetched={} published={} deleted={} upserted={}",
                        s.race_type, s.fetched, s.published, s.deleted, s.upserted
                    ),
                }
            }
        }
        Commands::Refresh {
            race_type,
            start,
            finish,
        } => {
            check_range(start, finish)?;
            let places = services.refresh_places(race_type, start, finish).await?;
            let races = services.refresh_races(race_type, start, finish).await?;
            println!("refresh complete: race_type={race_type} places={places} races={races}");
        }
    }

    Ok(())
}

fn check_range(start: NaiveDate, finish: NaiveDate) -> Result<()> {
    if finish < start {
        bail!("finish {finish} is before start {start}");
    }
    Ok(())
}
