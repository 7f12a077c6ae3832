use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use jobtrend_sync::{DateRange, RunOptions, SyncConfig};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "jobtrend-cli")]
#[command(about = "IT job trend tracker: ingest, clean, store and aggregate job postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One pipeline pass: fetch, clean, persist, aggregate.
    Run(RunArgs),
    /// Apply schema migrations and exit.
    Migrate,
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule(RunArgs),
    /// Print recent runs and the current aggregates as markdown.
    Report {
        #[arg(long, default_value_t = 10)]
        runs: i64,
    },
    /// Serve the read-only JSON API.
    Serve {
        #[arg(long, env = "JOBTREND_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Debug, Clone, Default, clap::Args)]
struct RunArgs {
    /// Earliest posting date to keep (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Latest posting date to keep (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Source registry; defaults to `<workspace>/sources.yaml`.
    #[arg(long)]
    source_config: Option<PathBuf>,
    /// Read fixture pages instead of calling the network.
    #[arg(long)]
    fixtures: bool,
    /// Keep going with the remaining sources when one fails to fetch.
    #[arg(long)]
    allow_partial: bool,
    #[arg(long)]
    max_pages: Option<u32>,
}

impl RunArgs {
    fn options(&self) -> Result<RunOptions> {
        Ok(RunOptions {
            date_range: DateRange::new(self.from, self.to)?,
            offline: self.fixtures,
            allow_partial: self.allow_partial,
            source_config: self.source_config.clone(),
            max_pages: self.max_pages,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match dispatch(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let options = args.options()?;
            let summary =
                jobtrend_sync::run_from_config(&config, &options, cancel_on_ctrl_c()).await?;
            println!(
                "run {}: pages={} fetched={} cleaned={} rejected={} duplicates={} out_of_range={} inserted={} updated={} aggregated={}",
                summary.run_id,
                summary.pages,
                summary.fetched,
                summary.cleaned,
                summary.rejected,
                summary.duplicates,
                summary.out_of_range,
                summary.inserted,
                summary.updated,
                summary.aggregated,
            );
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
            if let Some(cause) = summary.cause() {
                eprintln!(
                    "run failed at {}: {cause}",
                    summary
                        .failed_stage()
                        .map(|s| s.to_string())
                        .unwrap_or_default()
                );
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let db = jobtrend_sync::open_database(&config).await?;
            let counts = db.entity_counts().await.context("counting rows")?;
            println!(
                "migrations applied: postings={} companies={} locations={} skills={}",
                counts.postings, counts.companies, counts.locations, counts.skills
            );
            db.close().await;
        }
        Commands::Schedule(args) => {
            let options = args.options()?;
            let cancel = cancel_on_ctrl_c();
            let mut stop = cancel.clone();
            let cron = config.sync_cron.clone();
            let Some(mut sched) =
                jobtrend_sync::maybe_build_scheduler(config, options, cancel).await?
            else {
                warn!("scheduler disabled; set JOBTREND_SCHEDULER_ENABLED=true to enable it");
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; Ctrl-C to stop");
            // Returns once Ctrl-C flips the flag or the sender is gone.
            let _ = stop.wait_for(|stopped| *stopped).await;
            if let Err(err) = sched.shutdown().await {
                warn!(error = ?err, "scheduler shutdown failed");
            }
        }
        Commands::Report { runs } => {
            let db = jobtrend_sync::open_database(&config).await?;
            let markdown = jobtrend_sync::report::report_markdown(&db, runs).await?;
            println!("{markdown}");
            db.close().await;
        }
        Commands::Serve { port } => {
            let db = jobtrend_sync::open_database(&config).await?;
            jobtrend_web::serve(db, port).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Flip to `true` on the first Ctrl-C; the pipeline stops at the next batch boundary.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling after the current batch");
            let _ = tx.send(true);
        }
    });
    rx
}
