//! Pipeline orchestration: cleaning, persistence, aggregation and run reporting, plus the glue
//! that assembles a [`Pipeline`] from environment configuration and `sources.yaml`.

pub mod aggregate;
pub mod clean;
pub mod config;
pub mod persist;
pub mod pipeline;
pub mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobtrend_storage::{ArtifactStore, Database, HttpClientConfig, HttpFetcher};
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use aggregate::{AggregationEngine, AggregationError};
pub use clean::{CleaningEngine, CleaningOutcome, LocationTable, SkillMatcher};
pub use config::{DateRange, PipelineConfig, SourceRegistry, SyncConfig};
pub use persist::{BatchOutcome, PersistenceCoordinator, PersistenceError};
pub use pipeline::{Pipeline, PipelineError, RunSummary};
pub use report::{BatchReport, MemoryReporter, RunReporter, TracingReporter};

pub const CRATE_NAME: &str = "jobtrend-sync";

/// Per-invocation overrides on top of [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub date_range: DateRange,
    /// Read every source from its fixture pages instead of the network.
    pub offline: bool,
    pub allow_partial: bool,
    pub source_config: Option<PathBuf>,
    pub max_pages: Option<u32>,
}

/// Open (and migrate) the configured database.
pub async fn open_database(config: &SyncConfig) -> Result<Database> {
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    db.migrate().await.context("applying migrations")?;
    Ok(db)
}

/// Assemble a pipeline over every enabled source in the registry.
pub fn build_pipeline(db: Database, config: &SyncConfig, options: &RunOptions) -> Result<Pipeline> {
    let sources_path = options
        .source_config
        .clone()
        .unwrap_or_else(|| config.sources_path());
    let registry = SourceRegistry::load(&sources_path)?;

    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })
        .context("building http client")?,
    );
    let cleaner = CleaningEngine::from_rules_dir(&config.rules_dir())?;

    let enabled: Vec<_> = registry.enabled().collect();
    if enabled.is_empty() {
        bail!("no enabled sources in {}", sources_path.display());
    }
    // One page delay for the whole run: the slowest source's.
    let page_delay = enabled
        .iter()
        .map(|s| s.page_delay())
        .max()
        .unwrap_or_default();

    let pipeline_config = PipelineConfig {
        max_pages: options.max_pages.or(config.max_pages),
        date_range: options.date_range,
        allow_partial: options.allow_partial || config.allow_partial,
        page_delay: if options.offline { Duration::ZERO } else { page_delay },
        reports_dir: Some(config.reports_dir()),
        ..PipelineConfig::default()
    };

    let mut pipeline = Pipeline::new(db, cleaner, pipeline_config)
        .with_artifacts(ArtifactStore::new(config.artifacts_dir.clone()));
    for source in enabled {
        let built = source
            .build(
                http.clone(),
                &config.workspace_root,
                &options.date_range,
                options.offline,
            )
            .with_context(|| format!("building source {}", source.source_id))?;
        pipeline = pipeline.with_source(built);
    }
    Ok(pipeline)
}

/// One full pass from configuration. Errors here are setup failures; a run that starts always
/// comes back as a [`RunSummary`], failed or not.
pub async fn run_from_config(
    config: &SyncConfig,
    options: &RunOptions,
    cancel: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let db = open_database(config).await?;
    let pipeline = build_pipeline(db.clone(), config, options)?;
    let summary = pipeline.run(cancel).await;
    db.close().await;
    Ok(summary)
}

/// Cron-triggered runs, or `None` while `JOBTREND_SCHEDULER_ENABLED` is off. A trigger that
/// fires while the previous run is still going is skipped.
pub async fn maybe_build_scheduler(
    config: SyncConfig,
    options: RunOptions,
    cancel: watch::Receiver<bool>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let shared = Arc::new((config, options, cancel));
    let busy = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let shared = shared.clone();
        let busy = busy.clone();
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                warn!("previous scheduled run still in progress; skipping trigger");
                return;
            };
            let (config, options, cancel) = &*shared;
            match run_from_config(config, options, cancel.clone()).await {
                Ok(summary) if summary.succeeded() => {
                    info!(run_id = %summary.run_id, "scheduled run succeeded")
                }
                Ok(summary) => warn!(
                    run_id = %summary.run_id,
                    cause = summary.cause().unwrap_or_default(),
                    "scheduled run failed"
                ),
                Err(err) => warn!(error = ?err, "scheduled run could not start"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_config(scheduler_enabled: bool) -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".into(),
            workspace_root: PathBuf::from("."),
            artifacts_dir: PathBuf::from("artifacts"),
            scheduler_enabled,
            sync_cron: config::DEFAULT_SYNC_CRON.to_string(),
            user_agent: "jobtrend-test".into(),
            http_timeout_secs: 5,
            max_pages: None,
            allow_partial: false,
        }
    }

    #[tokio::test]
    async fn scheduler_is_not_built_while_disabled() {
        let (_tx, rx) = watch::channel(false);
        let sched = maybe_build_scheduler(sync_config(false), RunOptions::default(), rx)
            .await
            .unwrap();
        assert!(sched.is_none());
    }
}
