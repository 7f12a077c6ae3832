use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobtrend_adapters::{FetchFailure, JobSource, PageStream, SourcePage};
use jobtrend_core::{AggregateSnapshot, RejectedRecord, RunStage, RunState, StateError};
use jobtrend_storage::db::RunRecord;
use jobtrend_storage::{ArtifactStore, Database};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{AggregationEngine, AggregationError};
use crate::clean::CleaningEngine;
use crate::config::PipelineConfig;
use crate::persist::{BatchOutcome, PersistenceCoordinator, PersistenceError};
use crate::report::{write_run_reports, BatchReport, RunReporter, TracingReporter};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchFailure),
    #[error("archiving page {page}: {cause}")]
    Archive { page: u32, cause: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub failure: FetchFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<String>,
    pub pages: usize,
    pub fetched: usize,
    pub cleaned: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub out_of_range: usize,
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
    pub aggregated: usize,
    pub fetch_failures: Vec<SourceFailure>,
    pub rejections: Vec<RejectedRecord>,
    pub state: RunState,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, sources: Vec<String>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            sources,
            pages: 0,
            fetched: 0,
            cleaned: 0,
            rejected: 0,
            duplicates: 0,
            out_of_range: 0,
            inserted: 0,
            updated: 0,
            stale: 0,
            aggregated: 0,
            fetch_failures: Vec::new(),
            rejections: Vec::new(),
            state: RunState::Idle,
            reports_dir: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn cause(&self) -> Option<&str> {
        match &self.state {
            RunState::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn failed_stage(&self) -> Option<RunStage> {
        match &self.state {
            RunState::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    fn absorb(&mut self, batch: &BatchReport) {
        self.pages += 1;
        self.fetched += batch.fetched;
        self.cleaned += batch.accepted;
        self.rejected += batch.rejected.len();
        self.duplicates += batch.duplicates;
        self.out_of_range += batch.out_of_range;
        self.inserted += batch.outcome.inserted;
        self.updated += batch.outcome.updated;
        self.stale += batch.outcome.stale;
        self.rejections.extend(batch.rejected.iter().cloned());
    }

    fn to_record(&self) -> serde_json::Result<RunRecord> {
        Ok(RunRecord {
            run_id: self.run_id.to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            status: if self.succeeded() { "succeeded" } else { "failed" }.to_string(),
            failed_stage: self.failed_stage().map(|s| s.to_string()),
            cause: self.cause().map(ToString::to_string),
            summary_json: serde_json::to_string(self)?,
        })
    }
}

/// Owns the run state and fans transitions out to the reporters.
struct Tracker<'a> {
    run_id: Uuid,
    state: RunState,
    reporters: &'a [Arc<dyn RunReporter>],
}

impl Tracker<'_> {
    fn set(&mut self, next: RunState) {
        for reporter in self.reporters {
            reporter.transition(self.run_id, &self.state, &next);
        }
        self.state = next;
    }

    fn enter(&mut self, stage: RunStage) -> Result<(), StateError> {
        let next = self.state.enter(stage)?;
        self.set(next);
        Ok(())
    }

    fn ensure(&mut self, stage: RunStage) -> Result<(), StateError> {
        if self.state == (RunState::Running { stage }) {
            return Ok(());
        }
        self.enter(stage)
    }

    fn finish(&mut self, result: &Result<Vec<AggregateSnapshot>, PipelineError>) {
        let next = match result {
            Ok(_) => self.state.succeed(),
            Err(err) => self.state.fail(err.to_string()),
        };
        let next = next.unwrap_or_else(|bad| RunState::Failed {
            stage: self.state.stage().unwrap_or(RunStage::Fetching),
            cause: bad.to_string(),
        });
        self.set(next);
    }
}

/// One ingestion pass: fetch → clean → persist per page, then aggregate.
pub struct Pipeline {
    db: Database,
    cleaner: CleaningEngine,
    coordinator: PersistenceCoordinator,
    sources: Vec<Arc<dyn JobSource>>,
    config: PipelineConfig,
    artifacts: Option<ArtifactStore>,
    reporters: Vec<Arc<dyn RunReporter>>,
}

impl Pipeline {
    pub fn new(db: Database, cleaner: CleaningEngine, config: PipelineConfig) -> Self {
        Self {
            coordinator: PersistenceCoordinator::new(db.clone()),
            db,
            cleaner,
            sources: Vec::new(),
            config,
            artifacts: None,
            reporters: vec![Arc::new(TracingReporter)],
        }
    }

    pub fn with_source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Run to a terminal state. Failures are reported in the summary, never as a panic; batches
    /// committed before a failure or cancellation stay committed.
    pub async fn run(&self, cancel: watch::Receiver<bool>) -> RunSummary {
        let run_id = Uuid::new_v4();
        let sources = self
            .sources
            .iter()
            .map(|s| s.source_id().to_string())
            .collect();
        let mut summary = RunSummary::new(run_id, Utc::now(), sources);
        let mut tracker = Tracker {
            run_id,
            state: RunState::Idle,
            reporters: &self.reporters,
        };

        let span = info_span!("pipeline_run", %run_id);
        let result = self
            .drive(&mut tracker, &mut summary, &cancel)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            error!(%run_id, error = %err, "pipeline run failed");
        }
        tracker.finish(&result);
        summary.state = tracker.state.clone();
        summary.finished_at = Utc::now();

        if let Some(dir) = &self.config.reports_dir {
            let snapshots = result.as_deref().unwrap_or(&[]);
            match write_run_reports(dir, &summary, snapshots).await {
                Ok(path) => summary.reports_dir = Some(path.display().to_string()),
                Err(err) => warn!(%run_id, error = ?err, "writing run reports failed"),
            }
        }

        match summary.to_record() {
            Ok(record) => {
                if let Err(err) = self.db.record_run(&record).await {
                    warn!(%run_id, error = %err, "recording run history failed");
                }
            }
            Err(err) => warn!(%run_id, error = %err, "serializing run summary failed"),
        }

        for reporter in &self.reporters {
            reporter.finished(&summary);
        }
        summary
    }

    async fn drive(
        &self,
        tracker: &mut Tracker<'_>,
        summary: &mut RunSummary,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<AggregateSnapshot>, PipelineError> {
        'sources: for source in &self.sources {
            let mut stream = PageStream::new(
                source.clone(),
                self.config.backoff,
                self.config.cursor,
                self.config.max_pages,
            )
            .for_run(summary.run_id)
            .with_page_delay(self.config.page_delay);

            loop {
                tracker.ensure(RunStage::Fetching)?;
                if *cancel.borrow() {
                    return Err(PipelineError::Cancelled);
                }

                let page = match stream.next_page().await {
                    None => break,
                    Some(Ok(page)) => page,
                    Some(Err(failure)) => {
                        summary.fetch_failures.push(SourceFailure {
                            source_id: source.source_id().to_string(),
                            failure: failure.clone(),
                        });
                        if self.config.allow_partial {
                            warn!(
                                source_id = source.source_id(),
                                page = failure.page,
                                cause = %failure.cause,
                                "fetch failed; continuing with partial data"
                            );
                            continue 'sources;
                        }
                        return Err(failure.into());
                    }
                };
                self.archive(&page).await?;

                tracker.enter(RunStage::Cleaning)?;
                let cleaned = self.cleaner.clean_batch(&page.records);
                let before = cleaned.accepted.len();
                let in_range: Vec<_> = cleaned
                    .accepted
                    .into_iter()
                    .filter(|r| self.config.date_range.contains(r.posted_on))
                    .collect();

                tracker.enter(RunStage::Persisting)?;
                let outcome: BatchOutcome = self.coordinator.apply_batch(&in_range).await?;

                let report = BatchReport {
                    source_id: page.source_id.clone(),
                    page: page.page,
                    fetched: page.records.len(),
                    accepted: in_range.len(),
                    rejected: cleaned.rejected,
                    duplicates: cleaned.duplicates,
                    out_of_range: before - in_range.len(),
                    outcome,
                };
                summary.absorb(&report);
                for reporter in &self.reporters {
                    reporter.batch(summary.run_id, &report);
                }
            }
        }

        tracker.ensure(RunStage::Fetching)?;
        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }
        tracker.enter(RunStage::Aggregating)?;
        let snapshots = AggregationEngine::materialize(&self.db).await?;
        summary.aggregated = snapshots.len();
        info!(
            run_id = %summary.run_id,
            pages = summary.pages,
            inserted = summary.inserted,
            updated = summary.updated,
            rejected = summary.rejected,
            aggregated = summary.aggregated,
            "pipeline run complete"
        );
        Ok(snapshots)
    }

    async fn archive(&self, page: &SourcePage) -> Result<(), PipelineError> {
        let Some(store) = &self.artifacts else {
            return Ok(());
        };
        if page.body.is_empty() {
            return Ok(());
        }
        store
            .archive_page(page.fetched_at, &page.source_id, page.page, &page.body)
            .await
            .map(|_| ())
            .map_err(|err| PipelineError::Archive {
                page: page.page,
                cause: format!("{err:#}"),
            })
    }
}
