//! Run reporting: live sinks for stage transitions and batch outcomes, plus the per-run report
//! files (`run_summary.json`, `daily_brief.md`, parquet snapshot and manifest).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use jobtrend_core::{AggregateSnapshot, Dimension, RejectedRecord, RunState};
use jobtrend_storage::Database;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::persist::BatchOutcome;
use crate::pipeline::RunSummary;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub source_id: String,
    pub page: u32,
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedRecord>,
    pub duplicates: usize,
    pub out_of_range: usize,
    pub outcome: BatchOutcome,
}

/// Sink for pipeline progress. Every method has a no-op default.
pub trait RunReporter: Send + Sync {
    fn transition(&self, _run_id: Uuid, _from: &RunState, _to: &RunState) {}

    fn batch(&self, _run_id: Uuid, _batch: &BatchReport) {}

    fn finished(&self, _summary: &RunSummary) {}
}

pub struct TracingReporter;

impl RunReporter for TracingReporter {
    fn transition(&self, run_id: Uuid, from: &RunState, to: &RunState) {
        tracing::debug!(%run_id, ?from, ?to, "run state transition");
    }

    fn batch(&self, run_id: Uuid, batch: &BatchReport) {
        for rejection in &batch.rejected {
            warn!(
                %run_id,
                source_id = %rejection.source_id,
                page = rejection.page,
                external_id = rejection.external_id.as_deref().unwrap_or("-"),
                reason = %rejection.reason,
                "record rejected"
            );
        }
        info!(
            %run_id,
            source_id = %batch.source_id,
            page = batch.page,
            fetched = batch.fetched,
            accepted = batch.accepted,
            rejected = batch.rejected.len(),
            duplicates = batch.duplicates,
            out_of_range = batch.out_of_range,
            inserted = batch.outcome.inserted,
            updated = batch.outcome.updated,
            "batch persisted"
        );
    }

    fn finished(&self, summary: &RunSummary) {
        match summary.cause() {
            None => info!(
                run_id = %summary.run_id,
                pages = summary.pages,
                fetched = summary.fetched,
                cleaned = summary.cleaned,
                rejected = summary.rejected,
                duplicates = summary.duplicates,
                inserted = summary.inserted,
                updated = summary.updated,
                aggregated = summary.aggregated,
                "run succeeded"
            ),
            Some(cause) => error!(
                run_id = %summary.run_id,
                stage = ?summary.failed_stage(),
                cause,
                inserted = summary.inserted,
                updated = summary.updated,
                "run failed"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ReportEvent {
    Transition { from: RunState, to: RunState },
    Batch(BatchReport),
    Finished(Box<RunSummary>),
}

/// Keeps every event in memory; used by tests and embedding callers that inspect a run.
#[derive(Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<ReportEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ReportEvent> {
        self.lock().clone()
    }

    /// Target states in order, starting with the first transition out of idle.
    pub fn states(&self) -> Vec<RunState> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Transition { to, .. } => Some(to.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn batches(&self) -> Vec<BatchReport> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                ReportEvent::Batch(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ReportEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunReporter for MemoryReporter {
    fn transition(&self, _run_id: Uuid, from: &RunState, to: &RunState) {
        self.lock().push(ReportEvent::Transition {
            from: from.clone(),
            to: to.clone(),
        });
    }

    fn batch(&self, _run_id: Uuid, batch: &BatchReport) {
        self.lock().push(ReportEvent::Batch(batch.clone()));
    }

    fn finished(&self, summary: &RunSummary) {
        self.lock()
            .push(ReportEvent::Finished(Box::new(summary.clone())));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Write `<reports_root>/<run_id>/…` and return that directory.
pub async fn write_run_reports(
    reports_root: &Path,
    summary: &RunSummary,
    snapshots: &[AggregateSnapshot],
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary_json =
        serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("daily_brief.md"), daily_brief(summary, snapshots))
        .await
        .context("writing daily_brief.md")?;

    export_parquet_snapshot(&run_dir, snapshots).await?;
    Ok(run_dir)
}

fn daily_brief(summary: &RunSummary, snapshots: &[AggregateSnapshot]) -> String {
    let status = match summary.cause() {
        None => "succeeded".to_string(),
        Some(cause) => format!(
            "failed at {} ({cause})",
            summary
                .failed_stage()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown stage".into())
        ),
    };

    let mut lines = vec![
        "# Job Trend Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Status: {status}"),
        format!("- Pages: {}", summary.pages),
        format!(
            "- Postings: {} fetched, {} cleaned, {} rejected, {} duplicates, {} out of range",
            summary.fetched, summary.cleaned, summary.rejected, summary.duplicates, summary.out_of_range
        ),
        format!(
            "- Store: {} inserted, {} updated, {} stale",
            summary.inserted, summary.updated, summary.stale
        ),
    ];
    for failure in &summary.fetch_failures {
        lines.push(format!(
            "- Fetch failure ({}): {}",
            failure.source_id, failure.failure
        ));
    }

    for (title, dimension) in [("Top Skills", Dimension::Skill), ("Top Cities", Dimension::City)] {
        lines.push(String::new());
        lines.push(format!("## {title}"));
        let top = top_buckets(snapshots, dimension, 10);
        if top.is_empty() {
            lines.push("- (no data)".into());
        }
        for snapshot in top {
            lines.push(format!(
                "- {}: {} ({:.1}%)",
                snapshot.bucket,
                snapshot.count,
                snapshot.percentage.unwrap_or_default()
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Highest counts first, ties by bucket name.
pub fn top_buckets(
    snapshots: &[AggregateSnapshot],
    dimension: Dimension,
    limit: usize,
) -> Vec<&AggregateSnapshot> {
    let mut rows: Vec<_> = snapshots
        .iter()
        .filter(|s| s.dimension == dimension)
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.bucket.cmp(&b.bucket)));
    rows.truncate(limit);
    rows
}

async fn export_parquet_snapshot(run_dir: &Path, snapshots: &[AggregateSnapshot]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let aggregates_path = snapshot_dir.join("aggregates.parquet");
    write_aggregates_parquet(&aggregates_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry(
            "aggregates",
            run_dir,
            &aggregates_path,
            snapshots.len(),
        )?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_aggregates_parquet(path: &Path, snapshots: &[AggregateSnapshot]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("dimension", DataType::Utf8, false),
        ArrowField::new("bucket", DataType::Utf8, false),
        ArrowField::new("count", DataType::Int64, false),
        ArrowField::new("percentage", DataType::Float64, true),
    ]));

    let dimensions = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.dimension.as_str()))
            .collect::<Vec<_>>(),
    );
    let buckets = StringArray::from(
        snapshots
            .iter()
            .map(|s| Some(s.bucket.as_str()))
            .collect::<Vec<_>>(),
    );
    let counts = Int64Array::from(snapshots.iter().map(|s| s.count).collect::<Vec<_>>());
    let percentages =
        Float64Array::from(snapshots.iter().map(|s| s.percentage).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dimensions),
            Arc::new(buckets),
            Arc::new(counts),
            Arc::new(percentages),
        ],
    )
    .context("building aggregates record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown overview of recent runs and the current top skills and cities, read from the store.
pub async fn report_markdown(db: &Database, runs: i64) -> Result<String> {
    let recent = db.recent_runs(runs).await.context("loading run history")?;
    let snapshots = db
        .query_aggregates(None)
        .await
        .context("loading aggregate snapshots")?;
    let counts = db.entity_counts().await.context("counting entities")?;

    let mut lines = vec![
        "# Job Trend Report".to_string(),
        String::new(),
        format!(
            "- Postings: {} | Companies: {} | Locations: {} | Skills: {}",
            counts.postings, counts.companies, counts.locations, counts.skills
        ),
        String::new(),
        "## Recent Runs".to_string(),
    ];
    if recent.is_empty() {
        lines.push("- (none)".into());
    }
    for run in &recent {
        let detail = match (&run.failed_stage, &run.cause) {
            (Some(stage), Some(cause)) => format!(" at {stage}: {cause}"),
            _ => String::new(),
        };
        lines.push(format!(
            "- `{}` {} → {} {}{detail}",
            run.run_id, run.started_at, run.finished_at, run.status
        ));
    }

    for (title, dimension) in [
        ("Top Skills", Dimension::Skill),
        ("Top Cities", Dimension::City),
        ("Postings per Month", Dimension::Month),
    ] {
        lines.push(String::new());
        lines.push(format!("## {title}"));
        let rows: Vec<&AggregateSnapshot> = if dimension.is_time_bucket() {
            snapshots.iter().filter(|s| s.dimension == dimension).collect()
        } else {
            top_buckets(&snapshots, dimension, 10)
        };
        if rows.is_empty() {
            lines.push("- (no data)".into());
        }
        for row in rows {
            lines.push(format!("- {}: {}", row.bucket, row.count));
        }
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}
