use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobtrend_adapters::{FetchContext, FixtureSource, JobSource, SourceError, SourcePage};
use jobtrend_core::{Dimension, PostingStatus, RawPosting, RawRecord, RunStage, RunState};
use jobtrend_storage::{BackoffPolicy, Database};
use jobtrend_sync::{
    CleaningEngine, MemoryReporter, PersistenceCoordinator, Pipeline, PipelineConfig, RunSummary,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("timestamp")
        .with_timezone(&Utc)
}

fn write_page(dir: &Path, page: u32, results: Value) {
    std::fs::create_dir_all(dir).expect("fixture dir");
    let body = json!({ "count": 0, "results": results });
    std::fs::write(
        dir.join(format!("page-{page}.json")),
        serde_json::to_vec_pretty(&body).expect("json"),
    )
    .expect("write page");
}

fn posting(id: &str, title: &str, company: &str, location: &str, created: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "description": "Team mit Python und SQL.",
        "company": { "display_name": company },
        "location": { "display_name": location },
        "category": { "label": "IT-Stellen" },
        "created": created,
    })
}

struct Harness {
    _tmp: TempDir,
    root: std::path::PathBuf,
    db: Database,
}

impl Harness {
    async fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let db = Database::open_file(root.join("jobtrend.db"))
            .await
            .expect("open db");
        db.migrate().await.expect("migrate");
        Self {
            _tmp: tmp,
            root,
            db,
        }
    }

    fn fixture_dir(&self, name: &str) -> std::path::PathBuf {
        self.root.join("fixtures").join(name)
    }

    fn source(&self, name: &str, fetched_at: &str) -> Arc<dyn JobSource> {
        Arc::new(FixtureSource::new("adzuna", self.fixture_dir(name)).with_fetched_at(ts(fetched_at)))
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with(PipelineConfig::default())
    }

    fn pipeline_with(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            self.db.clone(),
            CleaningEngine::builtin().expect("builtin rules"),
            config,
        )
    }
}

async fn run(pipeline: &Pipeline) -> RunSummary {
    let (_tx, rx) = watch::channel(false);
    pipeline.run(rx).await
}

struct FailingSource;

#[async_trait]
impl JobSource for FailingSource {
    fn source_id(&self) -> &str {
        "broken"
    }

    async fn fetch_page(&self, _ctx: &FetchContext, _page: u32) -> Result<SourcePage, SourceError> {
        Err(SourceError::Fatal("HTTP 401 Unauthorized".into()))
    }
}

#[tokio::test]
async fn berlin_variants_and_munich_resolve_to_one_company_two_locations() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("cities"),
        1,
        json!([
            posting("a-1", "Python Entwickler", "Acme GmbH", "Berlin", "2025-09-01"),
            posting("a-2", "Data Engineer", "ACME  gmbh ", "berlin ", "2025-09-02"),
            posting("a-3", "Backend Developer", "acme GmbH", "Munich", "2025-09-03"),
        ]),
    );
    let pipeline = h.pipeline().with_source(h.source("cities", "2025-09-08T22:30:00Z"));

    let first = run(&pipeline).await;
    assert!(first.succeeded(), "{:?}", first.cause());
    assert_eq!(first.inserted, 3);

    let counts = h.db.entity_counts().await.unwrap();
    assert_eq!(counts.postings, 3);
    assert_eq!(counts.companies, 1);
    assert_eq!(counts.locations, 2);
    let names: Vec<_> = h
        .db
        .locations()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.name)
        .collect();
    assert_eq!(names, vec!["Berlin".to_string(), "München".to_string()]);

    let second = run(&pipeline).await;
    assert!(second.succeeded());
    assert_eq!((second.inserted, second.updated), (0, 3));
    assert_eq!(h.db.entity_counts().await.unwrap(), counts);
}

#[tokio::test]
async fn rerunning_identical_input_leaves_store_unchanged() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("same"),
        1,
        json!([
            posting("i-1", "Python Developer", "Nordlicht", "Hamburg", "2025-09-01"),
            posting("i-2", "Java Entwickler", "Elbwerk", "Köln", "2025-09-04"),
        ]),
    );
    write_page(
        &h.fixture_dir("same"),
        2,
        json!([posting("i-3", "Rust Engineer", "Nordlicht", "Berlin", "2025-09-05")]),
    );
    let pipeline = h.pipeline().with_source(h.source("same", "2025-09-08T22:30:00Z"));

    assert!(run(&pipeline).await.succeeded());
    let counts = h.db.entity_counts().await.unwrap();
    let aggregates = h.db.query_aggregates(None).await.unwrap();
    let mut rows = Vec::new();
    for id in ["i-1", "i-2", "i-3"] {
        let posting = h.db.find_by_external_id(id).await.unwrap().expect("posting");
        let skills = h.db.posting_skills(posting.id).await.unwrap();
        rows.push((posting, skills));
    }

    let again = run(&pipeline).await;
    assert!(again.succeeded());
    assert_eq!(again.pages, 2);
    assert_eq!(h.db.entity_counts().await.unwrap(), counts);
    assert_eq!(h.db.query_aggregates(None).await.unwrap(), aggregates);
    for (before, skills) in rows {
        let after = h
            .db
            .find_by_external_id(&before.external_id)
            .await
            .unwrap()
            .expect("posting");
        assert_eq!(after, before);
        assert_eq!(h.db.posting_skills(after.id).await.unwrap(), skills);
    }
}

#[tokio::test]
async fn repeated_external_ids_across_pages_stay_unique() {
    let h = Harness::new().await;
    let dir = h.fixture_dir("dupes");
    write_page(
        &dir,
        1,
        json!([
            posting("d-1", "Python Dev", "Acme", "Berlin", "2025-09-01"),
            posting("d-1", "Python Dev (Senior)", "Acme", "Berlin", "2025-09-01"),
        ]),
    );
    write_page(
        &dir,
        2,
        json!([posting("d-1", "Python Dev (Lead)", "Acme", "Berlin", "2025-09-01")]),
    );
    let pipeline = h.pipeline().with_source(h.source("dupes", "2025-09-08T22:30:00Z"));

    let summary = run(&pipeline).await;
    assert!(summary.succeeded());
    assert_eq!(summary.duplicates, 1);
    assert_eq!(h.db.entity_counts().await.unwrap().postings, 1);
    let stored = h.db.find_by_external_id("d-1").await.unwrap().unwrap();
    assert_eq!(stored.title, "Python Dev (Lead)");
}

#[tokio::test]
async fn refetch_updates_status_and_keeps_first_seen() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("day1"),
        1,
        json!([posting("r-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );
    let mut expired = posting("r-1", "Python Dev", "Acme", "Berlin", "2025-09-01");
    expired["status"] = json!("expired");
    write_page(&h.fixture_dir("day2"), 1, json!([expired]));

    let day1 = h.pipeline().with_source(h.source("day1", "2025-09-01T22:30:00Z"));
    assert!(run(&day1).await.succeeded());
    let day2 = h.pipeline().with_source(h.source("day2", "2025-09-02T22:30:00Z"));
    let summary = run(&day2).await;
    assert!(summary.succeeded());
    assert_eq!(summary.updated, 1);

    let stored = h.db.find_by_external_id("r-1").await.unwrap().unwrap();
    assert_eq!(stored.status, PostingStatus::Expired);
    assert_eq!(stored.first_seen_at, ts("2025-09-01T22:30:00Z"));
    assert_eq!(stored.retrieved_at, ts("2025-09-02T22:30:00Z"));

    // Replaying the older page does not resurrect the posting.
    let replay = run(&day1).await;
    assert_eq!(replay.stale, 1);
    let stored = h.db.find_by_external_id("r-1").await.unwrap().unwrap();
    assert_eq!(stored.status, PostingStatus::Expired);
}

#[tokio::test]
async fn undated_posting_keeps_its_first_posting_date() {
    let h = Harness::new().await;
    let mut undated = posting("u-1", "Python Dev", "Acme", "Berlin", "");
    undated
        .as_object_mut()
        .expect("posting object")
        .remove("created");
    write_page(&h.fixture_dir("undated"), 1, json!([undated]));

    let september = h.pipeline().with_source(h.source("undated", "2025-09-01T22:30:00Z"));
    assert!(run(&september).await.succeeded());
    let october = h.pipeline().with_source(h.source("undated", "2025-10-05T22:30:00Z"));
    let summary = run(&october).await;
    assert!(summary.succeeded());
    assert_eq!(summary.updated, 1);

    let stored = h.db.find_by_external_id("u-1").await.unwrap().unwrap();
    assert_eq!(stored.posted_on, NaiveDate::from_ymd_opt(2025, 9, 1).unwrap());
    assert_eq!(stored.first_seen_at, ts("2025-09-01T22:30:00Z"));
    assert_eq!(stored.retrieved_at, ts("2025-10-05T22:30:00Z"));
    let months: Vec<_> = h
        .db
        .query_aggregates(Some(Dimension::Month))
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.bucket, r.count))
        .collect();
    assert_eq!(months, vec![("2025-09".to_string(), 1)]);

    // A date supplied by the source still replaces the stored one.
    write_page(
        &h.fixture_dir("dated"),
        1,
        json!([posting("u-1", "Python Dev", "Acme", "Berlin", "2025-10-03")]),
    );
    let dated = h.pipeline().with_source(h.source("dated", "2025-10-06T22:30:00Z"));
    assert!(run(&dated).await.succeeded());
    let stored = h.db.find_by_external_id("u-1").await.unwrap().unwrap();
    assert_eq!(stored.posted_on, NaiveDate::from_ymd_opt(2025, 10, 3).unwrap());
}

#[tokio::test]
async fn stale_replay_adds_no_companies_or_locations() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("newer"),
        1,
        json!([posting("o-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );
    write_page(
        &h.fixture_dir("older"),
        1,
        json!([posting("o-1", "Python Dev", "Altfirma KG", "Hamburg", "2025-09-01")]),
    );

    let newer = h.pipeline().with_source(h.source("newer", "2025-09-05T22:30:00Z"));
    assert!(run(&newer).await.succeeded());
    let before = h.db.entity_counts().await.unwrap();

    let older = h.pipeline().with_source(h.source("older", "2025-09-02T22:30:00Z"));
    let summary = run(&older).await;
    assert!(summary.succeeded());
    assert_eq!(summary.stale, 1);

    let after = h.db.entity_counts().await.unwrap();
    assert_eq!(after.companies, 1);
    assert_eq!(after.locations, 1);
    assert_eq!(after, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_over_the_same_ids_serialize() {
    let h = Harness::new().await;
    let fetched_at = ts("2025-09-08T22:30:00Z");
    let raw: Vec<RawRecord> = (0..200)
        .map(|i| {
            let mut p = RawPosting::empty("adzuna", 1, fetched_at);
            p.external_id = Some(format!("cc-{i:03}"));
            p.title = Some("Python Entwickler".into());
            p.company = Some(format!("Firma {}", i % 7));
            p.location = Some("Berlin".into());
            p.posted_at = Some("2025-09-01".into());
            RawRecord::Posting(p)
        })
        .collect();
    let records = Arc::new(
        CleaningEngine::builtin()
            .expect("builtin rules")
            .clean_batch(&raw)
            .accepted,
    );
    assert_eq!(records.len(), 200);

    let writers: Vec<_> = (0..6)
        .map(|_| {
            let coordinator = PersistenceCoordinator::new(h.db.clone());
            let records = records.clone();
            tokio::spawn(async move { coordinator.apply_batch(&records).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for writer in writers {
        let outcome = writer.await.expect("join writer").expect("batch applied");
        outcomes.push((outcome.inserted, outcome.updated));
    }
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec![(0, 200), (0, 200), (0, 200), (0, 200), (0, 200), (200, 0)]
    );

    let counts = h.db.entity_counts().await.unwrap();
    assert_eq!(counts.postings, 200);
    assert_eq!(counts.companies, 7);
    assert_eq!(counts.locations, 1);
    assert_eq!(counts.posting_skills, 200);
}

#[tokio::test]
async fn rejected_records_do_not_fail_the_run() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("messy"),
        1,
        json!([
            posting("m-1", "Python Dev", "Acme", "Berlin", "2025-09-01"),
            { "id": "m-2", "company": { "display_name": "Acme" } },
            posting("m-3", "SQL Analyst", "Acme", "Berlin", "not-a-date"),
            "broken-entry",
        ]),
    );
    let reporter = MemoryReporter::new();
    let pipeline = h
        .pipeline()
        .with_source(h.source("messy", "2025-09-08T22:30:00Z"))
        .with_reporter(reporter.clone());

    let summary = run(&pipeline).await;
    assert!(summary.succeeded());
    assert_eq!(summary.fetched, 4);
    assert_eq!(summary.cleaned, 1);
    assert_eq!(summary.rejected, 3);
    assert_eq!(summary.rejections.len(), 3);
    assert_eq!(reporter.batches()[0].rejected.len(), 3);
    assert_eq!(h.db.entity_counts().await.unwrap().postings, 1);
}

#[tokio::test]
async fn failed_batch_rolls_back_and_keeps_earlier_batches() {
    let h = Harness::new().await;
    let dir = h.fixture_dir("boom");
    write_page(
        &dir,
        1,
        json!([posting("b-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );
    write_page(
        &dir,
        2,
        json!([
            posting("b-2", "Java Dev", "Brandneu AG", "Hamburg", "2025-09-02"),
            posting("b-3", "boom", "Acme", "Berlin", "2025-09-02"),
        ]),
    );
    sqlx::query(
        "CREATE TRIGGER fail_boom BEFORE INSERT ON postings WHEN NEW.title = 'boom' \
         BEGIN SELECT RAISE(ABORT, 'boom'); END;",
    )
    .execute(h.db.pool())
    .await
    .expect("trigger");

    let pipeline = h.pipeline().with_source(h.source("boom", "2025-09-08T22:30:00Z"));
    let summary = run(&pipeline).await;

    assert!(!summary.succeeded());
    assert_eq!(summary.failed_stage(), Some(RunStage::Persisting));
    assert!(summary.cause().unwrap_or_default().contains("b-3"));
    assert!(h.db.find_by_external_id("b-1").await.unwrap().is_some());
    assert!(h.db.find_by_external_id("b-2").await.unwrap().is_none());
    let counts = h.db.entity_counts().await.unwrap();
    assert_eq!(counts.postings, 1);
    assert_eq!(counts.companies, 1);

    let runs = h.db.recent_runs(5).await.unwrap();
    assert_eq!(runs[0].status, "failed");
    assert_eq!(runs[0].failed_stage.as_deref(), Some("persisting"));
}

#[tokio::test]
async fn partial_fetch_policy() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("ok"),
        1,
        json!([posting("p-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );

    let strict = h
        .pipeline()
        .with_source(Arc::new(FailingSource))
        .with_source(h.source("ok", "2025-09-08T22:30:00Z"));
    let summary = run(&strict).await;
    assert_eq!(summary.failed_stage(), Some(RunStage::Fetching));
    assert_eq!(summary.fetch_failures.len(), 1);
    assert_eq!(h.db.entity_counts().await.unwrap().postings, 0);

    let lenient = h
        .pipeline_with(PipelineConfig {
            allow_partial: true,
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..PipelineConfig::default()
        })
        .with_source(Arc::new(FailingSource))
        .with_source(h.source("ok", "2025-09-08T22:30:00Z"));
    let summary = run(&lenient).await;
    assert!(summary.succeeded());
    assert_eq!(summary.fetch_failures.len(), 1);
    assert_eq!(summary.fetch_failures[0].source_id, "broken");
    assert_eq!(summary.inserted, 1);
}

#[tokio::test]
async fn time_buckets_sum_to_the_posting_total() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("spread"),
        1,
        json!([
            posting("t-1", "Python Dev", "Acme", "Berlin", "2024-12-30"),
            posting("t-2", "Python Dev", "Acme", "Berlin", "2025-01-02"),
            posting("t-3", "SQL Dev", "Acme", "Hamburg", "2025-01-20"),
            posting("t-4", "Go Dev", "Acme", "Atlantis", "2025-02-11"),
        ]),
    );
    let pipeline = h.pipeline().with_source(h.source("spread", "2025-02-12T22:30:00Z"));
    assert!(run(&pipeline).await.succeeded());

    let total = h.db.entity_counts().await.unwrap().postings;
    for dimension in [Dimension::Day, Dimension::Week, Dimension::Month] {
        let rows = h.db.query_aggregates(Some(dimension)).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.count).sum::<i64>(), total, "{dimension}");
    }
    let cities = h.db.query_aggregates(Some(Dimension::City)).await.unwrap();
    assert!(cities.iter().any(|r| r.bucket == "unknown" && r.count == 1));
}

#[tokio::test]
async fn date_range_filters_postings_out_of_window() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("window"),
        1,
        json!([
            posting("w-1", "Python Dev", "Acme", "Berlin", "2025-08-31"),
            posting("w-2", "Python Dev", "Acme", "Berlin", "2025-09-03"),
        ]),
    );
    let range = jobtrend_sync::DateRange::new(
        Some("2025-09-01".parse().unwrap()),
        Some("2025-09-07".parse().unwrap()),
    )
    .unwrap();
    let pipeline = h
        .pipeline_with(PipelineConfig {
            date_range: range,
            ..PipelineConfig::default()
        })
        .with_source(h.source("window", "2025-09-08T22:30:00Z"));

    let summary = run(&pipeline).await;
    assert_eq!(summary.out_of_range, 1);
    assert_eq!(summary.inserted, 1);
    assert!(h.db.find_by_external_id("w-1").await.unwrap().is_none());
}

#[tokio::test]
async fn empty_source_aggregates_to_nothing() {
    let h = Harness::new().await;
    let reporter = MemoryReporter::new();
    let pipeline = h
        .pipeline()
        .with_source(h.source("missing", "2025-09-08T22:30:00Z"))
        .with_reporter(reporter.clone());

    let summary = run(&pipeline).await;
    assert!(summary.succeeded());
    assert_eq!(summary.aggregated, 0);
    assert!(h.db.query_aggregates(None).await.unwrap().is_empty());
    assert_eq!(
        reporter.states(),
        vec![
            RunState::Running { stage: RunStage::Fetching },
            RunState::Running { stage: RunStage::Aggregating },
            RunState::Succeeded,
        ]
    );
}

#[tokio::test]
async fn reporter_sees_every_stage_per_page() {
    let h = Harness::new().await;
    let dir = h.fixture_dir("two");
    write_page(&dir, 1, json!([posting("s-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]));
    write_page(&dir, 2, json!([posting("s-2", "Rust Dev", "Acme", "Berlin", "2025-09-02")]));
    let reporter = MemoryReporter::new();
    let pipeline = h
        .pipeline()
        .with_source(h.source("two", "2025-09-08T22:30:00Z"))
        .with_reporter(reporter.clone());

    assert!(run(&pipeline).await.succeeded());
    let running = |stage| RunState::Running { stage };
    assert_eq!(
        reporter.states(),
        vec![
            running(RunStage::Fetching),
            running(RunStage::Cleaning),
            running(RunStage::Persisting),
            running(RunStage::Fetching),
            running(RunStage::Cleaning),
            running(RunStage::Persisting),
            running(RunStage::Fetching),
            running(RunStage::Aggregating),
            RunState::Succeeded,
        ]
    );
    assert_eq!(reporter.batches().len(), 2);
}

#[tokio::test]
async fn cancellation_before_the_first_page_fails_at_fetching() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("cancel"),
        1,
        json!([posting("c-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );
    let pipeline = h.pipeline().with_source(h.source("cancel", "2025-09-08T22:30:00Z"));
    let (tx, rx) = watch::channel(false);
    tx.send(true).expect("send cancel");

    let summary = pipeline.run(rx).await;
    assert_eq!(summary.failed_stage(), Some(RunStage::Fetching));
    assert_eq!(summary.cause(), Some("run cancelled"));
    assert_eq!(h.db.entity_counts().await.unwrap().postings, 0);
}

#[tokio::test]
async fn run_reports_are_written_per_run() {
    let h = Harness::new().await;
    write_page(
        &h.fixture_dir("reports"),
        1,
        json!([posting("x-1", "Python Dev", "Acme", "Berlin", "2025-09-01")]),
    );
    let reports = h.root.join("reports");
    let pipeline = h
        .pipeline_with(PipelineConfig {
            reports_dir: Some(reports.clone()),
            ..PipelineConfig::default()
        })
        .with_source(h.source("reports", "2025-09-08T22:30:00Z"));

    let summary = run(&pipeline).await;
    assert!(summary.succeeded());
    let run_dir = reports.join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir, Some(run_dir.display().to_string()));
    for file in [
        "run_summary.json",
        "daily_brief.md",
        "snapshots/aggregates.parquet",
        "snapshots/manifest.json",
    ] {
        assert!(run_dir.join(file).exists(), "{file}");
    }
    let brief = std::fs::read_to_string(run_dir.join("daily_brief.md")).unwrap();
    assert!(brief.contains("- Python: 1"));
    assert!(brief.contains("- Berlin: 1"));
}

#[tokio::test]
async fn offline_run_from_workspace_config() {
    let repo = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let tmp = tempfile::tempdir().unwrap();
    let ws = tmp.path();
    std::fs::create_dir_all(ws.join("rules")).unwrap();
    std::fs::create_dir_all(ws.join("fixtures/adzuna/sample")).unwrap();
    for file in [
        "sources.yaml",
        "rules/skills.yaml",
        "rules/locations.yaml",
        "fixtures/adzuna/sample/page-1.json",
        "fixtures/adzuna/sample/page-2.json",
    ] {
        std::fs::copy(repo.join(file), ws.join(file)).unwrap();
    }

    let config = jobtrend_sync::SyncConfig {
        database_url: format!("sqlite://{}", ws.join("jobtrend.db").display()),
        workspace_root: ws.to_path_buf(),
        artifacts_dir: ws.join("artifacts"),
        scheduler_enabled: false,
        sync_cron: jobtrend_sync::config::DEFAULT_SYNC_CRON.to_string(),
        user_agent: "jobtrend-test".into(),
        http_timeout_secs: 5,
        max_pages: None,
        allow_partial: false,
    };
    let options = jobtrend_sync::RunOptions {
        offline: true,
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(false);
    let summary = jobtrend_sync::run_from_config(&config, &options, rx)
        .await
        .unwrap();

    assert!(summary.succeeded(), "{:?}", summary.cause());
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.rejected, 2);
    assert_eq!((summary.inserted, summary.updated), (6, 1));
    assert!(ws.join("artifacts").exists());
    assert!(ws
        .join("reports")
        .join(summary.run_id.to_string())
        .join("daily_brief.md")
        .exists());

    let db = Database::open_file(ws.join("jobtrend.db")).await.unwrap();
    let counts = db.entity_counts().await.unwrap();
    assert_eq!(counts.companies, 4);
    assert_eq!(counts.locations, 5);
    let munich = db.find_by_external_id("5123456002").await.unwrap().unwrap();
    assert_eq!(munich.district.as_deref(), Some("Schwabing"));
    let renamed = db.find_by_external_id("5123456003").await.unwrap().unwrap();
    assert!(renamed.title.ends_with("(Remote)"));
}
