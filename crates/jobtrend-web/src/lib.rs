//! Read-only JSON API over the job trend store: aggregate snapshots, chart payloads, posting
//! search and run history.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use jobtrend_core::{AggregateSnapshot, Dimension, PostingStatus};
use jobtrend_storage::db::{PostingFilter, RunRecord};
use jobtrend_storage::Database;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "jobtrend-web";

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PostingsQuery {
    city: Option<String>,
    skill: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunView {
    run_id: String,
    started_at: String,
    finished_at: String,
    status: String,
    failed_stage: Option<String>,
    cause: Option<String>,
    summary: serde_json::Value,
}

impl From<RunRecord> for RunView {
    fn from(run: RunRecord) -> Self {
        Self {
            summary: serde_json::from_str(&run.summary_json).unwrap_or(serde_json::Value::Null),
            run_id: run.run_id,
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.to_rfc3339(),
            status: run.status,
            failed_stage: run.failed_stage,
            cause: run.cause,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/aggregates", get(aggregates_handler))
        .route("/aggregates/{dimension}", get(aggregates_by_dimension_handler))
        .route("/charts/{dimension}", get(chart_handler))
        .route("/postings", get(postings_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(db: Database, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read api");
    axum::serve(listener, app(AppState::new(db))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.db.entity_counts().await {
        Ok(counts) => Json(serde_json::json!({ "status": "ok", "counts": counts })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn aggregates_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.db.query_aggregates(None).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn aggregates_by_dimension_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(dimension): AxumPath<String>,
) -> Response {
    let dimension = match Dimension::from_str(&dimension) {
        Ok(d) => d,
        Err(err) => return client_error(StatusCode::NOT_FOUND, err),
    };
    match state.db.query_aggregates(Some(dimension)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(dimension): AxumPath<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let dimension = match Dimension::from_str(&dimension) {
        Ok(d) => d,
        Err(err) => return client_error(StatusCode::NOT_FOUND, err),
    };
    match state.db.query_aggregates(Some(dimension)).await {
        Ok(rows) => Json(chart_payload(dimension, rows, query.limit.unwrap_or(20))).into_response(),
        Err(err) => server_error(err),
    }
}

/// Plotly figure JSON. Time series keep bucket order, categorical dimensions show the top
/// `limit` buckets by count, `skill_month` becomes one line per skill and `city_skill` a
/// city-by-skill bubble grid.
fn chart_payload(dimension: Dimension, mut rows: Vec<AggregateSnapshot>, limit: usize) -> serde_json::Value {
    let title = format!("Postings by {dimension}");
    if dimension == Dimension::SkillMonth {
        let mut series: BTreeMap<String, (Vec<String>, Vec<f64>)> = BTreeMap::new();
        for row in rows {
            let Some((month, skill)) = row.bucket.split_once('/') else {
                continue;
            };
            let entry = series.entry(skill.to_string()).or_default();
            entry.0.push(month.to_string());
            entry.1.push(row.percentage.unwrap_or_default());
        }
        let data: Vec<_> = series
            .into_iter()
            .map(|(skill, (x, y))| {
                serde_json::json!({ "type": "scatter", "mode": "lines+markers", "name": skill, "x": x, "y": y })
            })
            .collect();
        return serde_json::json!({
            "data": data,
            "layout": {
                "title": "Skill share per month",
                "yaxis": { "title": "% of postings", "ticksuffix": "%" },
            }
        });
    }

    if dimension == Dimension::CitySkill {
        let (mut x, mut y, mut size) = (Vec::new(), Vec::new(), Vec::new());
        for row in &rows {
            if let Some((city, skill)) = row.bucket.split_once('/') {
                x.push(city.to_string());
                y.push(skill.to_string());
                size.push(row.count);
            }
        }
        return serde_json::json!({
            "data": [{
                "type": "scatter",
                "mode": "markers",
                "x": x,
                "y": y,
                "text": size,
                "marker": { "size": size, "sizemode": "area", "color": "#0ea5e9" }
            }],
            "layout": { "title": "Skills per city" }
        });
    }

    if !dimension.is_time_bucket() {
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.bucket.cmp(&b.bucket)));
        rows.truncate(limit.max(1));
    }
    let x: Vec<_> = rows.iter().map(|r| r.bucket.clone()).collect();
    let y: Vec<_> = rows.iter().map(|r| r.count).collect();
    let text: Vec<_> = rows
        .iter()
        .map(|r| r.percentage.map(|p| format!("{p:.1}%")).unwrap_or_default())
        .collect();
    serde_json::json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "text": text,
            "marker": { "color": "#0ea5e9" }
        }],
        "layout": {
            "title": title,
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

async fn postings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostingsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(PostingStatus::from_str).transpose() {
        Ok(s) => s,
        Err(err) => return client_error(StatusCode::BAD_REQUEST, err),
    };
    let filter = PostingFilter {
        city: query.city.filter(|c| !c.trim().is_empty()),
        skill: query.skill.filter(|s| !s.trim().is_empty()),
        status,
        limit: query.limit.unwrap_or(PostingFilter::default().limit),
    };
    match state.db.search_postings(&filter).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.db.recent_runs(query.limit.unwrap_or(20) as i64).await {
        Ok(runs) => Json(runs.into_iter().map(RunView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

fn client_error(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    client_error(StatusCode::INTERNAL_SERVER_ERROR, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{DateTime, NaiveDate, Utc};
    use http_body_util::BodyExt;
    use jobtrend_core::{CanonicalLocation, CleanedRecord, CompanyName};
    use tower::ServiceExt;

    async fn seeded() -> (tempfile::TempDir, Router) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open_file(tmp.path().join("web.db")).await.unwrap();
        db.migrate().await.unwrap();

        let fetched: DateTime<Utc> = "2025-09-08T22:30:00Z".parse().unwrap();
        let record = CleanedRecord {
            external_id: "5123456001".into(),
            source_id: "adzuna".into(),
            title: "Python Entwickler".into(),
            description: "Python und SQL".into(),
            company: Some(CompanyName {
                key: "nordlicht software gmbh".into(),
                display: "Nordlicht Software GmbH".into(),
                industry: None,
            }),
            location: CanonicalLocation {
                name: "Berlin".into(),
                district: Some("Mitte".into()),
                latitude: Some(52.52),
                longitude: Some(13.405),
            },
            latitude: Some(52.5208),
            longitude: Some(13.4094),
            posted_on: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            posted_on_estimated: false,
            retrieved_at: fetched,
            industry: Some("IT-Stellen".into()),
            status: PostingStatus::Active,
            skills: vec!["Python".into(), "SQL".into()],
            redirect_url: Some("https://www.adzuna.de/land/ad/5123456001".into()),
            salary_is_predicted: false,
        };
        let mut tx = db.begin_batch().await.unwrap();
        let location = tx.resolve_location(&record.location).await.unwrap();
        let company = tx.resolve_company(record.company.as_ref().unwrap()).await.unwrap();
        let outcome = tx.upsert_posting(&record, Some(company), location).await.unwrap();
        let mut skills = Vec::new();
        for skill in &record.skills {
            skills.push(tx.resolve_skill(skill).await.unwrap());
        }
        tx.replace_posting_skills(outcome.posting_id(), &skills).await.unwrap();
        tx.commit().await.unwrap();

        let snap = |dimension, bucket: &str, count, percentage| AggregateSnapshot {
            dimension,
            bucket: bucket.into(),
            count,
            percentage: Some(percentage),
        };
        db.replace_aggregates(&[
            snap(Dimension::City, "Berlin", 1, 100.0),
            snap(Dimension::Month, "2025-09", 1, 100.0),
            snap(Dimension::Skill, "Python", 1, 100.0),
            snap(Dimension::Skill, "SQL", 1, 100.0),
            snap(Dimension::SkillMonth, "2025-09/Python", 1, 100.0),
            snap(Dimension::CitySkill, "Berlin/Python", 1, 100.0),
            snap(Dimension::CitySkill, "Berlin/SQL", 1, 100.0),
        ])
        .await
        .unwrap();

        (tmp, app(AppState::new(db)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (_tmp, app) = seeded().await;
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counts"]["postings"], 1);
        assert_eq!(body["counts"]["skills"], 2);
    }

    #[tokio::test]
    async fn aggregates_filter_by_dimension_and_reject_unknown() {
        let (_tmp, app) = seeded().await;
        let (status, body) = get_json(app.clone(), "/aggregates/skill").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, _) = get_json(app.clone(), "/aggregates").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_json(app, "/aggregates/weekday").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("weekday"));
    }

    #[tokio::test]
    async fn charts_are_plotly_figures() {
        let (_tmp, app) = seeded().await;
        let (status, body) = get_json(app.clone(), "/charts/city").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["type"], "bar");
        assert_eq!(body["data"][0]["x"][0], "Berlin");

        let (_, body) = get_json(app.clone(), "/charts/skill_month").await;
        assert_eq!(body["data"][0]["name"], "Python");
        assert_eq!(body["data"][0]["x"][0], "2025-09");

        let (_, body) = get_json(app, "/charts/city_skill").await;
        assert_eq!(body["data"][0]["mode"], "markers");
        assert_eq!(body["data"][0]["x"], serde_json::json!(["Berlin", "Berlin"]));
        assert_eq!(body["data"][0]["y"], serde_json::json!(["Python", "SQL"]));
    }

    #[tokio::test]
    async fn postings_search_filters() {
        let (_tmp, app) = seeded().await;
        let (status, body) = get_json(app.clone(), "/postings?city=berlin&skill=python").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["external_id"], "5123456001");
        assert_eq!(body[0]["company"], "Nordlicht Software GmbH");
        assert_eq!(body[0]["district"], "Mitte");
        assert_eq!(body[0]["latitude"], 52.5208);
        assert_eq!(body[0]["longitude"], 13.4094);
        assert_eq!(
            body[0]["redirect_url"],
            "https://www.adzuna.de/land/ad/5123456001"
        );

        let (_, body) = get_json(app.clone(), "/postings?city=Hamburg").await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = get_json(app, "/postings?status=archived").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn runs_list_is_empty_before_any_run() {
        let (_tmp, app) = seeded().await;
        let (status, body) = get_json(app, "/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}
