//! Job source contracts, the Adzuna HTTP source, an offline fixture source and the page stream
//! that drives either of them with retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobtrend_core::{RawPosting, RawRecord};
use jobtrend_storage::{BackoffPolicy, FetchError, HttpFetcher, HttpRequest, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrend-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// One page as delivered by a source: the raw body (for archival) plus its parsed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePage {
    pub source_id: String,
    pub page: u32,
    pub fetched_at: DateTime<Utc>,
    pub body: Vec<u8>,
    pub records: Vec<RawRecord>,
}

impl SourcePage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Worth retrying: timeouts, connection resets, 5xx, 429.
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Retryable => Self::Transient(err.to_string()),
            RetryDisposition::NonRetryable => Self::Fatal(err.to_string()),
        }
    }
}

/// A page that could not be fetched once retries were spent.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("page {page} failed after {attempts} attempt(s): {cause}")]
pub struct FetchFailure {
    pub page: u32,
    pub attempts: usize,
    pub cause: String,
}

#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, ctx: &FetchContext, page: u32) -> Result<SourcePage, SourceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `app_id` / `app_key` query parameters.
    #[default]
    Query,
    /// `X-App-Id` header plus `Authorization: Bearer <key>`.
    Header,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub app_id: String,
    pub app_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("app_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdzunaConfig {
    /// Search endpoint without the trailing page number,
    /// e.g. `https://api.adzuna.com/v1/api/jobs/de/search`.
    pub base_url: String,
    pub what: Option<String>,
    pub category: Option<String>,
    pub results_per_page: u32,
    pub max_days_old: Option<u32>,
    pub auth: AuthMode,
    pub credentials: Credentials,
}

impl AdzunaConfig {
    pub fn request_for_page(&self, page: u32) -> HttpRequest {
        let mut query = vec![(
            "results_per_page".to_string(),
            self.results_per_page.to_string(),
        )];
        if let Some(what) = &self.what {
            query.push(("what".into(), what.clone()));
        }
        if let Some(category) = &self.category {
            query.push(("category".into(), category.clone()));
        }
        if let Some(days) = self.max_days_old {
            query.push(("max_days_old".into(), days.to_string()));
        }

        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        match self.auth {
            AuthMode::Query => {
                query.push(("app_id".into(), self.credentials.app_id.clone()));
                query.push(("app_key".into(), self.credentials.app_key.clone()));
            }
            AuthMode::Header => {
                headers.push(("X-App-Id".into(), self.credentials.app_id.clone()));
                headers.push((
                    "Authorization".into(),
                    format!("Bearer {}", self.credentials.app_key),
                ));
            }
        }

        HttpRequest {
            url: format!("{}/{page}", self.base_url.trim_end_matches('/')),
            query,
            headers,
        }
    }
}

pub struct AdzunaSource {
    source_id: String,
    config: AdzunaConfig,
    http: Arc<HttpFetcher>,
}

impl AdzunaSource {
    pub fn new(source_id: impl Into<String>, config: AdzunaConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            config,
            http,
        }
    }
}

#[async_trait]
impl JobSource for AdzunaSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, ctx: &FetchContext, page: u32) -> Result<SourcePage, SourceError> {
        let request = self.config.request_for_page(page);
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &self.source_id, &request)
            .await?;
        let fetched_at = Utc::now();
        let records = parse_results_page(&self.source_id, page, fetched_at, &response.body)?;
        Ok(SourcePage {
            source_id: self.source_id.clone(),
            page,
            fetched_at,
            body: response.body,
            records,
        })
    }
}

/// Reads `page-<n>.json` files from a directory. A missing file is an empty page, which ends
/// the stream.
pub struct FixtureSource {
    source_id: String,
    dir: PathBuf,
    fetched_at: Option<DateTime<Utc>>,
}

impl FixtureSource {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
            fetched_at: None,
        }
    }

    /// Pin the retrieval timestamp so repeated runs see identical input.
    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(fetched_at);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{page}.json"))
    }
}

#[async_trait]
impl JobSource for FixtureSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, _ctx: &FetchContext, page: u32) -> Result<SourcePage, SourceError> {
        let path = self.page_path(page);
        let fetched_at = self.fetched_at.unwrap_or_else(Utc::now);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "fixture page absent; treating as end of results");
                return Ok(SourcePage {
                    source_id: self.source_id.clone(),
                    page,
                    fetched_at,
                    body: Vec::new(),
                    records: Vec::new(),
                });
            }
            Err(err) => {
                return Err(SourceError::Fatal(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        let records = parse_results_page(&self.source_id, page, fetched_at, &body)?;
        Ok(SourcePage {
            source_id: self.source_id.clone(),
            page,
            fetched_at,
            body,
            records,
        })
    }
}

/// Turn a results payload into raw records. Accepts `{"results": [...]}` or a bare array.
/// Entries that are not objects become [`RawRecord::Malformed`]; a body that is not JSON at all
/// is fatal for the page.
pub fn parse_results_page(
    source_id: &str,
    page: u32,
    fetched_at: DateTime<Utc>,
    body: &[u8],
) -> Result<Vec<RawRecord>, SourceError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| SourceError::Fatal(format!("page {page} is not valid JSON: {e}")))?;
    let results = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => match map.get("results") {
            Some(JsonValue::Array(items)) => items,
            Some(JsonValue::Null) | None => return Ok(Vec::new()),
            Some(_) => {
                return Err(SourceError::Fatal(format!(
                    "page {page}: `results` is not an array"
                )))
            }
        },
        _ => {
            return Err(SourceError::Fatal(format!(
                "page {page}: unexpected payload shape"
            )))
        }
    };

    Ok(results
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            if item.is_object() {
                RawRecord::Posting(raw_posting_from_json(source_id, page, fetched_at, item))
            } else {
                RawRecord::Malformed {
                    source_id: source_id.to_string(),
                    page,
                    fetched_at,
                    reason: format!("result #{idx} is not an object"),
                }
            }
        })
        .collect())
}

fn raw_posting_from_json(
    source_id: &str,
    page: u32,
    fetched_at: DateTime<Utc>,
    item: &JsonValue,
) -> RawPosting {
    let mut raw = RawPosting::empty(source_id, page, fetched_at);
    raw.external_id = json_scalar_string(item, &["id"]);
    raw.title = json_str(item, &["title"]).map(ToString::to_string);
    raw.description = json_str(item, &["description"]).map(ToString::to_string);
    raw.company = json_str(item, &["company", "display_name"])
        .or_else(|| json_str(item, &["company"]))
        .map(ToString::to_string);
    raw.company_industry = json_str(item, &["company", "industry"]).map(ToString::to_string);
    raw.location = json_str(item, &["location", "display_name"])
        .or_else(|| json_str(item, &["location"]))
        .map(ToString::to_string);
    raw.latitude = json_f64(item, &["latitude"]);
    raw.longitude = json_f64(item, &["longitude"]);
    raw.posted_at = json_str(item, &["created"])
        .or_else(|| json_str(item, &["posted_at"]))
        .map(ToString::to_string);
    raw.status = json_str(item, &["status"]).map(ToString::to_string);
    raw.industry = json_str(item, &["category", "label"])
        .or_else(|| json_str(item, &["industry"]))
        .map(ToString::to_string);
    raw.redirect_url = json_str(item, &["redirect_url"]).map(ToString::to_string);
    raw.salary_is_predicted = json_flag(item, &["salary_is_predicted"]);
    raw
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Numbers or numeric strings; the API is not consistent about which.
fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_scalar_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_flag(value: &JsonValue, path: &[&str]) -> Option<bool> {
    match json_at(value, path)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
        JsonValue::String(s) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page: u32,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self { page: 1 }
    }
}

/// Lazy, finite sequence of pages from one source. Transient failures are retried with the
/// backoff policy; the cursor only advances past pages that were delivered, so a stream can be
/// restarted from [`PageStream::cursor`] after a failure.
pub struct PageStream {
    source: Arc<dyn JobSource>,
    policy: BackoffPolicy,
    cursor: PageCursor,
    max_pages: Option<u32>,
    ctx: FetchContext,
    page_delay: Duration,
    delivered: u32,
    done: bool,
}

impl PageStream {
    pub fn new(
        source: Arc<dyn JobSource>,
        policy: BackoffPolicy,
        cursor: PageCursor,
        max_pages: Option<u32>,
    ) -> Self {
        Self {
            source,
            policy,
            cursor,
            max_pages,
            ctx: FetchContext {
                run_id: Uuid::new_v4(),
            },
            page_delay: Duration::ZERO,
            delivered: 0,
            done: false,
        }
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.ctx.run_id = run_id;
        self
    }

    /// Pause between consecutive page requests.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub async fn next_page(&mut self) -> Option<Result<SourcePage, FetchFailure>> {
        if self.done {
            return None;
        }
        if self.max_pages.is_some_and(|max| self.delivered >= max) {
            debug!(max_pages = ?self.max_pages, "page limit reached");
            self.done = true;
            return None;
        }
        if self.delivered > 0 && !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let page = self.cursor.page;
        let mut attempt = 0usize;
        loop {
            match self.source.fetch_page(&self.ctx, page).await {
                Ok(fetched) if fetched.is_empty() => {
                    info!(source_id = self.source.source_id(), page, "empty page; end of results");
                    self.done = true;
                    return None;
                }
                Ok(fetched) => {
                    self.delivered += 1;
                    self.cursor.page += 1;
                    return Some(Ok(fetched));
                }
                Err(SourceError::Transient(cause)) if attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        source_id = self.source.source_id(),
                        page,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        %cause,
                        "transient page failure; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(FetchFailure {
                        page,
                        attempts: attempt + 1,
                        cause: err.to_string(),
                    }));
                }
            }
        }
    }
}
