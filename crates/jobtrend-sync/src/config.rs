use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use jobtrend_adapters::{
    AdzunaConfig, AdzunaSource, AuthMode, Credentials, FixtureSource, JobSource, PageCursor,
};
use jobtrend_storage::{BackoffPolicy, HttpFetcher};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SYNC_CRON: &str = "0 30 22 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: Option<u32>,
    pub allow_partial: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("JOBTREND_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://jobtrend.db".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("artifacts")),
            scheduler_enabled: env_flag("JOBTREND_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("JOBTREND_SYNC_CRON")
                .unwrap_or_else(|_| DEFAULT_SYNC_CRON.to_string()),
            user_agent: std::env::var("JOBTREND_USER_AGENT")
                .unwrap_or_else(|_| "jobtrend-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("JOBTREND_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_pages: std::env::var("JOBTREND_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok()),
            allow_partial: env_flag("JOBTREND_ALLOW_PARTIAL"),
            workspace_root,
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// Inclusive posting-date window. Either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Self> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                bail!("date range is inverted: {from} > {to}");
            }
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    /// Days back from `today` that still cover `from`; what the API calls `max_days_old`.
    pub fn max_days_old(&self, today: NaiveDate) -> Option<u32> {
        let from = self.from?;
        let days = (today - from).num_days() + 1;
        Some(days.max(1) as u32)
    }
}

/// Knobs for one pipeline pass.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub backoff: BackoffPolicy,
    pub cursor: PageCursor,
    pub max_pages: Option<u32>,
    pub date_range: DateRange,
    pub allow_partial: bool,
    pub page_delay: Duration,
    /// Where report files go; `None` skips them.
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cursor: PageCursor::default(),
            max_pages: None,
            date_range: DateRange::default(),
            allow_partial: false,
            page_delay: Duration::ZERO,
            reports_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Adzuna,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub what: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default)]
    pub app_id_env: Option<String>,
    #[serde(default)]
    pub app_key_env: Option<String>,
    #[serde(default)]
    pub page_delay_ms: u64,
    /// Offline pages, relative to the workspace root.
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_results_per_page() -> u32 {
    50
}

impl SourceConfig {
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn fixture_dir(&self, workspace_root: &Path) -> PathBuf {
        match &self.fixture_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace_root.join(dir),
            None => workspace_root
                .join("fixtures")
                .join(&self.source_id)
                .join("sample"),
        }
    }

    /// Instantiate the source. `offline` forces the fixture pages regardless of `kind`.
    pub fn build(
        &self,
        http: Arc<HttpFetcher>,
        workspace_root: &Path,
        range: &DateRange,
        offline: bool,
    ) -> Result<Arc<dyn JobSource>> {
        if offline || self.kind == SourceKind::Fixture {
            return Ok(Arc::new(FixtureSource::new(
                self.source_id.clone(),
                self.fixture_dir(workspace_root),
            )));
        }

        let base_url = self
            .base_url
            .clone()
            .with_context(|| format!("source {} has no base_url", self.source_id))?;
        let credentials = Credentials {
            app_id: read_secret(self.app_id_env.as_deref(), &self.source_id, "app_id_env")?,
            app_key: read_secret(self.app_key_env.as_deref(), &self.source_id, "app_key_env")?,
        };
        let config = AdzunaConfig {
            base_url,
            what: self.what.clone(),
            category: self.category.clone(),
            results_per_page: self.results_per_page,
            max_days_old: range.max_days_old(Utc::now().date_naive()),
            auth: self.auth,
            credentials,
        };
        Ok(Arc::new(AdzunaSource::new(self.source_id.clone(), config, http)))
    }
}

fn read_secret(var: Option<&str>, source_id: &str, key: &str) -> Result<String> {
    let var = var.with_context(|| format!("source {source_id} is missing `{key}`"))?;
    std::env::var(var).with_context(|| format!("environment variable {var} is not set"))
}
