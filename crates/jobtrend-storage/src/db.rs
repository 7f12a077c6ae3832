//! Relational store: schema migrations plus a thin repository over SQLite.
//!
//! Writers go through [`BatchTx`], one transaction per fetched batch. Readers use the
//! [`Database`] methods directly. Nothing here loads lazily; every query is explicit.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use jobtrend_core::{
    AggregateSnapshot, CanonicalLocation, CleanedRecord, Company, CompanyName, Dimension,
    Location, Posting, PostingStatus, Skill,
};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect from a `sqlite:` URL, creating the file if needed.
    ///
    /// `sqlite::memory:` gives every pooled connection its own database; use a file for
    /// anything that spans more than one query.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        Self::connect_with(options).await
    }

    pub async fn open_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> StoreResult<Self> {
        let options = options
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("schema migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Writers take the database write lock up front; a second batch waits on the busy timeout
    /// instead of failing to upgrade its read snapshot.
    pub async fn begin_batch(&self) -> StoreResult<BatchTx> {
        Ok(BatchTx {
            tx: self.pool.begin_with("BEGIN IMMEDIATE").await?,
        })
    }

    pub async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Posting>> {
        let row = sqlx::query(&format!("{POSTING_SELECT} WHERE external_id = ?"))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| posting_from_row(&r)).transpose()
    }

    pub async fn posting_skills(&self, posting_id: i64) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT s.name
              FROM posting_skills ps
              JOIN skills s ON s.id = ps.skill_id
             WHERE ps.posting_id = ?
             ORDER BY s.name
            "#,
        )
        .bind(posting_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    pub async fn companies(&self) -> StoreResult<Vec<Company>> {
        let rows = sqlx::query(
            "SELECT id, name_key, display_name, industry FROM companies ORDER BY name_key",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Company {
                    id: row.try_get("id")?,
                    name_key: row.try_get("name_key")?,
                    display_name: row.try_get("display_name")?,
                    industry: row.try_get("industry")?,
                })
            })
            .collect()
    }

    pub async fn locations(&self) -> StoreResult<Vec<Location>> {
        let rows = sqlx::query("SELECT id, name, latitude, longitude FROM locations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Location {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                })
            })
            .collect()
    }

    pub async fn skills(&self) -> StoreResult<Vec<Skill>> {
        let rows = sqlx::query("SELECT id, name FROM skills ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Skill {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn entity_counts(&self) -> StoreResult<EntityCounts> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM postings)            AS postings,
                   (SELECT COUNT(*) FROM companies)           AS companies,
                   (SELECT COUNT(*) FROM locations)           AS locations,
                   (SELECT COUNT(*) FROM skills)              AS skills,
                   (SELECT COUNT(*) FROM posting_skills)      AS posting_skills,
                   (SELECT COUNT(*) FROM aggregate_snapshots) AS aggregate_snapshots
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(EntityCounts {
            postings: row.try_get("postings")?,
            companies: row.try_get("companies")?,
            locations: row.try_get("locations")?,
            skills: row.try_get("skills")?,
            posting_skills: row.try_get("posting_skills")?,
            aggregate_snapshots: row.try_get("aggregate_snapshots")?,
        })
    }

    /// Group-by reads feeding the aggregation engine, taken inside one read transaction so every
    /// dimension sees the same snapshot of the base tables.
    pub async fn load_aggregation_inputs(&self) -> StoreResult<AggregationInputs> {
        let mut tx = self.pool.begin().await?;

        let total_postings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM postings")
            .fetch_one(&mut *tx)
            .await?;
        let by_date = sqlx::query_as::<_, (NaiveDate, i64)>(
            "SELECT posted_on, COUNT(*) FROM postings GROUP BY posted_on ORDER BY posted_on",
        )
        .fetch_all(&mut *tx)
        .await?;
        let by_city = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT l.name, COUNT(*)
              FROM postings p
              JOIN locations l ON l.id = p.location_id
             GROUP BY l.name
             ORDER BY l.name
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let by_skill = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT s.name, COUNT(*)
              FROM posting_skills ps
              JOIN skills s ON s.id = ps.skill_id
             GROUP BY s.name
             ORDER BY s.name
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let by_industry = sqlx::query_as::<_, (Option<String>, i64)>(
            "SELECT industry, COUNT(*) FROM postings GROUP BY industry ORDER BY industry",
        )
        .fetch_all(&mut *tx)
        .await?;
        let by_status = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM postings GROUP BY status ORDER BY status",
        )
        .fetch_all(&mut *tx)
        .await?;
        let skill_by_date = sqlx::query_as::<_, (NaiveDate, String, i64)>(
            r#"
            SELECT p.posted_on, s.name, COUNT(*)
              FROM posting_skills ps
              JOIN postings p ON p.id = ps.posting_id
              JOIN skills s ON s.id = ps.skill_id
             GROUP BY p.posted_on, s.name
             ORDER BY p.posted_on, s.name
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let skill_by_city = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT l.name, s.name, COUNT(*)
              FROM posting_skills ps
              JOIN postings p ON p.id = ps.posting_id
              JOIN locations l ON l.id = p.location_id
              JOIN skills s ON s.id = ps.skill_id
             GROUP BY l.name, s.name
             ORDER BY l.name, s.name
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AggregationInputs {
            total_postings,
            by_date,
            by_city,
            by_skill,
            by_industry,
            by_status,
            skill_by_date,
            skill_by_city,
        })
    }

    pub async fn query_aggregates(
        &self,
        dimension: Option<Dimension>,
    ) -> StoreResult<Vec<AggregateSnapshot>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT dimension, bucket, count, percentage FROM aggregate_snapshots",
        );
        if let Some(dimension) = dimension {
            qb.push(" WHERE dimension = ").push_bind(dimension.as_str());
        }
        qb.push(" ORDER BY dimension, bucket");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let dimension: String = row.try_get("dimension")?;
                let dimension =
                    Dimension::from_str(&dimension).map_err(|e| StoreError::CorruptRow {
                        table: "aggregate_snapshots",
                        detail: e.to_string(),
                    })?;
                Ok(AggregateSnapshot {
                    dimension,
                    bucket: row.try_get("bucket")?,
                    count: row.try_get("count")?,
                    percentage: row.try_get("percentage")?,
                })
            })
            .collect()
    }

    /// Swap the whole aggregate table for `snapshots` in one transaction.
    pub async fn replace_aggregates(&self, snapshots: &[AggregateSnapshot]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM aggregate_snapshots")
            .execute(&mut *tx)
            .await?;
        for snapshot in snapshots {
            sqlx::query(
                "INSERT INTO aggregate_snapshots (dimension, bucket, count, percentage) VALUES (?, ?, ?, ?)",
            )
            .bind(snapshot.dimension.as_str())
            .bind(&snapshot.bucket)
            .bind(snapshot.count)
            .bind(snapshot.percentage)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = snapshots.len(), "aggregate snapshots replaced");
        Ok(())
    }

    pub async fn record_run(&self, run: &RunRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_runs (run_id, started_at, finished_at, status, failed_stage, cause, summary_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                failed_stage = excluded.failed_stage,
                cause = excluded.cause,
                summary_json = excluded.summary_json
            "#,
        )
        .bind(&run.run_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(&run.failed_stage)
        .bind(&run.cause)
        .bind(&run.summary_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let runs = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT run_id, started_at, finished_at, status, failed_stage, cause, summary_json
              FROM fetch_runs
             ORDER BY started_at DESC
             LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    /// Ad-hoc read over the base tables for consumers that need more than the aggregates.
    pub async fn search_postings(&self, filter: &PostingFilter) -> StoreResult<Vec<PostingView>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT p.id, p.external_id, p.title, c.display_name AS company, l.name AS city,
                   p.district, COALESCE(p.latitude, l.latitude) AS latitude,
                   COALESCE(p.longitude, l.longitude) AS longitude, p.redirect_url,
                   p.posted_on, p.status
              FROM postings p
              JOIN locations l ON l.id = p.location_id
              LEFT JOIN companies c ON c.id = p.company_id
             WHERE 1 = 1
            "#,
        );
        if let Some(city) = &filter.city {
            qb.push(" AND l.name = ").push_bind(city.clone()).push(" COLLATE NOCASE");
        }
        if let Some(skill) = &filter.skill {
            qb.push(
                " AND EXISTS (SELECT 1 FROM posting_skills ps JOIN skills s ON s.id = ps.skill_id \
                 WHERE ps.posting_id = p.id AND s.name = ",
            )
            .push_bind(skill.clone())
            .push(" COLLATE NOCASE)");
        }
        if let Some(status) = filter.status {
            qb.push(" AND p.status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY p.posted_on DESC, p.external_id LIMIT ")
            .push_bind(filter.limit.clamp(1, 500));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            out.push(PostingView {
                external_id: row.try_get("external_id")?,
                title: row.try_get("title")?,
                company: row.try_get("company")?,
                city: row.try_get("city")?,
                district: row.try_get("district")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                redirect_url: row.try_get("redirect_url")?,
                posted_on: row.try_get("posted_on")?,
                status: parse_status(row.try_get("status")?)?,
                skills: self.posting_skills(id).await?,
            });
        }
        Ok(out)
    }
}

/// One open write transaction covering a single fetched batch. Dropping it without
/// [`BatchTx::commit`] rolls everything back.
pub struct BatchTx {
    tx: Transaction<'static, Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    /// Row exists with a newer retrieval timestamp; left untouched.
    Stale(i64),
}

impl UpsertOutcome {
    pub fn posting_id(self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Stale(id) => id,
        }
    }
}

impl BatchTx {
    pub async fn resolve_location(&mut self, location: &CanonicalLocation) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO locations (name, latitude, longitude)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                latitude = COALESCE(locations.latitude, excluded.latitude),
                longitude = COALESCE(locations.longitude, excluded.longitude)
            RETURNING id
            "#,
        )
        .bind(&location.name)
        .bind(location.latitude)
        .bind(location.longitude)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn resolve_company(&mut self, company: &CompanyName) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO companies (name_key, display_name, industry)
            VALUES (?, ?, ?)
            ON CONFLICT(name_key) DO UPDATE SET
                industry = COALESCE(companies.industry, excluded.industry)
            RETURNING id
            "#,
        )
        .bind(&company.key)
        .bind(&company.display)
        .bind(&company.industry)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn resolve_skill(&mut self, name: &str) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO skills (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name = excluded.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    pub async fn find_by_external_id(&mut self, external_id: &str) -> StoreResult<Option<Posting>> {
        let row = sqlx::query(&format!("{POSTING_SELECT} WHERE external_id = ?"))
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|r| posting_from_row(&r)).transpose()
    }

    /// Id of the stored row for `record` when that row was retrieved later than `record`.
    pub async fn newer_row(&mut self, record: &CleanedRecord) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM postings WHERE external_id = ? AND retrieved_at > ?",
        )
        .bind(&record.external_id)
        .bind(record.retrieved_at)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(id)
    }

    /// Insert or update keyed on `external_id`. `first_seen_at` is written on insert only, and an
    /// estimated `posted_on` never replaces a stored one. An update is skipped when the stored row
    /// was retrieved later than `record`.
    pub async fn upsert_posting(
        &mut self,
        record: &CleanedRecord,
        company_id: Option<i64>,
        location_id: i64,
    ) -> StoreResult<UpsertOutcome> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM postings WHERE external_id = ?")
            .bind(&record.external_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        let returned = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO postings (
                external_id, source_id, title, description, company_id, location_id, district,
                latitude, longitude, posted_on, first_seen_at, retrieved_at, industry, status,
                redirect_url, salary_is_predicted
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                source_id = excluded.source_id,
                title = excluded.title,
                description = excluded.description,
                company_id = excluded.company_id,
                location_id = excluded.location_id,
                district = excluded.district,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                posted_on = CASE WHEN ? THEN postings.posted_on ELSE excluded.posted_on END,
                retrieved_at = excluded.retrieved_at,
                industry = excluded.industry,
                status = excluded.status,
                redirect_url = excluded.redirect_url,
                salary_is_predicted = excluded.salary_is_predicted
            WHERE excluded.retrieved_at >= postings.retrieved_at
            RETURNING id
            "#,
        )
        .bind(&record.external_id)
        .bind(&record.source_id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(company_id)
        .bind(location_id)
        .bind(&record.location.district)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.posted_on)
        .bind(record.retrieved_at)
        .bind(record.retrieved_at)
        .bind(&record.industry)
        .bind(record.status.as_str())
        .bind(&record.redirect_url)
        .bind(record.salary_is_predicted)
        .bind(record.posted_on_estimated)
        .fetch_optional(&mut *self.tx)
        .await?;

        match (existing, returned) {
            (None, Some(id)) => Ok(UpsertOutcome::Inserted(id)),
            (Some(_), Some(id)) => Ok(UpsertOutcome::Updated(id)),
            (Some(id), None) => Ok(UpsertOutcome::Stale(id)),
            (None, None) => Err(StoreError::CorruptRow {
                table: "postings",
                detail: format!("upsert of {} returned no row", record.external_id),
            }),
        }
    }

    pub async fn replace_posting_skills(
        &mut self,
        posting_id: i64,
        skill_ids: &[i64],
    ) -> StoreResult<()> {
        sqlx::query("DELETE FROM posting_skills WHERE posting_id = ?")
            .bind(posting_id)
            .execute(&mut *self.tx)
            .await?;
        for skill_id in skill_ids {
            sqlx::query(
                "INSERT INTO posting_skills (posting_id, skill_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(posting_id)
            .bind(skill_id)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub postings: i64,
    pub companies: i64,
    pub locations: i64,
    pub skills: i64,
    pub posting_skills: i64,
    pub aggregate_snapshots: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationInputs {
    pub total_postings: i64,
    pub by_date: Vec<(NaiveDate, i64)>,
    pub by_city: Vec<(String, i64)>,
    pub by_skill: Vec<(String, i64)>,
    pub by_industry: Vec<(Option<String>, i64)>,
    pub by_status: Vec<(String, i64)>,
    pub skill_by_date: Vec<(NaiveDate, String, i64)>,
    /// `(city, skill, postings)`
    pub skill_by_city: Vec<(String, String, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub failed_stage: Option<String>,
    pub cause: Option<String>,
    pub summary_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingFilter {
    pub city: Option<String>,
    pub skill: Option<String>,
    pub status: Option<PostingStatus>,
    pub limit: i64,
}

impl Default for PostingFilter {
    fn default() -> Self {
        Self {
            city: None,
            skill: None,
            status: None,
            limit: 50,
        }
    }
}

/// Posting row joined with its company and city; coordinates fall back to the city's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingView {
    pub external_id: String,
    pub title: String,
    pub company: Option<String>,
    pub city: String,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub redirect_url: Option<String>,
    pub posted_on: NaiveDate,
    pub status: PostingStatus,
    pub skills: Vec<String>,
}

const POSTING_SELECT: &str = r#"
    SELECT id, external_id, source_id, title, description, company_id, location_id, district,
           latitude, longitude, posted_on, first_seen_at, retrieved_at, industry, status,
           redirect_url, salary_is_predicted
      FROM postings
"#;

fn parse_status(value: String) -> StoreResult<PostingStatus> {
    PostingStatus::from_str(&value).map_err(|e| StoreError::CorruptRow {
        table: "postings",
        detail: e.to_string(),
    })
}

fn posting_from_row(row: &SqliteRow) -> StoreResult<Posting> {
    Ok(Posting {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        company_id: row.try_get("company_id")?,
        location_id: row.try_get("location_id")?,
        district: row.try_get("district")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        posted_on: row.try_get("posted_on")?,
        first_seen_at: row.try_get("first_seen_at")?,
        retrieved_at: row.try_get("retrieved_at")?,
        industry: row.try_get("industry")?,
        status: parse_status(row.try_get("status")?)?,
        redirect_url: row.try_get("redirect_url")?,
        salary_is_predicted: row.try_get("salary_is_predicted")?,
    })
}
