//! Core domain model for the job-trend pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobtrend-core";

/// Canonical name used when a location string matches nothing in the lookup table.
pub const UNKNOWN_LOCATION: &str = "unknown";

/// Bucket label for postings without an industry category.
pub const UNKNOWN_INDUSTRY: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Active,
    Expired,
    Removed,
}

impl PostingStatus {
    pub const ALL: [PostingStatus; 3] = [Self::Active, Self::Expired, Self::Removed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "open" => Ok(Self::Active),
            "expired" | "closed" => Ok(Self::Expired),
            "removed" | "deleted" => Ok(Self::Removed),
            _ => Err(ValidationError::InvalidField {
                field: "status".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Transport-level posting as handed over by a source adapter. Every payload field is optional;
/// validation happens in the cleaning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub source_id: String,
    pub page: u32,
    pub fetched_at: DateTime<Utc>,
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub company_industry: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub posted_at: Option<String>,
    pub status: Option<String>,
    pub industry: Option<String>,
    pub redirect_url: Option<String>,
    pub salary_is_predicted: Option<bool>,
}

impl RawPosting {
    pub fn empty(source_id: impl Into<String>, page: u32, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            page,
            fetched_at,
            external_id: None,
            title: None,
            company: None,
            company_industry: None,
            description: None,
            location: None,
            latitude: None,
            longitude: None,
            posted_at: None,
            status: None,
            industry: None,
            redirect_url: None,
            salary_is_predicted: None,
        }
    }
}

/// One record from a fetched page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    Posting(RawPosting),
    /// Payload entry that could not be read as a posting object at all.
    Malformed {
        source_id: String,
        page: u32,
        fetched_at: DateTime<Utc>,
        reason: String,
    },
}

impl RawRecord {
    pub fn page(&self) -> u32 {
        match self {
            Self::Posting(p) => p.page,
            Self::Malformed { page, .. } => *page,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::Posting(p) => &p.source_id,
            Self::Malformed { source_id, .. } => source_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyName {
    /// Case/whitespace folded key; unique per company.
    pub key: String,
    pub display: String,
    pub industry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalLocation {
    pub name: String,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CanonicalLocation {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_LOCATION.to_string(),
            district: None,
            latitude: None,
            longitude: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_LOCATION
    }
}

/// Validated, normalized posting ready for the persistence coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub external_id: String,
    pub source_id: String,
    pub title: String,
    pub description: String,
    pub company: Option<CompanyName>,
    pub location: CanonicalLocation,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub posted_on: NaiveDate,
    /// `posted_on` is the retrieval day because the source gave no date; an existing row keeps
    /// its stored date.
    pub posted_on_estimated: bool,
    pub retrieved_at: DateTime<Utc>,
    pub industry: Option<String>,
    pub status: PostingStatus,
    /// Canonical skill names, sorted and unique.
    pub skills: Vec<String>,
    pub redirect_url: Option<String>,
    pub salary_is_predicted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("missing mandatory field `{field}`")]
    MissingField { field: String },
    #[error("invalid value for `{field}`: {value:?}")]
    InvalidField { field: String, value: String },
    #[error("malformed record: {reason}")]
    Malformed { reason: String },
}

impl ValidationError {
    pub fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub source_id: String,
    pub page: u32,
    pub external_id: Option<String>,
    pub reason: ValidationError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cleaned {
    Accepted(CleanedRecord),
    Rejected(RejectedRecord),
}

/// Persisted posting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub external_id: String,
    pub source_id: String,
    pub title: String,
    pub description: String,
    pub company_id: Option<i64>,
    pub location_id: i64,
    pub district: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub posted_on: NaiveDate,
    pub first_seen_at: DateTime<Utc>,
    pub retrieved_at: DateTime<Utc>,
    pub industry: Option<String>,
    pub status: PostingStatus,
    pub redirect_url: Option<String>,
    pub salary_is_predicted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name_key: String,
    pub display_name: String,
    pub industry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Aggregation dimension; the first component of an [`AggregateSnapshot`] key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Day,
    Week,
    Month,
    Skill,
    City,
    Industry,
    Status,
    SkillMonth,
    /// `City/Skill` cross tab.
    CitySkill,
}

impl Dimension {
    pub const ALL: [Dimension; 9] = [
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Skill,
        Self::City,
        Self::Industry,
        Self::Status,
        Self::SkillMonth,
        Self::CitySkill,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Skill => "skill",
            Self::City => "city",
            Self::Industry => "industry",
            Self::Status => "status",
            Self::SkillMonth => "skill_month",
            Self::CitySkill => "city_skill",
        }
    }

    pub fn is_time_bucket(self) -> bool {
        matches!(self, Self::Day | Self::Week | Self::Month)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown aggregate dimension {0:?}")]
pub struct UnknownDimension(pub String);

impl FromStr for Dimension {
    type Err = UnknownDimension;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s.trim())
            .ok_or_else(|| UnknownDimension(s.to_string()))
    }
}

/// Derived (dimension, bucket) -> metric row. Always recomputed from the base tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub dimension: Dimension,
    pub bucket: String,
    pub count: i64,
    /// Share of the dimension's reference total, in percent.
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Fetching,
    Cleaning,
    Persisting,
    Aggregating,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetching => "fetching",
            Self::Cleaning => "cleaning",
            Self::Persisting => "persisting",
            Self::Aggregating => "aggregating",
        }
    }

    /// Stages reachable from `self` inside one run. Fetching, cleaning and persisting cycle once
    /// per batch; aggregation starts after the last batch.
    fn may_precede(self, next: RunStage) -> bool {
        use RunStage::*;
        matches!(
            (self, next),
            (Fetching, Cleaning)
                | (Fetching, Aggregating)
                | (Cleaning, Persisting)
                | (Persisting, Fetching)
                | (Persisting, Aggregating)
        )
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running { stage: RunStage },
    Succeeded,
    Failed { stage: RunStage, cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal run transition from {from:?} to {to}")]
pub struct StateError {
    pub from: RunState,
    pub to: String,
}

impl RunState {
    pub fn enter(&self, next: RunStage) -> Result<RunState, StateError> {
        let allowed = match self {
            Self::Idle => next == RunStage::Fetching,
            Self::Running { stage } => stage.may_precede(next),
            Self::Succeeded | Self::Failed { .. } => false,
        };
        if allowed {
            Ok(Self::Running { stage: next })
        } else {
            Err(StateError {
                from: self.clone(),
                to: next.to_string(),
            })
        }
    }

    pub fn fail(&self, cause: impl Into<String>) -> Result<RunState, StateError> {
        match self {
            Self::Running { stage } => Ok(Self::Failed {
                stage: *stage,
                cause: cause.into(),
            }),
            other => Err(StateError {
                from: other.clone(),
                to: "failed".to_string(),
            }),
        }
    }

    pub fn succeed(&self) -> Result<RunState, StateError> {
        match self {
            Self::Running {
                stage: RunStage::Aggregating,
            } => Ok(Self::Succeeded),
            other => Err(StateError {
                from: other.clone(),
                to: "succeeded".to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    pub fn stage(&self) -> Option<RunStage> {
        match self {
            Self::Running { stage } | Self::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Trim and collapse internal whitespace runs to single spaces.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic comparison key: whitespace-collapsed and lowercased.
pub fn fold_key(input: &str) -> String {
    collapse_whitespace(input).to_lowercase()
}
