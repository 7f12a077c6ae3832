//! Full-recompute aggregation over the base tables.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use jobtrend_core::{AggregateSnapshot, Dimension, UNKNOWN_INDUSTRY};
use jobtrend_storage::db::{AggregationInputs, StoreError};
use jobtrend_storage::Database;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("reading aggregation inputs: {0}")]
    Load(#[source] StoreError),
    #[error("writing aggregate snapshots: {0}")]
    Store(#[source] StoreError),
    #[error("{dimension} buckets sum to {sum}, expected {total}")]
    Inconsistent {
        dimension: Dimension,
        sum: i64,
        total: i64,
    },
}

pub struct AggregationEngine;

impl AggregationEngine {
    /// Derive every snapshot row from `inputs`. An empty store yields no rows.
    pub fn compute(inputs: &AggregationInputs) -> Result<Vec<AggregateSnapshot>, AggregationError> {
        let total = inputs.total_postings;
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut days: BTreeMap<String, i64> = BTreeMap::new();
        let mut weeks: BTreeMap<String, i64> = BTreeMap::new();
        let mut months: BTreeMap<String, i64> = BTreeMap::new();
        for (date, count) in &inputs.by_date {
            *days.entry(day_bucket(*date)).or_insert(0) += count;
            *weeks.entry(week_bucket(*date)).or_insert(0) += count;
            *months.entry(month_bucket(*date)).or_insert(0) += count;
        }

        let mut industries: BTreeMap<String, i64> = BTreeMap::new();
        for (industry, count) in &inputs.by_industry {
            let bucket = industry
                .clone()
                .unwrap_or_else(|| UNKNOWN_INDUSTRY.to_string());
            *industries.entry(bucket).or_insert(0) += count;
        }

        let mut skill_months: BTreeMap<String, (String, i64)> = BTreeMap::new();
        for (date, skill, count) in &inputs.skill_by_date {
            let month = month_bucket(*date);
            let entry = skill_months
                .entry(format!("{month}/{skill}"))
                .or_insert_with(|| (month, 0));
            entry.1 += count;
        }

        let mut out = Vec::new();
        for (dimension, buckets) in [
            (Dimension::Day, &days),
            (Dimension::Week, &weeks),
            (Dimension::Month, &months),
        ] {
            let sum: i64 = buckets.values().sum();
            if sum != total {
                return Err(AggregationError::Inconsistent {
                    dimension,
                    sum,
                    total,
                });
            }
            push_share(&mut out, dimension, buckets.iter().map(|(b, c)| (b.clone(), *c)), total);
        }

        push_share(&mut out, Dimension::Skill, inputs.by_skill.iter().cloned(), total);
        push_share(&mut out, Dimension::City, inputs.by_city.iter().cloned(), total);
        push_share(&mut out, Dimension::Industry, industries.into_iter(), total);
        push_share(&mut out, Dimension::Status, inputs.by_status.iter().cloned(), total);

        for (bucket, (month, count)) in skill_months {
            let month_total = months.get(&month).copied().unwrap_or(0);
            out.push(AggregateSnapshot {
                dimension: Dimension::SkillMonth,
                bucket,
                count,
                percentage: percentage(count, month_total),
            });
        }

        let city_totals: BTreeMap<&str, i64> = inputs
            .by_city
            .iter()
            .map(|(city, count)| (city.as_str(), *count))
            .collect();
        for (city, skill, count) in &inputs.skill_by_city {
            let city_total = city_totals.get(city.as_str()).copied().unwrap_or(0);
            out.push(AggregateSnapshot {
                dimension: Dimension::CitySkill,
                bucket: format!("{city}/{skill}"),
                count: *count,
                percentage: percentage(*count, city_total),
            });
        }

        out.sort_by(|a, b| {
            (a.dimension.as_str(), a.bucket.as_str()).cmp(&(b.dimension.as_str(), b.bucket.as_str()))
        });
        Ok(out)
    }

    /// Recompute from the store and swap the snapshot table in one transaction.
    pub async fn materialize(db: &Database) -> Result<Vec<AggregateSnapshot>, AggregationError> {
        let inputs = db
            .load_aggregation_inputs()
            .await
            .map_err(AggregationError::Load)?;
        let snapshots = Self::compute(&inputs)?;
        db.replace_aggregates(&snapshots)
            .await
            .map_err(AggregationError::Store)?;
        info!(
            postings = inputs.total_postings,
            rows = snapshots.len(),
            "aggregate snapshots materialized"
        );
        Ok(snapshots)
    }
}

fn push_share(
    out: &mut Vec<AggregateSnapshot>,
    dimension: Dimension,
    buckets: impl Iterator<Item = (String, i64)>,
    total: i64,
) {
    out.extend(buckets.map(|(bucket, count)| AggregateSnapshot {
        dimension,
        bucket,
        count,
        percentage: percentage(count, total),
    }));
}

fn percentage(count: i64, total: i64) -> Option<f64> {
    (total > 0).then(|| ((count as f64 * 100.0 / total as f64) * 100.0).round() / 100.0)
}

pub fn day_bucket(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// ISO week, so the first days of January can belong to the previous year's last week.
pub fn week_bucket(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

pub fn month_bucket(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn sample() -> AggregationInputs {
        AggregationInputs {
            total_postings: 4,
            by_date: vec![(d("2024-12-30"), 1), (d("2025-01-02"), 2), (d("2025-01-15"), 1)],
            by_city: vec![("Berlin".into(), 3), ("unknown".into(), 1)],
            by_skill: vec![("Python".into(), 3), ("SQL".into(), 2)],
            by_industry: vec![(None, 1), (Some("IT-Stellen".into()), 3)],
            by_status: vec![("active".into(), 3), ("expired".into(), 1)],
            skill_by_date: vec![
                (d("2025-01-02"), "Python".into(), 2),
                (d("2025-01-15"), "Python".into(), 1),
                (d("2024-12-30"), "SQL".into(), 1),
            ],
            skill_by_city: vec![
                ("Berlin".into(), "Python".into(), 3),
                ("Berlin".into(), "SQL".into(), 1),
                ("unknown".into(), "SQL".into(), 1),
            ],
        }
    }

    fn rows(snapshots: &[AggregateSnapshot], dimension: Dimension) -> Vec<(String, i64)> {
        snapshots
            .iter()
            .filter(|s| s.dimension == dimension)
            .map(|s| (s.bucket.clone(), s.count))
            .collect()
    }

    #[test]
    fn empty_store_yields_no_snapshots() {
        assert!(AggregationEngine::compute(&AggregationInputs::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn time_buckets_sum_to_total_and_use_iso_weeks() {
        let snapshots = AggregationEngine::compute(&sample()).unwrap();
        for dim in [Dimension::Day, Dimension::Week, Dimension::Month] {
            let sum: i64 = rows(&snapshots, dim).iter().map(|(_, c)| c).sum();
            assert_eq!(sum, 4, "{dim}");
        }
        assert_eq!(
            rows(&snapshots, Dimension::Week),
            vec![("2025-W01".to_string(), 3), ("2025-W03".to_string(), 1)]
        );
        assert_eq!(
            rows(&snapshots, Dimension::Month),
            vec![("2024-12".to_string(), 1), ("2025-01".to_string(), 3)]
        );
    }

    #[test]
    fn shares_and_unknown_industry() {
        let snapshots = AggregationEngine::compute(&sample()).unwrap();
        let python = snapshots
            .iter()
            .find(|s| s.dimension == Dimension::Skill && s.bucket == "Python")
            .unwrap();
        assert_eq!(python.percentage, Some(75.0));
        assert_eq!(
            rows(&snapshots, Dimension::Industry),
            vec![("IT-Stellen".to_string(), 3), ("unknown".to_string(), 1)]
        );
    }

    #[test]
    fn skill_month_share_is_relative_to_the_month() {
        let snapshots = AggregationEngine::compute(&sample()).unwrap();
        let jan_python = snapshots
            .iter()
            .find(|s| s.dimension == Dimension::SkillMonth && s.bucket == "2025-01/Python")
            .unwrap();
        assert_eq!(jan_python.count, 3);
        assert_eq!(jan_python.percentage, Some(100.0));
        let dec_sql = snapshots
            .iter()
            .find(|s| s.bucket == "2024-12/SQL")
            .unwrap();
        assert_eq!(dec_sql.percentage, Some(100.0));
    }

    #[test]
    fn city_skill_share_is_relative_to_the_city() {
        let snapshots = AggregationEngine::compute(&sample()).unwrap();
        assert_eq!(
            rows(&snapshots, Dimension::CitySkill),
            vec![
                ("Berlin/Python".to_string(), 3),
                ("Berlin/SQL".to_string(), 1),
                ("unknown/SQL".to_string(), 1),
            ]
        );
        let berlin_sql = snapshots
            .iter()
            .find(|s| s.bucket == "Berlin/SQL")
            .unwrap();
        assert_eq!(berlin_sql.percentage, Some(33.33));
        let unknown_sql = snapshots
            .iter()
            .find(|s| s.bucket == "unknown/SQL")
            .unwrap();
        assert_eq!(unknown_sql.percentage, Some(100.0));
    }

    #[test]
    fn inconsistent_inputs_are_an_error() {
        let mut inputs = sample();
        inputs.total_postings = 5;
        assert!(matches!(
            AggregationEngine::compute(&inputs),
            Err(AggregationError::Inconsistent { .. })
        ));
    }
}
