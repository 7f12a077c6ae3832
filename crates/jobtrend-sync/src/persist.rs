use jobtrend_core::CleanedRecord;
use jobtrend_storage::db::{BatchTx, StoreError, StoreResult, UpsertOutcome};
use jobtrend_storage::Database;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("batch rolled back at posting {external_id}: {source}")]
    Record {
        external_id: String,
        #[source]
        source: StoreError,
    },
    #[error("batch transaction failed: {0}")]
    Transaction(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Re-sightings older than the stored row; left as they were.
    pub stale: usize,
}

impl BatchOutcome {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted(_) => self.inserted += 1,
            UpsertOutcome::Updated(_) => self.updated += 1,
            UpsertOutcome::Stale(_) => self.stale += 1,
        }
    }
}

/// Sole writer of posting data. Each call to [`PersistenceCoordinator::apply_batch`] is one
/// transaction: it either lands completely or not at all.
#[derive(Debug, Clone)]
pub struct PersistenceCoordinator {
    db: Database,
}

impl PersistenceCoordinator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn apply_batch(
        &self,
        records: &[CleanedRecord],
    ) -> Result<BatchOutcome, PersistenceError> {
        let mut tx = self.db.begin_batch().await?;
        let mut outcome = BatchOutcome::default();

        for record in records {
            match apply_record(&mut tx, record).await {
                Ok(result) => outcome.record(result),
                Err(source) => {
                    if let Err(err) = tx.rollback().await {
                        warn!(error = %err, "explicit rollback failed; connection drop will discard the batch");
                    }
                    return Err(PersistenceError::Record {
                        external_id: record.external_id.clone(),
                        source,
                    });
                }
            }
        }

        tx.commit().await?;
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            stale = outcome.stale,
            "batch committed"
        );
        Ok(outcome)
    }
}

async fn apply_record(tx: &mut BatchTx, record: &CleanedRecord) -> StoreResult<UpsertOutcome> {
    // Stale re-sightings touch nothing, not even the company and location tables.
    if let Some(id) = tx.newer_row(record).await? {
        return Ok(UpsertOutcome::Stale(id));
    }
    let location_id = tx.resolve_location(&record.location).await?;
    let company_id = match &record.company {
        Some(company) => Some(tx.resolve_company(company).await?),
        None => None,
    };
    let outcome = tx.upsert_posting(record, company_id, location_id).await?;
    if let UpsertOutcome::Stale(_) = outcome {
        return Ok(outcome);
    }

    let mut skill_ids = Vec::with_capacity(record.skills.len());
    for skill in &record.skills {
        skill_ids.push(tx.resolve_skill(skill).await?);
    }
    tx.replace_posting_skills(outcome.posting_id(), &skill_ids)
        .await?;
    Ok(outcome)
}
