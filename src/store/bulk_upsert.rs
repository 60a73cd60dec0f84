//! Bulk Upsert Engine (§4.3): validate, chunk, transactionally merge,
//! retry, and fall back to per-row operation on persistent batch failure.

use std::time::Duration;

use tracing::{error, warn};

use crate::models::Asset;

use super::{AssetStore, MergeResult};

const CHUNK_SIZE: usize = 500;
const MAX_BATCH_RETRIES: u32 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct BulkUpsertOutcome {
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl BulkUpsertOutcome {
    fn merge(&mut self, other: BulkUpsertOutcome) {
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

pub struct BulkUpsertEngine<'a> {
    store: &'a AssetStore,
}

impl<'a> BulkUpsertEngine<'a> {
    pub fn new(store: &'a AssetStore) -> Self {
        Self { store }
    }

    /// `bulkUpsert(records, onProgress)`: validate and sanitize, chunk into
    /// batches of 500, merge each transactionally with retry, falling back
    /// to per-row upsert on final batch failure. `on_progress(processed,
    /// total)` fires after each batch commits (§4.3).
    pub async fn bulk_upsert<F>(&self, records: Vec<Asset>, mut on_progress: F) -> BulkUpsertOutcome
    where
        F: FnMut(usize, usize),
    {
        let total = records.len();
        let mut processed = 0usize;
        let mut outcome = BulkUpsertOutcome::default();

        let (valid, invalid) = self.validate_and_sanitize(records);
        outcome.errors += invalid as u64;

        for chunk in valid.chunks(CHUNK_SIZE) {
            let chunk_outcome = self.merge_batch_with_retry(chunk).await;
            outcome.merge(chunk_outcome);
            processed += chunk.len();
            on_progress(processed, total);
        }

        outcome
    }

    /// Validate and sanitize each record (§4.3 step 1). Rejected rows are
    /// counted but never fatal.
    fn validate_and_sanitize(&self, mut records: Vec<Asset>) -> (Vec<Asset>, usize) {
        let mut invalid = 0usize;
        records.retain_mut(|asset| {
            asset.sanitize();
            match asset.validate_symbol() {
                Ok(()) => true,
                Err(reason) => {
                    warn!(symbol = %asset.symbol, reason, "rejecting asset row at validation");
                    invalid += 1;
                    false
                }
            }
        });
        (records, invalid)
    }

    async fn merge_batch_with_retry(&self, batch: &[Asset]) -> BulkUpsertOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.upsert_batch(batch) {
                Ok(results) => return tally(results),
                Err(err) => {
                    if attempt >= MAX_BATCH_RETRIES {
                        error!(attempt, error = %err, "batch merge failed after retries, falling back to per-row upsert");
                        return self.per_row_fallback(batch);
                    }
                    let backoff = Duration::from_secs(attempt as u64);
                    warn!(attempt, error = %err, backoff_secs = backoff.as_secs(), "batch merge failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Per-row fallback (§4.3 step 5): a failed batch is retried 3 times,
    /// then split so one bad row cannot block the other 499.
    fn per_row_fallback(&self, batch: &[Asset]) -> BulkUpsertOutcome {
        let mut outcome = BulkUpsertOutcome::default();
        for asset in batch {
            match self.store.upsert_one(asset) {
                Ok(MergeResult::Inserted) => outcome.created += 1,
                Ok(MergeResult::Updated) => outcome.updated += 1,
                Err(err) => {
                    warn!(symbol = %asset.symbol, error = %err, "per-row upsert failed");
                    outcome.errors += 1;
                }
            }
        }
        outcome
    }
}

fn tally(results: Vec<MergeResult>) -> BulkUpsertOutcome {
    let mut outcome = BulkUpsertOutcome::default();
    for r in results {
        match r {
            MergeResult::Inserted => outcome.created += 1,
            MergeResult::Updated => outcome.updated += 1,
        }
    }
    outcome
}
