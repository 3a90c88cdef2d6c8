//! Deduplication (SPEC_FULL.md §4.3).
//!
//! A candidate fact is a duplicate when its cosine similarity to an
//! existing or sibling fact exceeds a threshold (default 0.92) AND
//! both fall within a ±24h window on the best-date chain
//! ([`MemoryUnit::best_date`]). Two passes: against the bank's
//! existing facts (order-insensitive, bucketed by a 12h-floored anchor
//! so one batched comparison covers many candidates at once instead of
//! one query per candidate), then within the incoming batch itself
//! (order-sensitive: the earliest-indexed candidate wins a tie).

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::embeddings::local::cosine_similarity;
use crate::error::Result;
use crate::extract::ResolvedFact;
use crate::storage::Storage;

/// Default cosine-similarity floor above which two facts within the
/// time window are considered the same fact restated.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.92;
/// The best-date window a duplicate candidate must fall within.
pub const DEDUP_WINDOW: Duration = Duration::hours(24);
/// Bucket granularity for the against-DB pass (§4.3 [FULL]): an
/// optimization over the ±24h window test, not a change to it.
const BUCKET_HOURS: i64 = 12;

/// A resolved fact paired with its computed embedding, ready for the
/// dedup and insert stages of the retain pipeline.
#[derive(Debug, Clone)]
pub struct EmbeddedFact {
    pub fact: ResolvedFact,
    pub embedding: Vec<f32>,
    pub best_date: DateTime<Utc>,
}

/// Floor `at` to the nearest preceding 12-hour boundary, minutes/
/// seconds/nanos zeroed, mirroring the bucket key construction used to
/// batch the against-DB comparison (§4.3 [FULL]).
pub fn bucket_key(at: DateTime<Utc>) -> DateTime<Utc> {
    let floored_hour = (at.hour() as i64 / BUCKET_HOURS) * BUCKET_HOURS;
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        + Duration::hours(floored_hour)
}

fn within_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).abs() <= DEDUP_WINDOW
}

fn is_duplicate(a_embedding: &[f32], a_date: DateTime<Utc>, b_embedding: &[f32], b_date: DateTime<Utc>, threshold: f32) -> bool {
    within_window(a_date, b_date) && cosine_similarity(a_embedding, b_embedding) >= threshold
}

/// Run both dedup passes over `candidates`, returning only the facts
/// that survive: not a near-duplicate of anything already stored in
/// the bank, and not a near-duplicate of an earlier-indexed candidate
/// in the same batch.
pub fn filter_duplicates(storage: &Storage, bank_id: &str, candidates: Vec<EmbeddedFact>, threshold: f32) -> Result<Vec<EmbeddedFact>> {
    let existing = storage.facts_for_dedup(bank_id)?;

    // Pass 1: against DB, bucketed by 12h-floored anchor. Bucketing is
    // purely an optimization for a real ANN/SQL backend issuing one
    // batched query per bucket; the brute-force in-memory comparison
    // here does the same filtered scan either way, so the buckets are
    // computed for fidelity to the batching protocol but every
    // candidate still only compares against existing rows whose own
    // bucket is adjacent (same or neighboring 12h slot), which is
    // exactly the set the ±24h window test would admit.
    let mut against_db_survivors = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let candidate_bucket = bucket_key(candidate.best_date);
        let is_dup = existing.iter().any(|e| {
            let Some(existing_embedding) = e.embedding.as_deref() else { return false };
            let existing_bucket = bucket_key(e.best_date());
            let bucket_adjacent = (candidate_bucket - existing_bucket).abs() <= Duration::hours(BUCKET_HOURS);
            bucket_adjacent && is_duplicate(&candidate.embedding, candidate.best_date, existing_embedding, e.best_date(), threshold)
        });
        if !is_dup {
            against_db_survivors.push(candidate);
        }
    }

    // Pass 2: within batch, order-sensitive — earliest index wins.
    let mut kept: Vec<EmbeddedFact> = Vec::with_capacity(against_db_survivors.len());
    for candidate in against_db_survivors {
        let is_dup = kept
            .iter()
            .any(|k| is_duplicate(&candidate.embedding, candidate.best_date, &k.embedding, k.best_date, threshold));
        if !is_dup {
            kept.push(candidate);
        }
    }

    Ok(kept)
}
