//! Temporal candidate pool: memories whose best-date falls within a
//! requested window, ranked by recency. One of the three candidate
//! sources fused by the hybrid pipeline (SPEC_FULL.md §4.6 step 2).

use chrono::{DateTime, Utc};

/// A memory surfaced by a temporal-window scan, with enough information
/// for the fusion step to score and dedupe it alongside dense/sparse
/// candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalCandidate {
    pub memory_id: String,
    pub best_date: DateTime<Utc>,
}

impl TemporalCandidate {
    pub fn new(memory_id: impl Into<String>, best_date: DateTime<Utc>) -> Self {
        Self {
            memory_id: memory_id.into(),
            best_date,
        }
    }
}

/// Rank candidates by recency (most recent first), optionally biased
/// toward a reference instant rather than "now" — used when recall asks
/// for memories near a specific point in time rather than the freshest
/// ones.
pub fn rank_by_recency(mut candidates: Vec<TemporalCandidate>, reference: DateTime<Utc>) -> Vec<(String, f32)> {
    candidates.sort_by(|a, b| {
        let da = (reference - a.best_date).num_seconds().abs();
        let db = (reference - b.best_date).num_seconds().abs();
        da.cmp(&db).then_with(|| a.memory_id.cmp(&b.memory_id))
    });

    let n = candidates.len().max(1) as f32;
    candidates
        .into_iter()
        .enumerate()
        .map(|(rank, c)| (c.memory_id, 1.0 - (rank as f32 / n)))
        .collect()
}
