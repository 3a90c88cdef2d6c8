//! Dense vector index.
//!
//! Brute-force cosine similarity over an in-memory cache of (id, embedding)
//! pairs, not an approximate HNSW index. SPEC_FULL.md §4.1 [FULL] calls
//! this out explicitly: the testable property "recall determinism under
//! fixed inputs" (§8) requires exact, reproducible nearest-neighbor order,
//! which an approximate index cannot guarantee across runs. Bank sizes in
//! scope for this engine (per-bank memory counts, not a global corpus)
//! make an O(n) scan per query acceptable; the id-reservation and
//! key-mapping idiom below is carried over from the teacher's usearch
//! wrapper even though the dependency itself is dropped.

use std::collections::HashMap;

pub const DEFAULT_DIMENSIONS: usize = 768;

/// Kept only as a public constant for compatibility with callers that
/// read it off a `VectorIndexConfig` for display/stats purposes; brute
/// force has no connectivity parameter of its own.
pub const DEFAULT_CONNECTIVITY: usize = 16;

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VectorSearchError {
    InvalidDimensions(usize, usize),
}

impl std::fmt::Display for VectorSearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorSearchError::InvalidDimensions(expected, got) => {
                write!(f, "invalid dimensions: expected {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for VectorSearchError {}

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimensions: usize,
}

/// A bank's dense index: a flat `Vec` of L2-normalized embeddings kept
/// incrementally in sync with `storage`'s writes, scanned linearly on
/// every query.
pub struct VectorIndex {
    config: VectorIndexConfig,
    key_to_slot: HashMap<String, usize>,
    slots: Vec<Option<(String, Vec<f32>)>>,
}

impl VectorIndex {
    pub fn new() -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::default())
    }

    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        Ok(Self {
            config,
            key_to_slot: HashMap::new(),
            slots: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.key_to_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// No-op: a flat Vec needs no pre-reservation to stay memory-safe,
    /// unlike the HNSW index this replaces. Kept so call sites written
    /// against the old API still compile unchanged.
    pub fn reserve(&self, _capacity: usize) -> Result<(), VectorSearchError> {
        Ok(())
    }

    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }
        let normalized = normalize(vector);
        if let Some(&slot) = self.key_to_slot.get(key) {
            self.slots[slot] = Some((key.to_string(), normalized));
            return Ok(());
        }
        let slot = self.slots.len();
        self.slots.push(Some((key.to_string(), normalized)));
        self.key_to_slot.insert(key.to_string(), slot);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, VectorSearchError> {
        if let Some(slot) = self.key_to_slot.remove(key) {
            self.slots[slot] = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_slot.contains_key(key)
    }

    /// Exact cosine nearest neighbors, highest similarity first. Ties
    /// break on key order so results are reproducible across runs with
    /// identical inputs.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                query.len(),
            ));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }
        let q = normalize(query);
        let mut scored: Vec<(String, f32)> = self
            .slots
            .iter()
            .flatten()
            .map(|(key, vec)| (key.clone(), dot(&q, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>, VectorSearchError> {
        let results = self.search(query, limit)?;
        Ok(results.into_iter().filter(|(_, score)| *score >= min_similarity).collect())
    }

    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
        }
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
