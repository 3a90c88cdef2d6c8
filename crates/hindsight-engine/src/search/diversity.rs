//! Diversity clustering for recall results.
//!
//! Ported in idiom (not code) from the original implementation's
//! `diversity.py`: candidates within cosine similarity `threshold` of
//! each other are connected-component clustered, and each cluster
//! contributes exactly one representative to the final result set, so
//! near-duplicate phrasings of the same fact don't crowd out distinct
//! memories. See SPEC_FULL.md §4.6 step 6.

use chrono::{DateTime, Utc};

/// Strip trailing `| When: ...` / `| Involving: ...` annotations that
/// the extractor appends to observation text for provenance, before the
/// text is scored for diversity or shown to a reranker — those
/// annotations are metadata, not content, and would otherwise inflate
/// lexical overlap between unrelated memories that share a speaker.
///
/// The extractor only ever appends these markers once, at the end of
/// the text, so finding the earliest marker and truncating there is
/// sufficient without pulling in the `regex` crate for one fixed shape.
pub fn strip_pipe_metadata(text: &str) -> String {
    const MARKERS: [&str; 2] = [" | When:", " | Involving:"];
    let cut = MARKERS
        .iter()
        .filter_map(|m| text.find(m))
        .min()
        .unwrap_or(text.len());
    text[..cut].trim_end().to_string()
}

/// One candidate as diversity clustering sees it: just enough to score
/// and cluster, independent of the richer `MemoryUnit` shape.
#[derive(Debug, Clone)]
pub struct DiversityCandidate {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub is_observation: bool,
    pub is_experience: bool,
    pub best_date: DateTime<Utc>,
    /// Cosine similarity to the query, already computed by the dense
    /// candidate pool.
    pub query_similarity: f32,
}

#[derive(Debug, Clone)]
pub struct ClusterRepresentative {
    pub id: String,
    pub query_similarity: f32,
    /// The composite score (`query_similarity + type_bonus + length_bonus
    /// + recency_bonus`) that won this candidate its cluster's
    /// representative slot. This, not the bare `query_similarity`, is
    /// what the final result list is ordered and scored by (§4.6 step 8).
    pub score: f32,
    pub cluster_size: usize,
}

/// Cluster `candidates` by pairwise cosine similarity at `threshold`
/// and return one representative per cluster, sorted by composite
/// score descending.
///
/// The representative of each cluster is the member maximizing:
/// `query_similarity + type_bonus + length_bonus + recency_bonus`,
/// where
/// - `type_bonus` = 0.3 for observations, 0.2 for experiences, 0.0 otherwise
/// - `length_bonus` = min(0.1, ln(1 + len(text)) / 70)
/// - `recency_bonus` = max(0.05, 1.0 - days_since(best_date) / 365)
///
/// These weights favor observations (already-consolidated, higher-proof
/// knowledge) and recent, substantive text when two candidates are
/// near-duplicates of each other.
pub fn cluster_and_select(candidates: &[DiversityCandidate], threshold: f32, now: DateTime<Utc>) -> Vec<ClusterRepresentative> {
    let n = candidates.len();
    if n == 0 {
        return vec![];
    }

    let normalized: Vec<Vec<f32>> = candidates.iter().map(|c| normalize(&c.embedding)).collect();

    let mut adjacency = vec![vec![false; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = dot(&normalized[i], &normalized[j]);
            if sim >= threshold {
                adjacency[i][j] = true;
                adjacency[j][i] = true;
            }
        }
    }

    let components = connected_components(&adjacency);

    let mut reps: Vec<ClusterRepresentative> = components
        .into_iter()
        .map(|component| {
            let best = component
                .iter()
                .copied()
                .max_by(|&a, &b| composite_score(&candidates[a], now).total_cmp(&composite_score(&candidates[b], now)))
                .expect("component is non-empty");
            ClusterRepresentative {
                id: candidates[best].id.clone(),
                query_similarity: candidates[best].query_similarity,
                score: composite_score(&candidates[best], now),
                cluster_size: component.len(),
            }
        })
        .collect();

    reps.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    reps
}

fn composite_score(c: &DiversityCandidate, now: DateTime<Utc>) -> f32 {
    let type_bonus = if c.is_observation {
        0.3
    } else if c.is_experience {
        0.2
    } else {
        0.0
    };
    let length_bonus = (1.0 + c.text.len() as f32).ln() / 70.0;
    let length_bonus = length_bonus.min(0.1);
    let days_since = (now - c.best_date).num_seconds() as f32 / 86_400.0;
    let recency_bonus = (1.0 - days_since / 365.0).max(0.05);
    c.query_similarity + type_bonus + length_bonus + recency_bonus
}

fn connected_components(adjacency: &[Vec<bool>]) -> Vec<Vec<usize>> {
    let n = adjacency.len();
    let mut visited = vec![false; n];
    let mut components = Vec::new();

    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start);
        visited[start] = true;
        while let Some(node) = queue.pop_front() {
            component.push(node);
            for (neighbor, &connected) in adjacency[node].iter().enumerate() {
                if connected && !visited[neighbor] {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }
        components.push(component);
    }
    components
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
