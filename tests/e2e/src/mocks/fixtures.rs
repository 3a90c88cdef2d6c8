//! Deterministic test doubles: a fake embedding provider plus JSON
//! builders for the scripted LLM responses `hindsight-engine`'s
//! extractor and consolidation judge expect, so scenario tests read as
//! data instead of hand-built JSON strings.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use hindsight_engine::{EmbeddingError, EmbeddingProvider};

/// A fake embedder with no model behind it: identical text always maps
/// to an identical vector (so "retain the same content twice" produces
/// a cosine similarity of exactly 1.0, without a real encoder), and
/// distinct text maps to a distinct, effectively-orthogonal vector
/// derived from a deterministic hash of the string (so unrelated facts
/// don't accidentally collide as near-duplicates). Tests that need an
/// exact engineered similarity between two *differently worded* facts
/// pin one or both with [`ScriptedEmbedder::set_override`].
pub struct ScriptedEmbedder {
    dimensions: usize,
    overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl ScriptedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions, overrides: Mutex::new(HashMap::new()) }
    }

    /// Pin `text`'s embedding to an exact vector, overriding the
    /// hash-derived default.
    pub fn set_override(&self, text: &str, vector: Vec<f32>) {
        self.overrides.lock().expect("scripted embedder mutex poisoned").insert(text.to_string(), vector);
    }
}

impl EmbeddingProvider for ScriptedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let overrides = self.overrides.lock().expect("scripted embedder mutex poisoned");
        Ok(texts
            .iter()
            .map(|text| overrides.get(*text).cloned().unwrap_or_else(|| seeded_vector(text, self.dimensions)))
            .collect())
    }
}

/// Deterministic xorshift stream seeded from a `DefaultHasher` digest
/// of `text` (fixed keys, so this is stable across runs/processes,
/// unlike `RandomState`). Not cryptographic, not a real embedding --
/// just repeatable per-string noise in [-1, 1].
fn seeded_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let mut state = hasher.finish().max(1);
    (0..dimensions)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state % 2001) as f32 / 1000.0) - 1.0
        })
        .collect()
}

/// JSON builders for the two schema-constrained LLM call sites
/// (`extract::extract_facts`, `consolidation::run_consolidation`) plus
/// `reflection::reflect`'s synthesis response, matched to the response
/// shapes those modules parse.
pub mod scripts {
    use serde_json::{json, Value};

    /// One extraction response: `facts` is `(text, fact_type)` pairs
    /// with no temporal fields (event_date/occurred_start/occurred_end
    /// all null) -- the common case for scenarios that only care about
    /// `mentioned_at` ordering or plain fact content.
    pub fn extraction_response(facts: &[(&str, &str)]) -> String {
        json!({
            "facts": facts
                .iter()
                .map(|(text, fact_type)| json!({
                    "text": text,
                    "fact_type": fact_type,
                    "event_date": null,
                    "occurred_start": null,
                    "occurred_end": null,
                }))
                .collect::<Vec<_>>()
        })
        .to_string()
    }

    /// One extraction response for a single fact with explicit temporal
    /// fields, RFC3339-formatted (or relative phrases the extractor's
    /// date resolver understands, since `extract::resolve_date` is
    /// exercised by these same scenario tests).
    #[allow(clippy::too_many_arguments)]
    pub fn extraction_response_with_dates(
        text: &str,
        fact_type: &str,
        event_date: Option<&str>,
        occurred_start: Option<&str>,
        occurred_end: Option<&str>,
    ) -> String {
        json!({
            "facts": [{
                "text": text,
                "fact_type": fact_type,
                "event_date": event_date,
                "occurred_start": occurred_start,
                "occurred_end": occurred_end,
            }]
        })
        .to_string()
    }

    pub fn create_action(source_memory_ids: &[String], text: &str) -> Value {
        json!({"action": "create", "source_memory_ids": source_memory_ids, "text": text})
    }

    pub fn update_action(observation_id: &str, source_memory_ids: &[String], text: &str) -> Value {
        json!({"action": "update", "observation_id": observation_id, "source_memory_ids": source_memory_ids, "text": text})
    }

    pub fn delete_action(observation_id: &str, reason: &str) -> Value {
        json!({"action": "delete", "observation_id": observation_id, "reason": reason})
    }

    pub fn consolidation_response(actions: Vec<Value>) -> String {
        json!({"actions": actions}).to_string()
    }

    pub fn no_actions_response() -> String {
        consolidation_response(vec![])
    }

    pub fn mental_model_summary(summary: &str) -> String {
        json!({"summary": summary}).to_string()
    }

    pub fn reflection_answer(answer: &str) -> String {
        json!({"answer": answer}).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_yields_identical_vectors() {
        let embedder = ScriptedEmbedder::new(8);
        let a = embedder.encode(&["the same sentence"]).unwrap();
        let b = embedder.encode(&["the same sentence"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_text_yields_distinct_vectors() {
        let embedder = ScriptedEmbedder::new(8);
        let a = embedder.encode(&["alpha fact"]).unwrap();
        let b = embedder.encode(&["beta fact"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn override_pins_an_exact_vector() {
        let embedder = ScriptedEmbedder::new(4);
        embedder.set_override("pinned", vec![1.0, 0.0, 0.0, 0.0]);
        let encoded = embedder.encode(&["pinned"]).unwrap();
        assert_eq!(encoded[0], vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn extraction_response_round_trips_through_serde() {
        let raw = scripts::extraction_response(&[("Alice loves hiking", "opinion")]);
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["facts"][0]["text"], "Alice loves hiking");
        assert_eq!(parsed["facts"][0]["fact_type"], "opinion");
    }
}
