//! Memory consolidation engine (SPEC_FULL.md §4.5).
//!
//! Groups a bank's non-consolidated, non-observation memory units by
//! exact tag set, and for every batch at or above its threshold asks
//! the judge LLM to propose create/update/delete actions over the
//! observations already sharing that tag set. Actions run serially —
//! creates, then updates, then deletes — and an action that references
//! an observation outside the batch's authorized set is rejected on
//! its own without failing its siblings (§4.5.2's per-fact
//! authorization map is the mechanism that makes that check cheap:
//! it's a `HashSet` membership test, not a second LLM round-trip).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::embeddings::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::llm::{call_structured, CallScope, LlmClient, Message};
use crate::memory::{new_id, FactType, HistoryAction, HistoryEntry, MemoryUnit, MentalModel};
use crate::storage::Storage;
use crate::tags::TagSet;

/// Default batch-size threshold when a bank doesn't override it via
/// `BankConfig::consolidation_batch_size`.
pub const DEFAULT_BATCH_THRESHOLD: usize = 5;

#[derive(Debug, Default, Clone)]
pub struct ConsolidationOutcome {
    pub batches_processed: usize,
    pub observations_created: usize,
    pub observations_updated: usize,
    pub observations_invalidated: usize,
    pub facts_consolidated: usize,
    pub rejected_actions: Vec<String>,
}

/// One proposed change to a tag scope's observation set, as returned
/// by the judge LLM. `#[serde(deny_unknown_fields)]` so a
/// hallucinated extra field fails parsing loudly rather than silently
/// being ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
enum ConsolidationAction {
    Create { source_memory_ids: Vec<String>, text: String },
    Update { observation_id: String, source_memory_ids: Vec<String>, text: String },
    Delete { observation_id: String, reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsolidationResponse {
    actions: Vec<ConsolidationAction>,
}

/// Run consolidation over every eligible tag-set batch in a bank.
/// `operation_id` is the async-operation row this run is recorded
/// under, threaded into every `HistoryEntry` it writes.
pub async fn run_consolidation(
    storage: &Storage,
    llm: &dyn LlmClient,
    embeddings: &dyn EmbeddingProvider,
    bank_id: &str,
    operation_id: &str,
    batch_threshold: usize,
) -> Result<ConsolidationOutcome> {
    let mut outcome = ConsolidationOutcome::default();

    let batches = storage.units_by_exact_tag_set(bank_id)?;
    let existing_observations = storage.observations_by_exact_tag_set(bank_id)?;

    for (tag_key, facts) in batches {
        if facts.len() < batch_threshold {
            continue;
        }
        let tags = facts[0].tags.clone();
        let scope_observations = existing_observations.get(&tag_key).cloned().unwrap_or_default();
        let facts_by_id: HashMap<&str, &MemoryUnit> = facts.iter().map(|f| (f.id.as_str(), f)).collect();

        // The authorization universe for this batch: every existing
        // observation that shares its exact tag set. Every fact in the
        // batch is equally authorized against all of them, since tag
        // scope -- not per-fact content -- is the isolation boundary.
        let authorized_observation_ids: HashSet<String> = scope_observations.iter().map(|o| o.id.clone()).collect();
        let per_fact_obs_ids: HashMap<String, Vec<String>> =
            facts.iter().map(|f| (f.id.clone(), authorized_observation_ids.iter().cloned().collect())).collect();

        let response = propose_actions(llm, &facts, &scope_observations).await?;

        let mut consolidated_fact_ids: HashSet<String> = HashSet::new();
        let now = Utc::now();

        for action in response.actions {
            match action {
                ConsolidationAction::Create { source_memory_ids, text } => {
                    if !source_memory_ids.iter().all(|id| per_fact_obs_ids.contains_key(id)) {
                        outcome.rejected_actions.push(format!("create referenced a fact outside its batch: {source_memory_ids:?}"));
                        continue;
                    }
                    let cited: Vec<&MemoryUnit> = source_memory_ids.iter().filter_map(|id| facts_by_id.get(id.as_str()).copied()).collect();
                    let (occurred_start, occurred_end, mentioned_at) = temporal_bounds(cited.into_iter());
                    let embedding = embed_text(embeddings, &text)?;
                    let unit = MemoryUnit {
                        id: new_id(),
                        bank_id: bank_id.to_string(),
                        fact_type: FactType::Observation,
                        text,
                        embedding: Some(embedding),
                        tags: tags.clone(),
                        document_id: None,
                        event_date: None,
                        occurred_start,
                        occurred_end,
                        mentioned_at,
                        created_at: now,
                        updated_at: now,
                        consolidated_at: None,
                        source_memory_ids: source_memory_ids.clone(),
                        proof_count: source_memory_ids.len() as u32,
                        history: vec![HistoryEntry { at: now, operation_id: operation_id.to_string(), action: HistoryAction::Created, detail: None }],
                    };
                    storage.insert_memory(&unit)?;
                    outcome.observations_created += 1;
                    consolidated_fact_ids.extend(source_memory_ids);
                }
                ConsolidationAction::Update { observation_id, source_memory_ids, text } => {
                    if !authorized_observation_ids.contains(&observation_id) {
                        outcome.rejected_actions.push(format!("update referenced unauthorized observation {observation_id}"));
                        continue;
                    }
                    if !source_memory_ids.iter().all(|id| per_fact_obs_ids.contains_key(id)) {
                        outcome.rejected_actions.push(format!("update referenced a fact outside its batch: {source_memory_ids:?}"));
                        continue;
                    }
                    let mut observation = storage.get_memory(&observation_id)?;
                    observation.text = text;
                    for id in &source_memory_ids {
                        if !observation.source_memory_ids.contains(id) {
                            observation.source_memory_ids.push(id.clone());
                        }
                    }
                    observation.proof_count = observation.source_memory_ids.len() as u32;

                    let cited: Vec<&MemoryUnit> = source_memory_ids.iter().filter_map(|id| facts_by_id.get(id.as_str()).copied()).collect();
                    let (cited_start, cited_end, cited_mentioned) = temporal_bounds(cited.into_iter());
                    observation.occurred_start = merge_min(observation.occurred_start, cited_start);
                    observation.occurred_end = merge_max(observation.occurred_end, cited_end);
                    observation.mentioned_at = merge_max(observation.mentioned_at, cited_mentioned);
                    observation.embedding = Some(embed_text(embeddings, &observation.text)?);
                    observation.updated_at = now;
                    observation.history.push(HistoryEntry {
                        at: now,
                        operation_id: operation_id.to_string(),
                        action: HistoryAction::Reinforced,
                        detail: None,
                    });
                    storage.update_memory(&observation)?;
                    outcome.observations_updated += 1;
                    consolidated_fact_ids.extend(source_memory_ids);
                }
                ConsolidationAction::Delete { observation_id, reason } => {
                    if !authorized_observation_ids.contains(&observation_id) {
                        outcome.rejected_actions.push(format!("delete referenced unauthorized observation {observation_id}"));
                        continue;
                    }
                    storage.invalidate_observation(bank_id, &observation_id, operation_id, Some(reason), now)?;
                    outcome.observations_invalidated += 1;
                }
            }
        }

        // §4.5.2 step 5: every memory in the batch is marked consolidated,
        // whether or not it produced an action -- a fact the judge left
        // untouched (or only cited in a rejected action) still leaves the
        // queue, or it would be re-offered to the judge on every future
        // run. `consolidated_fact_ids` (the create/update participants) is
        // a subset of this and only still tracked for `facts_consolidated`
        // bookkeeping.
        let all_fact_ids: Vec<String> = facts.iter().map(|f| f.id.clone()).collect();
        outcome.facts_consolidated += consolidated_fact_ids.len();
        storage.mark_consolidated(&all_fact_ids, now)?;

        refresh_mental_model(storage, llm, bank_id, &tags).await?;
        outcome.batches_processed += 1;
    }

    Ok(outcome)
}

/// §4.5.2 Create/Update temporal bounds: earliest start, latest end,
/// latest mention across the cited source facts. A fact with only an
/// `event_date` (no interval of its own) contributes that date as both
/// endpoints, so a lone point-in-time fact still widens the range.
fn temporal_bounds<'a>(
    facts: impl Iterator<Item = &'a MemoryUnit>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut start = None;
    let mut end = None;
    let mut mentioned = None;
    for fact in facts {
        start = merge_min(start, fact.occurred_start.or(fact.event_date));
        end = merge_max(end, fact.occurred_end.or(fact.event_date));
        mentioned = merge_max(mentioned, fact.mentioned_at);
    }
    (start, end, mentioned)
}

fn merge_min(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn merge_max(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

/// Embed one observation's text, per §4.5.2's "embed the text" step.
fn embed_text(embeddings: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let vectors = embeddings.encode(&[text]).map_err(|e| EngineError::Validation(e.to_string()))?;
    vectors.into_iter().next().ok_or_else(|| EngineError::Validation("embedding provider returned no vector".to_string()))
}

async fn propose_actions(llm: &dyn LlmClient, facts: &[MemoryUnit], observations: &[MemoryUnit]) -> Result<ConsolidationResponse> {
    let facts_block = facts.iter().map(|f| format!("- [{}] {}", f.id, f.text)).collect::<Vec<_>>().join("\n");
    let observations_block = if observations.is_empty() {
        "(none yet)".to_string()
    } else {
        observations.iter().map(|o| format!("- [{}] {}", o.id, o.text)).collect::<Vec<_>>().join("\n")
    };

    let prompt = format!(
        "New facts sharing one tag scope:\n{facts_block}\n\n\
         Existing observations in that same tag scope:\n{observations_block}\n\n\
         Propose a JSON object `{{\"actions\": [...]}}` where each action is one of:\n\
         {{\"action\": \"create\", \"source_memory_ids\": [...], \"text\": \"...\"}}\n\
         {{\"action\": \"update\", \"observation_id\": \"...\", \"source_memory_ids\": [...], \"text\": \"...\"}}\n\
         {{\"action\": \"delete\", \"observation_id\": \"...\", \"reason\": \"...\"}}\n\
         Only reference memory ids and observation ids listed above.",
    );

    let messages = [
        Message::system(CONSOLIDATION_SYSTEM_PROMPT),
        Message::user(prompt),
    ];

    call_structured(llm, &messages, CallScope::Judge, 2, std::time::Duration::from_secs(30)).await
}

const CONSOLIDATION_SYSTEM_PROMPT: &str = "You are a memory consolidation judge. You synthesize \
repeated or related facts sharing one tag scope into durable observations, reinforce an existing \
observation when a new fact confirms it, and retract an observation when new facts contradict it. \
Never invent facts or observation ids that were not given to you.";

/// Re-synthesize a tag scope's mental model after a consolidation
/// pass touches it (§4.5.3). Best-effort: a judge failure here does
/// not roll back the consolidation actions that already committed.
async fn refresh_mental_model(storage: &Storage, llm: &dyn LlmClient, bank_id: &str, tags: &TagSet) -> Result<()> {
    let observations = storage
        .observations_by_exact_tag_set(bank_id)?
        .remove(&tags.canonical_key())
        .unwrap_or_default();
    if observations.is_empty() {
        return Ok(());
    }

    let based_on: Vec<String> = observations.iter().map(|o| o.id.clone()).collect();
    let block = observations.iter().map(|o| format!("- {}", o.text)).collect::<Vec<_>>().join("\n");
    let prompt = format!("Observations for this tag scope:\n{block}\n\nWrite a short mental-model summary as JSON: {{\"summary\": \"...\"}}");

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SummaryResponse {
        summary: String,
    }

    let messages = [
        Message::system("You summarize a set of observations into a concise standing mental model."),
        Message::user(prompt),
    ];

    let parsed: std::result::Result<SummaryResponse, EngineError> =
        call_structured(llm, &messages, CallScope::Judge, 1, std::time::Duration::from_secs(20)).await;

    let Ok(parsed) = parsed else { return Ok(()) };

    let existing = storage.mental_model_matching(bank_id, tags, crate::tags::TagMatchMode::AllStrict)?;
    let model = MentalModel {
        id: existing.map(|m| m.id).unwrap_or_else(new_id),
        bank_id: bank_id.to_string(),
        tags: tags.clone(),
        summary: parsed.summary,
        based_on,
        updated_at: Utc::now(),
    };
    storage.upsert_mental_model(&model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fixtures::FakeLlmClient;
    use crate::memory::BankConfig;

    struct FixedEmbedder(usize);
    impl EmbeddingProvider for FixedEmbedder {
        fn dimensions(&self) -> usize {
            self.0
        }
        fn encode(&self, texts: &[&str]) -> std::result::Result<Vec<Vec<f32>>, crate::embeddings::EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn seed_fact(storage: &Storage, bank_id: &str, text: &str, tags: &[&str]) -> MemoryUnit {
        let now = Utc::now();
        let unit = MemoryUnit {
            id: new_id(),
            bank_id: bank_id.to_string(),
            fact_type: FactType::World,
            text: text.to_string(),
            embedding: None,
            tags: TagSet::new(tags.iter().map(|s| s.to_string())),
            document_id: None,
            event_date: None,
            occurred_start: None,
            occurred_end: None,
            mentioned_at: None,
            created_at: now,
            updated_at: now,
            consolidated_at: None,
            source_memory_ids: vec![],
            proof_count: 0,
            history: vec![],
        };
        storage.insert_memory(&unit).unwrap();
        unit
    }

    #[tokio::test]
    async fn creates_an_observation_and_marks_sources_consolidated() {
        let storage = Storage::open_in_memory("consolidation_create").unwrap();
        let bank = crate::memory::Bank { id: new_id(), name: "t".into(), embedding_dim: 4, created_at: Utc::now(), config: BankConfig::default() };
        storage.create_bank(&bank).unwrap();

        let facts: Vec<MemoryUnit> = (0..3).map(|i| seed_fact(&storage, &bank.id, &format!("fact {i}"), &["work"])).collect();
        let ids: Vec<String> = facts.iter().map(|f| f.id.clone()).collect();

        let actions_json = serde_json::json!({
            "actions": [{"action": "create", "source_memory_ids": ids, "text": "synthesized observation"}]
        })
        .to_string();
        let summary_json = serde_json::json!({"summary": "a short summary"}).to_string();
        let llm = FakeLlmClient::new(vec![actions_json, summary_json]);
        let embedder = FixedEmbedder(4);

        let outcome = run_consolidation(&storage, &llm, &embedder, &bank.id, "op-1", 3).await.unwrap();
        assert_eq!(outcome.observations_created, 1);
        assert_eq!(outcome.facts_consolidated, 3);

        for id in &ids {
            assert!(storage.get_memory(id).unwrap().consolidated_at.is_some());
        }

        let observations = storage.observations_by_exact_tag_set(&bank.id).unwrap();
        let observation = observations.values().flatten().next().unwrap();
        assert_eq!(observation.proof_count, 3);
        assert_eq!(observation.source_memory_ids.len(), 3);
        assert!(observation.embedding.is_some());
    }

    #[tokio::test]
    async fn below_threshold_batches_are_skipped() {
        let storage = Storage::open_in_memory("consolidation_skip").unwrap();
        let bank = crate::memory::Bank { id: new_id(), name: "t".into(), embedding_dim: 4, created_at: Utc::now(), config: BankConfig::default() };
        storage.create_bank(&bank).unwrap();
        seed_fact(&storage, &bank.id, "lone fact", &["solo"]);

        let llm = FakeLlmClient::new(vec![]);
        let embedder = FixedEmbedder(4);
        let outcome = run_consolidation(&storage, &llm, &embedder, &bank.id, "op-1", 5).await.unwrap();
        assert_eq!(outcome.batches_processed, 0);
    }
}
