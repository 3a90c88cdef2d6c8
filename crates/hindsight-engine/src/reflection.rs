//! Reflection: contextual synthesis over a recall (SPEC_FULL.md §4.7).
//!
//! A read-side collaborator that runs a recall, then asks the memory
//! LLM to synthesize free-form answer text grounded in what came back,
//! plus a `based_on` record of exactly what it drew on. `based_on`'s
//! three fields are always present, never `Option`-wrapped, so an
//! empty recall serializes to `{"memories":[],"mental_models":[],
//! "directives":[]}` rather than nulls — a caller's deserializer should
//! never need a null-check here.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::{call_structured, CallScope, LlmClient, Message};
use crate::memory::MemoryUnit;
use crate::search::{assemble_recall, RecallConfig, RecallRequest};
use crate::storage::Storage;
use crate::tags::TagSet;

/// What the reflection's answer was grounded in. Always fully
/// populated, even when empty — see module doc comment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasedOn {
    #[serde(default)]
    pub memories: Vec<String>,
    #[serde(default)]
    pub mental_models: Vec<String>,
    #[serde(default)]
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectionResult {
    pub answer: String,
    pub based_on: BasedOn,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SynthesisResponse {
    answer: String,
}

/// Run a recall against `query`/`tags`, then synthesize an answer over
/// the recalled memories, the tag scope's mental model (if any), and
/// any directives in scope. `embed_query` produces the dense query
/// vector; reflection does not own embedding itself (§6 contract: the
/// embedding service is injected at every call site that needs one,
/// never constructed ad hoc).
pub async fn reflect(
    storage: &Storage,
    llm: &dyn LlmClient,
    bank_id: &str,
    query: &str,
    tags: &TagSet,
    query_embedding: &[f32],
    config: RecallConfig,
) -> Result<ReflectionResult> {
    let now = Utc::now();
    let dense = storage.candidates_by_dense(bank_id, query_embedding, recall_pool_size(&config))?;
    let sparse = storage.candidates_by_sparse(bank_id, query, recall_pool_size(&config))?;
    let temporal = storage.candidates_by_temporal(bank_id, now, recall_pool_size(&config))?;

    let candidate_ids: std::collections::HashSet<String> =
        dense.iter().chain(sparse.iter()).chain(temporal.iter()).map(|(id, _)| id.clone()).collect();
    let candidates: Vec<MemoryUnit> = storage.fetch_by_ids(&candidate_ids.into_iter().collect::<Vec<_>>())?;

    let request = RecallRequest { query: query.to_string(), tags: tags.clone(), config };
    let recalled = assemble_recall(&request, &dense, &sparse, &temporal, &candidates, now);

    let by_id: std::collections::HashMap<&str, &MemoryUnit> = candidates.iter().map(|m| (m.id.as_str(), m)).collect();
    let memory_texts: Vec<&MemoryUnit> = recalled.results.iter().filter_map(|r| by_id.get(r.memory_id.as_str()).copied()).collect();

    let mental_model = storage.mental_model_matching(bank_id, tags, crate::tags::TagMatchMode::Any)?;
    let directives = storage.directives_matching(bank_id, tags, crate::tags::TagMatchMode::Any)?;

    let based_on = BasedOn {
        memories: memory_texts.iter().map(|m| m.id.clone()).collect(),
        mental_models: mental_model.iter().map(|m| m.id.clone()).collect(),
        directives: directives.iter().map(|d| d.id.clone()).collect(),
    };

    if memory_texts.is_empty() && mental_model.is_none() && directives.is_empty() {
        return Ok(ReflectionResult { answer: String::new(), based_on });
    }

    let answer = synthesize(llm, query, &memory_texts, mental_model.as_ref().map(|m| m.summary.as_str()), &directives).await?;
    Ok(ReflectionResult { answer, based_on })
}

fn recall_pool_size(config: &RecallConfig) -> usize {
    config.rerank_candidate_count.max(config.result_limit)
}

async fn synthesize(
    llm: &dyn LlmClient,
    query: &str,
    memories: &[&MemoryUnit],
    mental_model: Option<&str>,
    directives: &[crate::memory::Directive],
) -> Result<String> {
    let memories_block = if memories.is_empty() {
        "(none)".to_string()
    } else {
        memories.iter().map(|m| format!("- {}", m.text)).collect::<Vec<_>>().join("\n")
    };
    let model_block = mental_model.unwrap_or("(none)");
    let directives_block = if directives.is_empty() {
        "(none)".to_string()
    } else {
        directives.iter().map(|d| format!("- {}", d.text)).collect::<Vec<_>>().join("\n")
    };

    let prompt = format!(
        "Question: {query}\n\nRelevant memories:\n{memories_block}\n\nStanding mental model:\n{model_block}\n\n\
         Directives:\n{directives_block}\n\nAnswer the question using only the information above, as JSON: \
         {{\"answer\": \"...\"}}"
    );

    let messages = [
        Message::system("You answer questions grounded strictly in the memories, mental model, and directives provided."),
        Message::user(prompt),
    ];

    let response: SynthesisResponse =
        call_structured(llm, &messages, CallScope::Memory, 2, std::time::Duration::from_secs(30)).await?;
    Ok(response.answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fixtures::FakeLlmClient;
    use crate::memory::{new_id, Bank, BankConfig, FactType};

    fn unit(bank_id: &str, text: &str, embedding: Vec<f32>) -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            id: new_id(),
            bank_id: bank_id.to_string(),
            fact_type: FactType::World,
            text: text.to_string(),
            embedding: Some(embedding),
            tags: TagSet::default(),
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
        }
    }

    #[tokio::test]
    async fn empty_recall_returns_empty_based_on_without_calling_the_llm() {
        let storage = Storage::open_in_memory("reflection_empty").unwrap();
        let bank = Bank { id: new_id(), name: "t".into(), embedding_dim: 4, created_at: Utc::now(), config: BankConfig::default() };
        storage.create_bank(&bank).unwrap();

        let llm = FakeLlmClient::new(vec![]);
        let result = reflect(&storage, &llm, &bank.id, "anything", &TagSet::default(), &[1.0, 0.0, 0.0, 0.0], RecallConfig::default())
            .await
            .unwrap();

        assert!(result.based_on.memories.is_empty());
        assert!(result.based_on.mental_models.is_empty());
        assert!(result.based_on.directives.is_empty());
    }

    #[tokio::test]
    async fn reflection_synthesizes_an_answer_grounded_in_recalled_memories() {
        let storage = Storage::open_in_memory("reflection_synthesize").unwrap();
        let bank = Bank { id: new_id(), name: "t".into(), embedding_dim: 4, created_at: Utc::now(), config: BankConfig::default() };
        storage.create_bank(&bank).unwrap();
        storage.insert_memory(&unit(&bank.id, "likes climbing on weekends", vec![1.0, 0.0, 0.0, 0.0])).unwrap();

        let response = serde_json::json!({"answer": "They like climbing on weekends."}).to_string();
        let llm = FakeLlmClient::new(vec![response]);

        let result = reflect(
            &storage,
            &llm,
            &bank.id,
            "what do they like to do",
            &TagSet::default(),
            &[1.0, 0.0, 0.0, 0.0],
            RecallConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.answer, "They like climbing on weekends.");
        assert_eq!(result.based_on.memories.len(), 1);
    }
}
