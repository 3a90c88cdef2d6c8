//! End-to-end recall scenarios from SPEC_FULL.md §8: chunk attachment
//! is independent of the fact token budget, and recall is deterministic
//! for a fixed set of inputs.

use chrono::Utc;
use hindsight_engine::{recall, retain, FakeLlmClient, RecallConfig, RecallRequest, RetainRequest, TagSet};
use hindsight_e2e_tests::harness::db_manager::TestBank;
use hindsight_e2e_tests::mocks::fixtures::{scripts, ScriptedEmbedder};

/// Scenario 5 (§8): a zero token budget empties the fact result list,
/// but with `include_chunks` set, the document this fact belongs to
/// still yields chunks -- chunk assembly draws on the pre-budget rank
/// order, not the budgeted one.
#[tokio::test]
async fn zero_token_budget_still_returns_chunks() {
    let bank = TestBank::new_in_memory("recall_chunk_independence");
    let embedder = ScriptedEmbedder::new(4);
    embedder.set_override("the team published three papers on quantum error correction", vec![1.0, 0.0, 0.0, 0.0]);

    let long_content = "quantum computing research notes describing error correction breakthroughs. ".repeat(100);
    let llm = FakeLlmClient::new(vec![scripts::extraction_response(&[(
        "the team published three papers on quantum error correction",
        "world",
    )])]);

    let request = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: long_content,
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: Some("quantum notes".to_string()),
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    let outcome = retain(&bank.storage, &llm, &embedder, request).await.expect("retain long document");
    assert!(outcome.document_id.is_some(), "content above the chunk size must be stored as a document");
    assert_eq!(outcome.memory_ids.len(), 1);

    let recall_request = RecallRequest {
        query: "quantum error correction".to_string(),
        tags: TagSet::default(),
        config: RecallConfig { token_budget: Some(0), include_chunks: true, max_chunk_tokens: 2000, ..Default::default() },
    };
    let query_embedding = vec![1.0, 0.0, 0.0, 0.0];
    let recall_outcome = recall(&bank.storage, bank.bank_id(), &recall_request, &query_embedding, Utc::now()).expect("recall");

    assert!(recall_outcome.results.is_empty(), "a zero token budget must empty the fact result list");
    assert!(!recall_outcome.ranked.is_empty(), "pre-budget ranking must still have the candidate");
    assert!(!recall_outcome.chunks.is_empty(), "chunks must still be attached despite the zero fact budget");
}

/// Running the same recall request twice against an unchanged bank
/// returns the same ranked order and scores both times.
#[tokio::test]
async fn recall_is_deterministic_for_fixed_inputs() {
    let bank = TestBank::new_in_memory("recall_determinism");
    let embedder = ScriptedEmbedder::new(4);
    embedder.set_override("Alice loves hiking in the mountains", vec![1.0, 0.0, 0.0, 0.0]);
    embedder.set_override("Bob prefers swimming in the ocean", vec![0.0, 1.0, 0.0, 0.0]);

    let llm = FakeLlmClient::new(vec![
        scripts::extraction_response(&[("Alice loves hiking in the mountains", "opinion")]),
        scripts::extraction_response(&[("Bob prefers swimming in the ocean", "opinion")]),
    ]);

    let make_request = |content: &str| RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: content.to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    retain(&bank.storage, &llm, &embedder, make_request("Alice loves hiking in the mountains")).await.expect("retain alice");
    retain(&bank.storage, &llm, &embedder, make_request("Bob prefers swimming in the ocean")).await.expect("retain bob");

    let recall_request = RecallRequest { query: "hiking".to_string(), tags: TagSet::default(), config: RecallConfig::default() };
    let query_embedding = vec![1.0, 0.0, 0.0, 0.0];
    let now = Utc::now();

    let first = recall(&bank.storage, bank.bank_id(), &recall_request, &query_embedding, now).expect("first recall");
    let second = recall(&bank.storage, bank.bank_id(), &recall_request, &query_embedding, now).expect("second recall");

    let first_ids: Vec<&str> = first.results.iter().map(|r| r.memory_id.as_str()).collect();
    let second_ids: Vec<&str> = second.results.iter().map(|r| r.memory_id.as_str()).collect();
    assert_eq!(first_ids, second_ids);

    let first_scores: Vec<f32> = first.results.iter().map(|r| r.score).collect();
    let second_scores: Vec<f32> = second.results.iter().map(|r| r.score).collect();
    assert_eq!(first_scores, second_scores);
}
