//! End-to-end deduplication scenarios from SPEC_FULL.md §8: a
//! within-batch duplicate pair keeps the earliest one, and re-retaining
//! the same content within the dedup window produces no new memory.

use chrono::Utc;
use hindsight_engine::{retain, FakeLlmClient, RetainRequest, TagSet};
use hindsight_e2e_tests::harness::db_manager::TestBank;
use hindsight_e2e_tests::mocks::fixtures::{scripts, ScriptedEmbedder};

/// Scenario 4 (§8): one `retain()` call extracts three facts, where
/// items 1 and 3 are differently-worded near-duplicates (cosine
/// similarity 0.98) and item 2 is unrelated. Two memories must survive:
/// item 2, and whichever of items 1/3 was extracted first.
#[tokio::test]
async fn within_batch_duplicate_keeps_the_earliest_fact() {
    let bank = TestBank::new_in_memory("dedup_within_batch");
    let embedder = ScriptedEmbedder::new(4);
    embedder.set_override("Alice loves hiking in the mountains", vec![1.0, 0.0, 0.0, 0.0]);
    embedder.set_override("Bob dislikes seafood entirely", vec![0.0, 1.0, 0.0, 0.0]);
    // cos(a, c) with a = [1,0,0,0]: 0.98 / sqrt(0.98^2 + 0.1989^2) ~= 0.98
    embedder.set_override("Alice really loves hiking in the mountains", vec![0.98, 0.1989949, 0.0, 0.0]);

    let llm = FakeLlmClient::new(vec![scripts::extraction_response(&[
        ("Alice loves hiking in the mountains", "opinion"),
        ("Bob dislikes seafood entirely", "opinion"),
        ("Alice really loves hiking in the mountains", "opinion"),
    ])]);

    let request = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Alice told me twice, in different words, that she loves hiking; Bob mentioned he hates seafood".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };

    let outcome = retain(&bank.storage, &llm, &embedder, request).await.expect("retain");
    assert_eq!(outcome.memory_ids.len(), 2, "the third fact must be dropped as a duplicate of the first");
    assert_eq!(outcome.duplicates_filtered, 1);

    let texts: Vec<String> = outcome
        .memory_ids
        .iter()
        .map(|id| bank.storage.get_memory(id).unwrap().text)
        .collect();
    assert!(texts.contains(&"Alice loves hiking in the mountains".to_string()), "the earlier duplicate must survive");
    assert!(!texts.contains(&"Alice really loves hiking in the mountains".to_string()), "the later duplicate must be dropped");
    assert!(texts.contains(&"Bob dislikes seafood entirely".to_string()));
}

/// Retaining the same content a second time within the 24h dedup window
/// produces no new memory units at all -- the fact already exists
/// against the database, not just within the current batch.
#[tokio::test]
async fn retaining_identical_content_twice_is_idempotent() {
    let bank = TestBank::new_in_memory("dedup_against_db");
    let embedder = ScriptedEmbedder::new(4);
    let extraction = scripts::extraction_response(&[("Bob swims every morning", "experience")]);
    let llm = FakeLlmClient::new(vec![extraction.clone(), extraction]);

    let make_request = || RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Bob swims every morning".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };

    let first = retain(&bank.storage, &llm, &embedder, make_request()).await.expect("first retain");
    assert_eq!(first.memory_ids.len(), 1);

    let second = retain(&bank.storage, &llm, &embedder, make_request()).await.expect("second retain");
    assert!(second.memory_ids.is_empty(), "re-retaining identical content within the window must add nothing");
    assert_eq!(second.duplicates_filtered, 1);

    let all_units = bank.storage.units_by_exact_tag_set(bank.bank_id()).unwrap();
    let total: usize = all_units.values().map(|v| v.len()).sum();
    assert_eq!(total, 1, "only one memory unit must exist for the bank after both calls");
}

/// Dissimilar facts retained close together in time both survive --
/// dedup keys on similarity, not just the time window.
#[tokio::test]
async fn dissimilar_facts_in_the_same_window_both_survive() {
    let bank = TestBank::new_in_memory("dedup_dissimilar");
    let embedder = ScriptedEmbedder::new(4);
    embedder.set_override("Alice loves hiking", vec![1.0, 0.0, 0.0, 0.0]);
    embedder.set_override("Bob dislikes seafood", vec![0.0, 1.0, 0.0, 0.0]);

    let llm = FakeLlmClient::new(vec![
        scripts::extraction_response(&[("Alice loves hiking", "opinion")]),
        scripts::extraction_response(&[("Bob dislikes seafood", "opinion")]),
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

    let first = retain(&bank.storage, &llm, &embedder, make_request("Alice loves hiking")).await.expect("retain alice");
    let second = retain(&bank.storage, &llm, &embedder, make_request("Bob dislikes seafood")).await.expect("retain bob");

    assert_eq!(first.memory_ids.len(), 1);
    assert_eq!(second.memory_ids.len(), 1);
    assert_eq!(second.duplicates_filtered, 0);
}
