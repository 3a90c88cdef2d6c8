//! End-to-end backup/restore scenario: exporting a bank and importing
//! it into a fresh storage instance reproduces the exact memory set --
//! IDs, embeddings, tags, and timestamps all byte-equal once the
//! export round-trips through JSON, the serialization backup/migration
//! tooling would actually use on disk.

use chrono::Utc;
use hindsight_engine::{retain, run_consolidation, FakeLlmClient, RetainRequest, Storage, TagSet};
use hindsight_e2e_tests::harness::db_manager::TestBank;
use hindsight_e2e_tests::mocks::fixtures::{scripts, ScriptedEmbedder};

#[tokio::test]
async fn export_then_import_reproduces_the_bank_exactly() {
    let bank = TestBank::new_in_memory("backup_source");
    let embedder = ScriptedEmbedder::new(4);

    let llm = FakeLlmClient::new(vec![
        scripts::extraction_response(&[("Alice loves hiking", "opinion")]),
        scripts::extraction_response(&[("Alice hikes every weekend", "experience")]),
    ]);
    let m1 = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Alice loves hiking".to_string(),
        event_date: Utc::now(),
        mentioned_at: Some("2025-02-01T00:00:00Z".parse().unwrap()),
        tags: TagSet::new(["alice".to_string()]),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    let m1_outcome = retain(&bank.storage, &llm, &embedder, m1).await.expect("retain m1");
    let m2 = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Alice hikes every weekend".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::new(["alice".to_string()]),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    let m2_outcome = retain(&bank.storage, &llm, &embedder, m2).await.expect("retain m2");

    let consolidation_llm = FakeLlmClient::new(vec![
        scripts::consolidation_response(vec![scripts::create_action(
            &[m1_outcome.memory_ids[0].clone(), m2_outcome.memory_ids[0].clone()],
            "Alice is an avid hiker",
        )]),
        scripts::mental_model_summary("Alice hikes regularly"),
    ]);
    run_consolidation(&bank.storage, &consolidation_llm, &embedder, bank.bank_id(), "op-backup", 2).await.expect("consolidate");

    let export = bank.storage.export_bank(bank.bank_id()).expect("export bank");

    // Round-trip through JSON, the actual on-disk backup format, rather
    // than reusing the in-memory `BankExport` value directly -- this is
    // the step that would catch a field silently dropped by serde.
    let serialized = serde_json::to_string(&export).expect("serialize export");
    let reloaded: hindsight_engine::BankExport = serde_json::from_str(&serialized).expect("deserialize export");

    let fresh_storage = Storage::open_in_memory("backup_target").expect("open target storage");
    fresh_storage.import_bank(&reloaded).expect("import bank");

    let restored_bank = hindsight_engine::get_bank(&fresh_storage, bank.bank_id()).expect("restored bank");
    assert_eq!(restored_bank.id, bank.bank.id);
    assert_eq!(restored_bank.name, bank.bank.name);
    assert_eq!(restored_bank.embedding_dim, bank.bank.embedding_dim);
    assert_eq!(restored_bank.created_at, bank.bank.created_at);

    for memory_id in [&m1_outcome.memory_ids[0], &m2_outcome.memory_ids[0]] {
        let before = bank.storage.get_memory(memory_id).expect("source memory");
        let after = fresh_storage.get_memory(memory_id).expect("restored memory");
        assert_eq!(before.id, after.id);
        assert_eq!(before.text, after.text);
        assert_eq!(before.embedding, after.embedding);
        assert_eq!(before.tags, after.tags);
        assert_eq!(before.event_date, after.event_date);
        assert_eq!(before.occurred_start, after.occurred_start);
        assert_eq!(before.mentioned_at, after.mentioned_at);
        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.consolidated_at, after.consolidated_at);
        assert_eq!(before.source_memory_ids, after.source_memory_ids);
    }

    let source_observations = bank.storage.observations_by_exact_tag_set(bank.bank_id()).unwrap();
    let target_observations = fresh_storage.observations_by_exact_tag_set(bank.bank_id()).unwrap();
    let alice_key = TagSet::new(["alice".to_string()]).canonical_key();
    let source_obs = &source_observations.get(&alice_key).expect("source observation")[0];
    let target_obs = &target_observations.get(&alice_key).expect("target observation")[0];
    assert_eq!(source_obs.id, target_obs.id);
    assert_eq!(source_obs.text, target_obs.text);
    assert_eq!(source_obs.proof_count, target_obs.proof_count);
    assert_eq!(source_obs.history.len(), target_obs.history.len());
}
