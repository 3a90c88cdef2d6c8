//! End-to-end temporal scenarios from SPEC_FULL.md §8: the
//! `mentioned_at`-over-`occurred_start` priority rule, and the fact
//! that `occurred_start`/`occurred_end` alone still outrank a bare
//! extracted `event_date`.

use chrono::Utc;
use hindsight_engine::{retain, FakeLlmClient, RetainRequest, TagSet};
use hindsight_e2e_tests::harness::db_manager::TestBank;
use hindsight_e2e_tests::mocks::fixtures::{scripts, ScriptedEmbedder};

/// Scenario 3 (§8): a fact is retained with an explicit `mentioned_at`
/// of 2025-01-15, but the extractor resolves `occurred_start` to a
/// much later date (2025-06-20). Querying the temporal candidate pool
/// with a reference instant equal to `mentioned_at` must rank this
/// memory first -- which only holds if the stored best-date used
/// `mentioned_at`, not `occurred_start`.
#[tokio::test]
async fn mentioned_at_outranks_extracted_occurred_start() {
    let bank = TestBank::new_in_memory("temporal_priority");
    let embedder = ScriptedEmbedder::new(4);
    let llm = FakeLlmClient::new(vec![
        scripts::extraction_response_with_dates(
            "Professor rating is 5 stars",
            "world",
            None,
            Some("2025-06-20T00:00:00Z"),
            None,
        ),
        // A second, unrelated fact whose only date is `event_date`
        // (today, via the call's anchor) -- it should rank well behind
        // the first fact once we query with a reference instant of
        // 2025-01-15, since its best-date falls back to "now".
        scripts::extraction_response(&[("Unrelated fact with no dates", "world")]),
    ]);

    let mentioned_at = "2025-01-15T00:00:00Z".parse().unwrap();
    let rated = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Professor rating is 5 stars".to_string(),
        event_date: Utc::now(),
        mentioned_at: Some(mentioned_at),
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    let rated_outcome = retain(&bank.storage, &llm, &embedder, rated).await.expect("retain rated fact");
    assert_eq!(rated_outcome.memory_ids.len(), 1);
    let rated_id = rated_outcome.memory_ids[0].clone();

    let stored = bank.storage.get_memory(&rated_id).unwrap();
    assert_eq!(stored.mentioned_at, Some(mentioned_at));
    assert_eq!(stored.occurred_start, Some("2025-06-20T00:00:00Z".parse().unwrap()));
    assert_eq!(stored.best_date(), mentioned_at, "best_date must prefer mentioned_at over occurred_start");

    let unrelated = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Unrelated fact with no dates".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    retain(&bank.storage, &llm, &embedder, unrelated).await.expect("retain unrelated fact");

    let ranked = bank.storage.candidates_by_temporal(bank.bank_id(), mentioned_at, 10).unwrap();
    assert_eq!(ranked[0].0, rated_id, "the mentioned_at=2025-01-15 fact must rank closest to a 2025-01-15 reference");
    assert!(ranked[0].1 > ranked[1].1);
}

/// `occurred_start`/`occurred_end` alone (no `mentioned_at`) still beat
/// a fact with only an `event_date`, per the priority chain's second
/// and third links.
#[tokio::test]
async fn occurred_window_outranks_bare_event_date() {
    let bank = TestBank::new_in_memory("temporal_occurred_window");
    let embedder = ScriptedEmbedder::new(4);
    let reference = "2025-06-15T00:00:00Z".parse().unwrap();

    let llm = FakeLlmClient::new(vec![scripts::extraction_response_with_dates(
        "The conference ran over the weekend",
        "experience",
        None,
        Some("2025-06-14T00:00:00Z"),
        Some("2025-06-16T00:00:00Z"),
    )]);
    let windowed = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "The conference ran over the weekend".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    let windowed_outcome = retain(&bank.storage, &llm, &embedder, windowed).await.expect("retain windowed fact");
    let windowed_id = windowed_outcome.memory_ids[0].clone();

    let stored = bank.storage.get_memory(&windowed_id).unwrap();
    assert_eq!(stored.best_date(), "2025-06-15T00:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap(), "midpoint of the occurred window");

    let far_llm = FakeLlmClient::new(vec![scripts::extraction_response_with_dates(
        "Some other thing happened ages ago",
        "world",
        Some("2020-01-01T00:00:00Z"),
        None,
        None,
    )]);
    let far = RetainRequest {
        bank_id: bank.bank_id().to_string(),
        content: "Some other thing happened ages ago".to_string(),
        event_date: Utc::now(),
        mentioned_at: None,
        tags: TagSet::default(),
        document_title: None,
        similarity_threshold: hindsight_engine::DEFAULT_SIMILARITY_THRESHOLD,
    };
    retain(&bank.storage, &far_llm, &embedder, far).await.expect("retain far fact");

    let ranked = bank.storage.candidates_by_temporal(bank.bank_id(), reference, 10).unwrap();
    assert_eq!(ranked[0].0, windowed_id);
}
