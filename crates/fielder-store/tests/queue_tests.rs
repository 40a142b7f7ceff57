//! Integration tests for the SQLite queue: claims, releases, transitions

use fielder_domain::{
    Block, BlockId, BlockStore, CredentialStore, ExtractionSchema, ModelConfig, OverlayStatus,
    PromptConfig, ReleaseScope, RunId, RunStatus, RunStore, StoreError, WorkQueue, WorkerId,
};
use fielder_store::SqliteQueue;
use serde_json::json;

fn seeded_store(run: &str, block_count: usize) -> SqliteQueue {
    let store = SqliteQueue::in_memory().unwrap();
    let run_id = RunId::new(run);
    store.insert_run(&run_id, "owner-1", None, None).unwrap();
    let blocks: Vec<Block> = (0..block_count)
        .map(|i| Block::new(format!("b{:02}", i), "NarrativeText", format!("content {}", i)))
        .collect();
    store.enqueue_blocks(&run_id, &blocks).unwrap();
    store
}

#[tokio::test]
async fn test_claim_respects_batch_size_and_order() {
    let store = seeded_store("run-1", 5);
    let run_id = RunId::new("run-1");
    let worker = WorkerId::new("worker-a");

    let claimed = store.claim(&run_id, 3, &worker).await.unwrap();
    assert_eq!(
        claimed,
        vec![BlockId::new("b00"), BlockId::new("b01"), BlockId::new("b02")]
    );

    let overlay = store.overlay(&run_id, &BlockId::new("b00")).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Claimed);
    assert_eq!(overlay.claimed_by.as_deref(), Some("worker-a"));
    assert!(overlay.claimed_at.is_some());
}

#[tokio::test]
async fn test_claims_are_exclusive_between_workers() {
    let store = seeded_store("run-1", 4);
    let run_id = RunId::new("run-1");

    let first = store
        .claim(&run_id, 10, &WorkerId::new("worker-a"))
        .await
        .unwrap();
    let second = store
        .claim(&run_id, 10, &WorkerId::new("worker-b"))
        .await
        .unwrap();

    assert_eq!(first.len(), 4);
    assert!(second.is_empty(), "no block may be claimed twice");
}

#[tokio::test]
async fn test_claim_skips_terminal_overlays() {
    let store = seeded_store("run-1", 3);
    let run_id = RunId::new("run-1");
    store
        .fail_terminal(&run_id, &BlockId::new("b00"), "broken")
        .await
        .unwrap();

    let claimed = store
        .claim(&run_id, 10, &WorkerId::new("worker-a"))
        .await
        .unwrap();
    assert_eq!(claimed, vec![BlockId::new("b01"), BlockId::new("b02")]);
}

#[tokio::test]
async fn test_release_owned_scope() {
    let store = seeded_store("run-1", 2);
    let run_id = RunId::new("run-1");
    let worker = WorkerId::new("worker-a");
    let claimed = store.claim(&run_id, 2, &worker).await.unwrap();

    let resolved = store
        .release(
            &run_id,
            ReleaseScope::OwnedBy(worker.clone()),
            &claimed,
            OverlayStatus::Pending,
            None,
        )
        .await
        .unwrap();

    assert_eq!(resolved.len(), 2);
    let overlay = store.overlay(&run_id, &BlockId::new("b00")).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Pending);
    assert!(overlay.claimed_by.is_none());
    assert!(overlay.claimed_at.is_none());
}

#[tokio::test]
async fn test_release_owned_scope_misses_drifted_claims() {
    let store = seeded_store("run-1", 2);
    let run_id = RunId::new("run-1");
    let worker_a = WorkerId::new("worker-a");
    let claimed = store.claim(&run_id, 2, &worker_a).await.unwrap();

    // Simulate ownership drift: another worker ends up holding the claims.
    store
        .release(
            &run_id,
            ReleaseScope::OwnedBy(worker_a.clone()),
            &claimed,
            OverlayStatus::Pending,
            None,
        )
        .await
        .unwrap();
    let drifted = store
        .claim(&run_id, 2, &WorkerId::new("worker-b"))
        .await
        .unwrap();
    assert_eq!(drifted.len(), 2);

    // Phase 1 scoped to worker-a resolves nothing...
    let resolved = store
        .release(
            &run_id,
            ReleaseScope::OwnedBy(worker_a),
            &claimed,
            OverlayStatus::Pending,
            None,
        )
        .await
        .unwrap();
    assert!(resolved.is_empty());

    // ...while the drift fallback resolves everything still in flight.
    let resolved = store
        .release(
            &run_id,
            ReleaseScope::AnyClaimant,
            &claimed,
            OverlayStatus::Pending,
            None,
        )
        .await
        .unwrap();
    assert_eq!(resolved.len(), 2);
}

#[tokio::test]
async fn test_release_ignores_terminal_overlays_in_any_claimant_scope() {
    let store = seeded_store("run-1", 2);
    let run_id = RunId::new("run-1");
    store
        .mark_done(&run_id, &BlockId::new("b00"), json!({"title": "t"}))
        .await
        .unwrap();

    let resolved = store
        .release(
            &run_id,
            ReleaseScope::AnyClaimant,
            &[BlockId::new("b00"), BlockId::new("b01")],
            OverlayStatus::Pending,
            None,
        )
        .await
        .unwrap();

    // The done overlay must not be dragged back to pending.
    assert_eq!(resolved, vec![BlockId::new("b01")]);
    let overlay = store.overlay(&run_id, &BlockId::new("b00")).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Done);
}

#[tokio::test]
async fn test_release_records_error_when_given() {
    let store = seeded_store("run-1", 1);
    let run_id = RunId::new("run-1");
    let worker = WorkerId::new("worker-a");
    let claimed = store.claim(&run_id, 1, &worker).await.unwrap();

    store
        .release(
            &run_id,
            ReleaseScope::OwnedBy(worker),
            &claimed,
            OverlayStatus::Pending,
            Some("run lookup failed"),
        )
        .await
        .unwrap();

    let overlay = store.overlay(&run_id, &BlockId::new("b00")).unwrap();
    assert_eq!(overlay.last_error.as_deref(), Some("run lookup failed"));
}

#[tokio::test]
async fn test_mark_done_attaches_fields_and_clears_error() {
    let store = seeded_store("run-1", 1);
    let run_id = RunId::new("run-1");
    let block_id = BlockId::new("b00");
    store
        .mark_attempt(&run_id, &block_id, 1, OverlayStatus::Pending, "transient")
        .await
        .unwrap();
    store
        .mark_done(&run_id, &block_id, json!({"amount": 42}))
        .await
        .unwrap();

    let overlay = store.overlay(&run_id, &block_id).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Done);
    assert_eq!(overlay.fields, Some(json!({"amount": 42})));
    assert!(overlay.last_error.is_none());
    // Attempt history survives success
    assert_eq!(overlay.attempt_count, 1);
}

#[tokio::test]
async fn test_mark_attempt_transitions() {
    let store = seeded_store("run-1", 1);
    let run_id = RunId::new("run-1");
    let block_id = BlockId::new("b00");

    store
        .mark_attempt(&run_id, &block_id, 1, OverlayStatus::Pending, "try again")
        .await
        .unwrap();
    let overlay = store.overlay(&run_id, &block_id).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Pending);
    assert_eq!(overlay.attempt_count, 1);
    assert_eq!(overlay.last_error.as_deref(), Some("try again"));

    store
        .mark_attempt(&run_id, &block_id, 3, OverlayStatus::Failed, "gave up")
        .await
        .unwrap();
    let overlay = store.overlay(&run_id, &block_id).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Failed);
    assert_eq!(overlay.attempt_count, 3);
}

#[tokio::test]
async fn test_fail_terminal_preserves_attempt_count() {
    let store = seeded_store("run-1", 1);
    let run_id = RunId::new("run-1");
    let block_id = BlockId::new("b00");
    store
        .mark_attempt(&run_id, &block_id, 2, OverlayStatus::Pending, "transient")
        .await
        .unwrap();

    store
        .fail_terminal(&run_id, &block_id, "block content missing")
        .await
        .unwrap();

    let overlay = store.overlay(&run_id, &block_id).unwrap();
    assert_eq!(overlay.status, OverlayStatus::Failed);
    assert_eq!(overlay.attempt_count, 2);
    assert_eq!(overlay.last_error.as_deref(), Some("block content missing"));
}

#[tokio::test]
async fn test_status_counts() {
    let store = seeded_store("run-1", 5);
    let run_id = RunId::new("run-1");
    store
        .claim(&run_id, 1, &WorkerId::new("worker-a"))
        .await
        .unwrap();
    store
        .mark_done(&run_id, &BlockId::new("b01"), json!({}))
        .await
        .unwrap();
    store
        .fail_terminal(&run_id, &BlockId::new("b02"), "bad")
        .await
        .unwrap();

    let counts = store.status_counts(&run_id).await.unwrap();
    assert_eq!(counts.claimed, 1);
    assert_eq!(counts.done, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.remaining(), 3);
}

#[tokio::test]
async fn test_block_store_returns_found_subset() {
    let store = seeded_store("run-1", 2);

    let blocks = store
        .blocks(&[
            BlockId::new("b00"),
            BlockId::new("b01"),
            BlockId::new("missing"),
        ])
        .await
        .unwrap();

    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[&BlockId::new("b00")].content, "content 0");
    assert!(!blocks.contains_key(&BlockId::new("missing")));
}

#[tokio::test]
async fn test_run_store_roundtrip() {
    let store = SqliteQueue::in_memory().unwrap();
    let run_id = RunId::new("run-1");
    let schema = ExtractionSchema {
        properties: json!({"title": {"type": "string"}}),
        prompt: PromptConfig::default(),
    };
    let model = ModelConfig {
        model: Some("claude-haiku-4-5".to_string()),
    };
    store
        .insert_run(&run_id, "owner-1", Some(&schema), Some(&model))
        .unwrap();

    let run = store.run(&run_id).await.unwrap();
    assert_eq!(run.owner_id, "owner-1");
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.schema.as_ref().unwrap().properties, schema.properties);
    assert_eq!(run.resolved_model(None), "claude-haiku-4-5");

    store.update_counts(&run_id, 7, 2).await.unwrap();
    store.finalize(&run_id, RunStatus::Complete, 1_700_000_000).await.unwrap();

    let run = store.run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    let (done, failed, ended_at) = store.run_rollup(&run_id).unwrap();
    assert_eq!((done, failed), (7, 2));
    assert_eq!(ended_at, Some(1_700_000_000));
}

#[tokio::test]
async fn test_missing_run_is_not_found() {
    let store = SqliteQueue::in_memory().unwrap();
    let result = store.run(&RunId::new("ghost")).await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_credential_lifecycle() {
    let store = SqliteQueue::in_memory().unwrap();
    store
        .insert_credential("owner-1", "anthropic", "sk-live", true)
        .unwrap();

    let credential = store.resolve("owner-1", "anthropic").await.unwrap().unwrap();
    assert_eq!(credential.secret, "sk-live");
    assert!(credential.owner_scoped);

    store.mark_valid("owner-1", "anthropic").await.unwrap();
    assert_eq!(store.credential_state("owner-1", "anthropic").unwrap(), (true, false));

    store.invalidate("owner-1", "anthropic").await.unwrap();
    assert!(store.resolve("owner-1", "anthropic").await.unwrap().is_none());
    assert_eq!(store.credential_state("owner-1", "anthropic").unwrap(), (true, true));
}

#[tokio::test]
async fn test_resolve_unknown_owner_is_none() {
    let store = SqliteQueue::in_memory().unwrap();
    assert!(store.resolve("ghost", "anthropic").await.unwrap().is_none());
}

#[tokio::test]
async fn test_on_disk_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fielder.db");
    let run_id = RunId::new("run-1");

    {
        let store = SqliteQueue::new(&path).unwrap();
        store.insert_run(&run_id, "owner-1", None, None).unwrap();
        store
            .enqueue_blocks(&run_id, &[Block::new("b00", "Title", "Hello")])
            .unwrap();
    }

    let store = SqliteQueue::new(&path).unwrap();
    let claimed = store
        .claim(&run_id, 10, &WorkerId::new("worker-a"))
        .await
        .unwrap();
    assert_eq!(claimed, vec![BlockId::new("b00")]);
}
