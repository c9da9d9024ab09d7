use tempfile::TempDir;

use swarmllm::client_wrapper::Role;
use swarmllm::covenant::{Constraints, Covenant, CovenantResults, CovenantState, StoredMessage};
use swarmllm::store::CovenantStore;

async fn fresh_store(dir: &TempDir) -> CovenantStore {
    CovenantStore::open(dir.path().join("actor.db")).await.unwrap()
}

#[tokio::test]
async fn test_schema_creation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("actor.db");
    let _first = CovenantStore::open(&path).await.unwrap();
    // A second wake over the same file must not fail or wipe anything.
    let second = CovenantStore::open(&path).await.unwrap();
    assert!(second.get_head::<Covenant>().await.unwrap().is_none());
}

#[tokio::test]
async fn test_head_round_trips_through_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("actor.db");

    let mut covenant = Covenant::new("user-1", "hello world", Constraints::default());
    covenant.advance(CovenantState::Active).unwrap();

    {
        let store = CovenantStore::open(&path).await.unwrap();
        store.put_head(&covenant).await.unwrap();
    }

    // Reopen as a restarted actor host would.
    let store = CovenantStore::open(&path).await.unwrap();
    let reloaded: Covenant = store.get_head().await.unwrap().expect("head survives restart");
    assert_eq!(reloaded.id, covenant.id);
    assert_eq!(reloaded.state, CovenantState::Active);
    assert_eq!(reloaded.intent, "hello world");
}

#[tokio::test]
async fn test_head_overwrites_in_place() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    let mut covenant = Covenant::new("user-1", "first", Constraints::default());
    store.put_head(&covenant).await.unwrap();
    covenant.advance(CovenantState::Active).unwrap();
    store.put_head(&covenant).await.unwrap();

    let reloaded: Covenant = store.get_head().await.unwrap().unwrap();
    assert_eq!(reloaded.state, CovenantState::Active);
}

#[tokio::test]
async fn test_covenant_rows_upsert() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    let mut covenant = Covenant::new("user-1", "do something", Constraints::default());
    store.upsert_covenant(&covenant).await.unwrap();
    assert_eq!(
        store.covenant_state(&covenant.id).await.unwrap().as_deref(),
        Some("draft")
    );

    covenant.advance(CovenantState::Active).unwrap();
    covenant.results = Some(CovenantResults {
        content: "done".into(),
        quality: 0.9,
        cost_usd: 0.001,
        latency_ms: 40,
        sub_agent_count: 0,
        used_fallback: false,
        error: None,
    });
    covenant.advance(CovenantState::Completed).unwrap();
    store.upsert_covenant(&covenant).await.unwrap();

    assert_eq!(
        store.covenant_state(&covenant.id).await.unwrap().as_deref(),
        Some("completed")
    );
}

#[tokio::test]
async fn test_recent_messages_returns_the_tail_oldest_first() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    for i in 0..8i64 {
        let mut msg = StoredMessage::new(None, Role::User, format!("turn {}", i));
        // Stamp strictly increasing timestamps so ordering is deterministic.
        msg.ts = msg.ts + chrono::Duration::milliseconds(i);
        store.append_message(&msg).await.unwrap();
    }

    let tail = store.recent_messages(5).await.unwrap();
    assert_eq!(tail.len(), 5);
    assert_eq!(tail[0].content, "turn 3");
    assert_eq!(tail[4].content, "turn 7");
}

#[tokio::test]
async fn test_assistant_message_count_scopes_by_covenant() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    store
        .append_message(&StoredMessage::new(Some("c1".into()), Role::User, "q"))
        .await
        .unwrap();
    store
        .append_message(&StoredMessage::new(Some("c1".into()), Role::Assistant, "a"))
        .await
        .unwrap();
    store
        .append_message(&StoredMessage::new(Some("c2".into()), Role::Assistant, "b"))
        .await
        .unwrap();

    assert_eq!(store.assistant_message_count("c1").await.unwrap(), 1);
    assert_eq!(store.assistant_message_count("c2").await.unwrap(), 1);
    assert_eq!(store.assistant_message_count("c3").await.unwrap(), 0);
}

#[tokio::test]
async fn test_performance_counters_aggregate_metrics() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;

    let mut completed = Covenant::new("u", "simple question", Constraints::default());
    completed.advance(CovenantState::Active).unwrap();
    completed.advance(CovenantState::Completed).unwrap();
    store.upsert_covenant(&completed).await.unwrap();

    let mut delegated = Covenant::new("u", "hard question", Constraints::default());
    delegated.orchestration_plan = Some("swarm delegation".into());
    delegated.advance(CovenantState::Active).unwrap();
    delegated.advance(CovenantState::Delegated).unwrap();
    delegated.advance(CovenantState::Rejected).unwrap();
    store.upsert_covenant(&delegated).await.unwrap();

    store.record_metric(Some(&completed.id), 100, 0.002, true).await.unwrap();
    store.record_metric(Some(&delegated.id), 300, 0.010, false).await.unwrap();

    let perf = store.performance().await.unwrap();
    assert_eq!(perf.total_covenants, 2);
    assert_eq!(perf.delegated_count, 1);
    assert_eq!(perf.completed_count, 1);
    assert_eq!(perf.rejected_count, 1);
    assert!((perf.avg_latency_ms - 200.0).abs() < 1e-9);
    assert!((perf.total_cost_usd - 0.012).abs() < 1e-9);
}

#[tokio::test]
async fn test_evaluation_rows_persist() {
    let dir = TempDir::new().unwrap();
    let store = fresh_store(&dir).await;
    store
        .record_evaluation("c1", "callback_error", "mediator unreachable")
        .await
        .unwrap();
    // The row is post-mortem data; reaching this point means the write landed
    // before the acknowledgement, which is the contract under test.
}
