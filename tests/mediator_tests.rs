use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use swarmllm::client_wrapper::{
    CallParams, ChatMessage, ProviderClient, ProviderError, ProviderResponse, TokenUsage,
};
use swarmllm::config::SwarmConfig;
use swarmllm::covenant::{
    CallbackHandle, Constraints, Covenant, CovenantState, MediatorContext, QualityTier,
};
use swarmllm::event::{ClientCommand, ServerEvent, Subscription};
use swarmllm::host::SwarmHost;
use swarmllm::mediator::{self, MediatorError, MediatorSeed, OrchestratorSpawner};
use swarmllm::orchestrator::{spawn as spawn_orchestrator, OrchestratorHandle, OrchestratorSeed};
use swarmllm::registry::ModelRegistry;
use swarmllm::store::CovenantStore;

const SIMPLE_INTENT: &str = "What is 2+2?";
const COMPARE_INTENT: &str = "Explain the differences between SQL and NoSQL with examples.";

fn simple_constraints() -> Constraints {
    Constraints {
        max_cost_usd: 0.01,
        max_latency_ms: 5_000,
        required_quality: QualityTier::Fast,
        max_tokens: None,
    }
}

/// Role-aware mock shared by the end-to-end tests.  `evaluator_score` shapes
/// the quality gate outcome; `fail_primary_tier` simulates a degraded primary
/// provider so the router cascades to the edge tier.
struct MockClient {
    evaluator_score: &'static str,
    fail_primary_tier: bool,
}

impl MockClient {
    fn happy() -> Self {
        Self {
            evaluator_score: "SCORE: 0.9",
            fail_primary_tier: false,
        }
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        _params: &CallParams,
    ) -> Result<ProviderResponse, ProviderError> {
        if self.fail_primary_tier {
            let registry = ModelRegistry::builtin();
            if let Ok(descriptor) = registry.get(model_id) {
                if descriptor.tier == swarmllm::registry::ModelTier::Primary {
                    return Err(ProviderError::EmptyContent(model_id.to_string()));
                }
            }
        }

        let system = messages
            .first()
            .map(|m| m.content.to_string())
            .unwrap_or_default();

        let content = if system.contains("rainbow swarm") {
            ["RED", "ORANGE", "YELLOW", "GREEN", "BLUE", "INDIGO", "VIOLET"]
                .iter()
                .find(|color| system.contains(&format!("single word {}", color)))
                .map(|c| c.to_string())
                .unwrap_or_else(|| "GRAY".to_string())
        } else if system.contains("classifier of an agent swarm") {
            "domain: data systems".to_string()
        } else if system.contains("router of an agent swarm") {
            "1. one side\n2. other side".to_string()
        } else if system.contains("executor in an agent swarm") {
            "branch result".to_string()
        } else if system.contains("evaluator of an agent swarm") {
            format!("Reviewed.\n{}", self.evaluator_score)
        } else if system.contains("coordinator of an agent swarm") {
            "Final synthesized comparison.".to_string()
        } else {
            // Fast path assistant.
            "The answer is 4.".to_string()
        };

        Ok(ProviderResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 20,
            },
            latency_ms: 2,
            model_id_effective: model_id.to_string(),
        })
    }
}

fn host_with(client: MockClient, dir: &TempDir) -> SwarmHost {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = SwarmConfig::default();
    config.state_dir = dir.path().to_path_buf();
    SwarmHost::new(config, Arc::new(client))
}

/// Drain events until a terminal one arrives, returning everything seen.
async fn collect_until_terminal(sub: &Subscription) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), sub.recv())
            .await
            .expect("stream must reach a terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn covenant_states(events: &[ServerEvent]) -> Vec<CovenantState> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::CovenantUpdate { covenant } => Some(covenant.state),
            _ => None,
        })
        .collect()
}

// ── S1: fast path ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_simple_intent_resolves_on_the_fast_path() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;
    let sub = mediator.open_stream().await;

    let covenant = mediator
        .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
        .await
        .unwrap();

    assert_eq!(covenant.state, CovenantState::Completed);
    let results = covenant.results.expect("completed covenants carry results");
    assert!(results.content.contains('4'));
    assert_eq!(results.sub_agent_count, 0);
    assert!(results.quality >= 0.6);

    // No orchestrator actor was created for a simple covenant.
    assert_eq!(host.orchestrator_count().await, 0);

    let events = collect_until_terminal(&sub).await;
    assert_eq!(
        covenant_states(&events),
        vec![
            CovenantState::Draft,
            CovenantState::Active,
            CovenantState::Completed
        ]
    );
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_fast_path_appends_exactly_one_assistant_message() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;

    let covenant = mediator
        .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
        .await
        .unwrap();

    let store = CovenantStore::open(dir.path().join("mediator-user-1.db"))
        .await
        .unwrap();
    assert_eq!(store.assistant_message_count(&covenant.id).await.unwrap(), 1);
}

// ── S2: delegation through the generic swarm ─────────────────────────────────

#[tokio::test]
async fn test_moderate_intent_is_delegated_and_completes() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;
    let sub = mediator.open_stream().await;

    let covenant = mediator
        .submit_intent(COMPARE_INTENT, None)
        .await
        .unwrap();
    assert_eq!(covenant.state, CovenantState::Delegated);

    let events = collect_until_terminal(&sub).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, ServerEvent::DelegationStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(ServerEvent::Completed { .. })
    ));

    // Exactly one orchestrator actor was created.
    assert_eq!(host.orchestrator_count().await, 1);

    let status = mediator.status().await.unwrap();
    let head = status.covenant_head.unwrap();
    assert_eq!(head.state, CovenantState::Completed);
    let results = head.results.unwrap();
    assert!(results.quality >= 0.6);
    assert!(results.sub_agent_count > 0);
}

// ── S5: provider cascade ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_primary_outage_falls_back_to_the_edge_tier() {
    let dir = TempDir::new().unwrap();
    let host = host_with(
        MockClient {
            evaluator_score: "SCORE: 0.9",
            fail_primary_tier: true,
        },
        &dir,
    );
    let mediator = host.mediator("user-1").await;

    let covenant = mediator
        .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
        .await
        .unwrap();

    assert_eq!(covenant.state, CovenantState::Completed);
    let results = covenant.results.unwrap();
    assert!(results.used_fallback);

    let store = CovenantStore::open(dir.path().join("mediator-user-1.db"))
        .await
        .unwrap();
    assert_eq!(store.assistant_message_count(&covenant.id).await.unwrap(), 1);
}

// ── S6: quality gate ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_low_quality_results_are_rejected_without_reaching_the_log() {
    let dir = TempDir::new().unwrap();
    let host = host_with(
        MockClient {
            evaluator_score: "SCORE: 0.45",
            fail_primary_tier: false,
        },
        &dir,
    );
    let mediator = host.mediator("user-1").await;
    let sub = mediator.open_stream().await;

    let covenant = mediator.submit_intent(COMPARE_INTENT, None).await.unwrap();
    assert_eq!(covenant.state, CovenantState::Delegated);

    let events = collect_until_terminal(&sub).await;
    match events.last() {
        Some(ServerEvent::Rejected {
            reason, quality, ..
        }) => {
            assert_eq!(reason, "quality_below_threshold");
            assert!((quality - 0.45).abs() < 1e-9);
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    let status = mediator.status().await.unwrap();
    let head = status.covenant_head.unwrap();
    assert_eq!(head.state, CovenantState::Rejected);
    assert_eq!(head.reason.as_deref(), Some("quality_below_threshold"));

    // No assistant message was appended for the rejected covenant.
    let store = CovenantStore::open(dir.path().join("mediator-user-1.db"))
        .await
        .unwrap();
    assert_eq!(store.assistant_message_count(&covenant.id).await.unwrap(), 0);
}

// ── Validation boundaries ────────────────────────────────────────────────────

#[tokio::test]
async fn test_boundary_constraints_are_rejected_as_validation() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;

    let zero_cost = Constraints {
        max_cost_usd: 0.0,
        ..Constraints::default()
    };
    assert!(matches!(
        mediator.submit_intent("hello", Some(zero_cost)).await,
        Err(MediatorError::Validation(_))
    ));

    let below_floor = Constraints {
        max_latency_ms: 2_999,
        ..Constraints::default()
    };
    assert!(matches!(
        mediator.submit_intent("hello", Some(below_floor)).await,
        Err(MediatorError::Validation(_))
    ));

    assert!(matches!(
        mediator.submit_intent("   ", None).await,
        Err(MediatorError::Validation(_))
    ));
}

#[tokio::test]
async fn test_identical_submissions_create_distinct_covenants() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;

    let first = mediator
        .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
        .await
        .unwrap();
    let second = mediator
        .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.state, CovenantState::Completed);
    assert_eq!(second.state, CovenantState::Completed);
}

// ── Restart and reconnect ────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_after_restart_replays_the_persisted_head() {
    let dir = TempDir::new().unwrap();

    let covenant_id = {
        let host = host_with(MockClient::happy(), &dir);
        let mediator = host.mediator("user-1").await;
        let covenant = mediator
            .submit_intent(SIMPLE_INTENT, Some(simple_constraints()))
            .await
            .unwrap();
        covenant.id
    };

    // The old host (and its actors) are gone; a fresh host wakes the actor
    // from its durable store.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;
    let sub = mediator.open_stream().await;

    let first = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("snapshot must be replayed on reconnect");
    match first {
        ServerEvent::CovenantUpdate { covenant } => {
            assert_eq!(covenant.id, covenant_id);
            assert_eq!(covenant.state, CovenantState::Completed);
        }
        other => panic!("expected the head snapshot, got {:?}", other),
    }
}

// ── Cancellation over the command channel ────────────────────────────────────

#[tokio::test]
async fn test_client_cancel_fails_the_covenant() {
    let dir = TempDir::new().unwrap();
    let host = host_with(MockClient::happy(), &dir);
    let mediator = host.mediator("user-1").await;
    let sub = mediator.open_stream().await;

    // The rainbow plan paces itself, leaving time to cancel mid-flight.
    let covenant = mediator
        .submit_intent(
            "Delegate a covenant that spawns sub-agents returning colors of the rainbow in gradient order starting with red.",
            None,
        )
        .await
        .unwrap();
    assert_eq!(covenant.state, CovenantState::Delegated);

    mediator
        .command(ClientCommand::Cancel {
            covenant_id: covenant.id.clone(),
        })
        .await
        .unwrap();

    let events = collect_until_terminal(&sub).await;
    match events.last() {
        Some(ServerEvent::Error { reason, .. }) => assert_eq!(reason, "cancelled"),
        other => panic!("expected a cancellation error event, got {:?}", other),
    }

    let head = mediator.status().await.unwrap().covenant_head.unwrap();
    assert_eq!(head.state, CovenantState::Failed);
    assert_eq!(head.reason.as_deref(), Some("cancelled"));
}

// ── Orchestrator silence is converted into a timeout ─────────────────────────

/// Spawner whose orchestrators never reach the mediator: the callback handle
/// is swapped for a swallowed channel, simulating a crashed peer.
struct SilentSpawner {
    registry: Arc<ModelRegistry>,
    client: Arc<dyn ProviderClient>,
    config: SwarmConfig,
    dir: std::path::PathBuf,
}

#[async_trait]
impl OrchestratorSpawner for SilentSpawner {
    async fn spawn_orchestrator(
        &self,
        covenant: Covenant,
        context: MediatorContext,
        _callback: CallbackHandle,
    ) -> OrchestratorHandle {
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        spawn_orchestrator(OrchestratorSeed {
            covenant,
            context,
            callback: CallbackHandle::new(tx),
            registry: Arc::clone(&self.registry),
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            store_path: self.dir.join("silent-orchestrator.db"),
        })
    }
}

#[tokio::test]
async fn test_missing_callback_times_the_covenant_out() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ModelRegistry::builtin());
    let client: Arc<dyn ProviderClient> = Arc::new(MockClient::happy());
    let config = SwarmConfig::default();

    let mediator = mediator::spawn(MediatorSeed {
        user_id: "user-1".into(),
        config: config.clone(),
        registry: Arc::clone(&registry),
        client: Arc::clone(&client),
        spawner: Arc::new(SilentSpawner {
            registry,
            client,
            config,
            dir: dir.path().to_path_buf(),
        }),
        store_path: dir.path().join("mediator.db"),
    });
    let sub = mediator.open_stream().await;

    let constraints = Constraints {
        max_cost_usd: 0.10,
        max_latency_ms: 3_000,
        required_quality: QualityTier::Balanced,
        max_tokens: None,
    };
    let covenant = mediator
        .submit_intent(COMPARE_INTENT, Some(constraints))
        .await
        .unwrap();
    assert_eq!(covenant.state, CovenantState::Delegated);

    let events = collect_until_terminal(&sub).await;
    match events.last() {
        Some(ServerEvent::Error { reason, .. }) => assert_eq!(reason, "orchestrator_timeout"),
        other => panic!("expected an orchestrator timeout, got {:?}", other),
    }

    let head = mediator.status().await.unwrap().covenant_head.unwrap();
    assert_eq!(head.state, CovenantState::Failed);
    assert_eq!(head.reason.as_deref(), Some("orchestrator_timeout"));
}
