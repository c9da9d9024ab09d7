use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use swarmllm::client_wrapper::{
    CallParams, ChatMessage, ProviderClient, ProviderError, ProviderResponse, TokenUsage,
};
use swarmllm::covenant::{Constraints, QualityTier};
use swarmllm::registry::{ModelRegistry, ModelTier};
use swarmllm::router::{classify, execute, fingerprint, plan, Complexity, RouterError};

/// Provider client whose behaviour is scripted per model id.
struct ScriptedClient {
    script: Vec<(String, Result<String, ProviderError>)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(script: Vec<(&str, Result<&str, ProviderError>)>) -> Self {
        Self {
            script: script
                .into_iter()
                .map(|(m, r)| (m.to_string(), r.map(|s| s.to_string())))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn call(
        &self,
        model_id: &str,
        _messages: &[ChatMessage],
        _params: &CallParams,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().unwrap().push(model_id.to_string());
        for (scripted_model, outcome) in &self.script {
            if scripted_model == model_id {
                return match outcome {
                    Ok(content) => Ok(ProviderResponse {
                        content: content.clone(),
                        usage: TokenUsage {
                            prompt_tokens: 10,
                            completion_tokens: 5,
                        },
                        latency_ms: 3,
                        model_id_effective: model_id.to_string(),
                    }),
                    Err(e) => Err(e.clone()),
                };
            }
        }
        Err(ProviderError::UnsupportedModel(model_id.to_string()))
    }
}

fn constraints(quality: QualityTier) -> Constraints {
    Constraints {
        max_cost_usd: 0.50,
        max_latency_ms: 15_000,
        required_quality: quality,
        max_tokens: None,
    }
}

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn test_classify_is_a_pure_function() {
    let prompt = "Analyze in detail the trade-offs of cloud vs on-prem for enterprise workloads with recommendations.";
    let a = classify(prompt);
    let b = classify(prompt);
    assert_eq!(a.complexity, b.complexity);
    assert_eq!(a.score, b.score);
    assert_eq!(a.factors, b.factors);
}

#[test]
fn test_simple_prompt_scores_low() {
    let c = classify("What is 2+2?");
    assert_eq!(c.complexity, Complexity::Simple);
    assert!(c.score <= 0.3);
}

#[test]
fn test_moderate_prompt_scores_at_the_delegation_edge() {
    let c = classify("Explain the differences between SQL and NoSQL with examples.");
    assert_eq!(c.complexity, Complexity::Moderate);
    assert!(c.score > 0.3 && c.score <= 0.6);
}

#[test]
fn test_complex_prompt_scores_high() {
    let c = classify(
        "Analyze in detail the trade-offs of cloud vs on-prem for enterprise workloads with recommendations.",
    );
    assert_eq!(c.complexity, Complexity::Complex);
    assert!(c.score > 0.7);
    assert!(c.factors.iter().any(|f| f.starts_with("task_cue")));
}

#[test]
fn test_long_prompts_pick_up_the_word_count_factor() {
    let long = "please summarize this text ".repeat(15);
    let c = classify(&long);
    assert!(c.factors.iter().any(|f| f.starts_with("word_count")));
}

#[test]
fn test_score_is_clamped_to_one() {
    let c = classify(
        "Analyze and compare in detail why and how these trade-offs matter, and then design a \
         comprehensive plan with recommendations: 1. research the market and then 2. evaluate \
         options and then 3. investigate vendors across many many more dimensions than before.",
    );
    assert!(c.score <= 1.0);
    assert_eq!(c.complexity, Complexity::Complex);
}

#[test]
fn test_fingerprint_is_stable_under_reformatting() {
    assert_eq!(
        fingerprint("What  is\n2+2?"),
        fingerprint("what is 2+2?")
    );
    assert_eq!(fingerprint("x").len(), 64);
}

// ── Planning ─────────────────────────────────────────────────────────────────

#[test]
fn test_plan_leads_with_primary_by_default() {
    let registry = ModelRegistry::builtin();
    let classification = classify("What is 2+2?");
    let candidates = plan(&registry, &constraints(QualityTier::Fast), &classification);

    assert!(!candidates.is_empty());
    let first = registry.get(&candidates[0]).unwrap();
    assert_eq!(first.tier, ModelTier::Primary);
    let last = registry.get(candidates.last().unwrap()).unwrap();
    assert_eq!(last.tier, ModelTier::Edge);
}

#[test]
fn test_plan_leads_with_flagship_for_hard_quality_requests() {
    let registry = ModelRegistry::builtin();
    let classification = classify(
        "Analyze in detail the trade-offs of cloud vs on-prem for enterprise workloads with recommendations.",
    );
    assert!(classification.score > 0.7);
    let candidates = plan(&registry, &constraints(QualityTier::Quality), &classification);

    let first = registry.get(&candidates[0]).unwrap();
    assert_eq!(first.tier, ModelTier::Flagship);
    let last = registry.get(candidates.last().unwrap()).unwrap();
    assert_eq!(last.tier, ModelTier::Edge);
}

#[test]
fn test_plan_orders_within_a_tier_by_quality_then_cost() {
    let registry = ModelRegistry::builtin();
    let classification = classify("What is 2+2?");
    let candidates = plan(&registry, &constraints(QualityTier::Fast), &classification);

    let primaries: Vec<_> = candidates
        .iter()
        .map(|id| registry.get(id).unwrap())
        .filter(|m| m.tier == ModelTier::Primary)
        .collect();
    for pair in primaries.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.quality_rank() > b.quality_rank()
                || (a.quality_rank() == b.quality_rank()
                    && a.cost_per_million_tokens <= b.cost_per_million_tokens)
        );
    }
}

#[test]
fn test_edge_tier_survives_even_a_tiny_cost_ceiling() {
    let registry = ModelRegistry::builtin();
    let classification = classify("What is 2+2?");
    let tight = Constraints {
        max_cost_usd: 0.000_001,
        max_latency_ms: 15_000,
        required_quality: QualityTier::Fast,
        max_tokens: None,
    };
    let candidates = plan(&registry, &tight, &classification);
    assert!(!candidates.is_empty());
    for id in &candidates {
        assert_eq!(registry.get(id).unwrap().tier, ModelTier::Edge);
    }
}

// ── Execution with fallback ──────────────────────────────────────────────────

#[tokio::test]
async fn test_first_success_wins_without_fallback() {
    let client = ScriptedClient::new(vec![("m/a", Ok("alpha")), ("m/b", Ok("beta"))]);
    let candidates = vec!["m/a".to_string(), "m/b".to_string()];
    let routed = execute(&client, &[ChatMessage::user("hi")], &CallParams::default(), &candidates)
        .await
        .unwrap();
    assert_eq!(routed.response.content, "alpha");
    assert!(!routed.used_fallback);
    assert_eq!(routed.attempts, 1);
    assert_eq!(client.calls(), vec!["m/a"]);
}

#[tokio::test]
async fn test_empty_content_falls_over_to_the_next_candidate() {
    let client = ScriptedClient::new(vec![
        ("m/primary", Err(ProviderError::EmptyContent("m/primary".into()))),
        ("m/edge", Ok("fallback answer")),
    ]);
    let candidates = vec!["m/primary".to_string(), "m/edge".to_string()];
    let routed = execute(&client, &[ChatMessage::user("hi")], &CallParams::default(), &candidates)
        .await
        .unwrap();
    assert_eq!(routed.response.content, "fallback answer");
    assert!(routed.used_fallback);
    assert_eq!(routed.attempts, 2);
    assert_eq!(client.calls(), vec!["m/primary", "m/edge"]);
}

#[tokio::test]
async fn test_exhaustion_reports_every_attempt() {
    let client = ScriptedClient::new(vec![
        ("m/a", Err(ProviderError::RateLimited("429".into()))),
        ("m/b", Err(ProviderError::Timeout(3_000))),
        ("m/c", Err(ProviderError::Transport("down".into()))),
    ]);
    let candidates = vec!["m/a".to_string(), "m/b".to_string(), "m/c".to_string()];
    let err = execute(&client, &[ChatMessage::user("hi")], &CallParams::default(), &candidates)
        .await
        .unwrap_err();
    match err {
        RouterError::AllProvidersFailed(attempts) => {
            assert_eq!(attempts.len(), 3);
            assert_eq!(attempts[0].0, "m/a");
            assert_eq!(attempts[0].1.kind(), "rate_limited");
            assert_eq!(attempts[2].1.kind(), "transport");
        }
        other => panic!("expected AllProvidersFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_request_aborts_instead_of_falling_over() {
    let client = ScriptedClient::new(vec![
        ("m/a", Err(ProviderError::BadRequest("malformed".into()))),
        ("m/b", Ok("never reached")),
    ]);
    let candidates = vec!["m/a".to_string(), "m/b".to_string()];
    let err = execute(&client, &[ChatMessage::user("hi")], &CallParams::default(), &candidates)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Aborted(_, _)));
    assert_eq!(client.calls(), vec!["m/a"]);
}

#[tokio::test]
async fn test_candidate_order_is_never_shuffled_mid_run() {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct FailingClient;

    #[async_trait]
    impl ProviderClient for FailingClient {
        async fn call(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _params: &CallParams,
        ) -> Result<ProviderResponse, ProviderError> {
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            let expected = ["m/1", "m/2", "m/3"][n];
            assert_eq!(model_id, expected);
            Err(ProviderError::Transport("down".into()))
        }
    }

    let candidates = vec!["m/1".to_string(), "m/2".to_string(), "m/3".to_string()];
    let result = execute(
        &FailingClient,
        &[ChatMessage::user("hi")],
        &CallParams::default(),
        &candidates,
    )
    .await;
    assert!(result.is_err());
    assert_eq!(COUNTER.load(Ordering::SeqCst), 3);
}
