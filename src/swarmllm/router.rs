//! Smart router: complexity classification, candidate planning, cascading
//! fallback execution.
//!
//! [`classify`] is a pure heuristic; its thresholds are part of the contract
//! between the mediator and the orchestrator (the delegation decision and the
//! executor fan-out both key off the score).  [`plan`] turns constraints plus
//! a classification into an ordered candidate list, and [`execute`] walks that
//! list without ever reordering it, falling over on every failure kind except
//! a bad request.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::router::{classify, Complexity};
//!
//! let c = classify("What is 2+2?");
//! assert_eq!(c.complexity, Complexity::Simple);
//! assert!(c.score <= 0.3);
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt;

use crate::swarmllm::client_wrapper::{
    CallParams, ChatMessage, ProviderClient, ProviderError, ProviderResponse,
};
use crate::swarmllm::covenant::{Constraints, QualityTier};
use crate::swarmllm::registry::{ModelRegistry, ModelTier};

/// Complexity bucket a prompt falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// The outcome of classifying a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Bucketed complexity: score <= 0.3 simple, <= 0.6 moderate, else complex.
    pub complexity: Complexity,
    /// Clamped additive score in `[0, 1]`.
    pub score: f64,
    /// Human-readable factor tags explaining the score.
    pub factors: Vec<String>,
}

lazy_static! {
    static ref NUMBERED_ITEM: Regex = Regex::new(r"\b\d{1,2}[.)]\s").unwrap();
    static ref AGENTIC_CUE: Regex = Regex::new(r"(?i)\bsub-?agents?\b|\bspawns?\b|\bswarm\b").unwrap();
    static ref TASK_CUE: Regex = Regex::new(
        r"(?i)\b(analy[sz]e|analy[sz]ing|compare|comparing|research|design|evaluate|investigate|delegate|delegating|orchestrate)\b"
    )
    .unwrap();
    static ref COMPARISON_CUE: Regex =
        Regex::new(r"(?i)\b(vs|versus|trade-?offs?|differences?)\b").unwrap();
    static ref REASONING_CUE: Regex =
        Regex::new(r"(?i)\b(why|how|explain|recommend(ation)?s?|justify)\b").unwrap();
    static ref SCORE_LINE: Regex = Regex::new(r"(?i)score\s*[:=]?\s*([01](?:\.\d+)?|\.\d+)").unwrap();
}

const QUALITY_CUES: &[&str] = &[
    "detailed",
    "comprehensive",
    "in depth",
    "in-depth",
    "in detail",
    "thorough",
];

/// Classify a prompt.  Pure: the same input always yields the same output.
///
/// Additive factor buckets, each firing at most once:
///
/// - word count: `>= 50` words +0.4, `>= 20` +0.2
/// - multi-step structure ("and then", numbered items, sub-agent/spawn/swarm
///   mentions): three or more step cues +0.4, one or more +0.2
/// - quality cues ("detailed", "comprehensive", "in depth", ...) +0.3
/// - task-type cues ("analyze", "compare", "research", "design",
///   "delegate", ...) +0.3
/// - comparison framing ("vs", "trade-offs", "differences") +0.2
/// - reasoning cues ("why", "how", "explain", "recommend") +0.2
///
/// The sum is clamped to `[0, 1]` and bucketed at 0.3 and 0.6.
pub fn classify(prompt: &str) -> Classification {
    let mut score = 0.0f64;
    let mut factors = Vec::new();
    let lower = prompt.to_lowercase();

    let words = prompt.split_whitespace().count();
    if words >= 50 {
        score += 0.4;
        factors.push(format!("word_count:{}", words));
    } else if words >= 20 {
        score += 0.2;
        factors.push(format!("word_count:{}", words));
    }

    let mut steps = lower.matches("and then").count();
    steps += NUMBERED_ITEM.find_iter(prompt).count();
    steps += AGENTIC_CUE.find_iter(prompt).count();
    if steps >= 3 {
        score += 0.4;
        factors.push(format!("multi_step:{}", steps));
    } else if steps >= 1 {
        score += 0.2;
        factors.push(format!("multi_step:{}", steps));
    }

    if let Some(cue) = QUALITY_CUES.iter().find(|c| lower.contains(*c)) {
        score += 0.3;
        factors.push(format!("quality_cue:{}", cue.replace(' ', "_")));
    }

    if let Some(m) = TASK_CUE.find(prompt) {
        score += 0.3;
        factors.push(format!("task_cue:{}", m.as_str().to_lowercase()));
    }

    if let Some(m) = COMPARISON_CUE.find(prompt) {
        score += 0.2;
        factors.push(format!("comparison_cue:{}", m.as_str().to_lowercase()));
    }

    if let Some(m) = REASONING_CUE.find(prompt) {
        score += 0.2;
        factors.push(format!("reasoning_cue:{}", m.as_str().to_lowercase()));
    }

    let score = score.min(1.0);
    let complexity = if score <= 0.3 {
        Complexity::Simple
    } else if score <= 0.6 {
        Complexity::Moderate
    } else {
        Complexity::Complex
    };

    Classification {
        complexity,
        score,
        factors,
    }
}

/// Extract an evaluator score from free text: the first `SCORE: x` match,
/// clamped to `[0, 1]`.  Returns `None` when no score line is present.
pub fn extract_score(text: &str) -> Option<f64> {
    SCORE_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|v| v.max(0.0).min(1.0))
}

/// Fingerprint a prompt: sha-256 over the whitespace-normalized lowercase
/// text, hex encoded.  Stable across trivially reformatted resubmissions.
pub fn fingerprint(prompt: &str) -> String {
    let normalized = prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Build the ordered candidate list for a request.
///
/// Primary tier leads unless the covenant demands `quality` and the score
/// exceeds 0.7, in which case flagship leads.  The edge tier always closes the
/// list as the last resort.  Within a tier, candidates sort by quality rank
/// descending, then cost ascending; the list is never reordered mid-run.
/// Models whose estimated cost for the token budget would blow the covenant's
/// cost ceiling are skipped, except in the edge tier.
pub fn plan(
    registry: &ModelRegistry,
    constraints: &Constraints,
    classification: &Classification,
) -> Vec<String> {
    let flagship_first =
        constraints.required_quality == QualityTier::Quality && classification.score > 0.7;

    let tier_chain: Vec<ModelTier> = if flagship_first {
        vec![ModelTier::Flagship, ModelTier::Primary, ModelTier::Edge]
    } else if constraints.required_quality == QualityTier::Quality {
        vec![ModelTier::Primary, ModelTier::Flagship, ModelTier::Edge]
    } else {
        vec![ModelTier::Primary, ModelTier::Edge]
    };

    // Rough affordability screen: price the token budget, both directions.
    // Mirrors the score-derived budgets the mediator applies on the fast path.
    let derived_tokens = if classification.score > 0.7 {
        8192
    } else if classification.score > 0.4 {
        4096
    } else {
        2048
    };
    let budget_tokens = f64::from(constraints.max_tokens.unwrap_or(derived_tokens)) * 2.0;

    let mut candidates = Vec::new();
    for tier in tier_chain {
        let mut tier_models = registry.by_tier(tier);
        tier_models.sort_by(|a, b| {
            b.quality_rank().cmp(&a.quality_rank()).then(
                a.cost_per_million_tokens
                    .partial_cmp(&b.cost_per_million_tokens)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        for m in tier_models {
            let estimated = m.cost_per_million_tokens * budget_tokens / 1_000_000.0;
            if tier != ModelTier::Edge && estimated > constraints.max_cost_usd {
                continue;
            }
            candidates.push(m.id.to_string());
        }
    }
    candidates
}

/// Result of a routed request.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    /// The winning provider response.
    pub response: ProviderResponse,
    /// The candidate that served it.
    pub model_id: String,
    /// True when at least one earlier candidate failed.
    pub used_fallback: bool,
    /// How many candidates were tried, including the winner.
    pub attempts: u32,
}

/// Errors raised by [`execute`].
#[derive(Debug)]
pub enum RouterError {
    /// The candidate list was empty.
    NoCandidates,
    /// A validation-class provider error aborted the cascade.
    Aborted(String, ProviderError),
    /// Every candidate failed; carries each per-attempt error in order.
    AllProvidersFailed(Vec<(String, ProviderError)>),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::NoCandidates => write!(f, "no routable candidates"),
            RouterError::Aborted(model, e) => {
                write!(f, "cascade aborted at {}: {}", model, e)
            }
            RouterError::AllProvidersFailed(attempts) => {
                write!(f, "all {} providers failed", attempts.len())?;
                for (model, e) in attempts {
                    write!(f, "; {}: {}", model, e)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for RouterError {}

impl RouterError {
    /// Stable machine-readable tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::NoCandidates => "no_candidates",
            RouterError::Aborted(_, _) => "bad_request",
            RouterError::AllProvidersFailed(_) => "all_providers_failed",
        }
    }
}

/// Execute a request against an ordered candidate list.
///
/// Candidates are tried strictly in order.  Every failure kind except
/// [`ProviderError::BadRequest`] falls over to the next candidate; on
/// exhaustion the per-attempt errors are returned together.
pub async fn execute(
    client: &dyn ProviderClient,
    messages: &[ChatMessage],
    params: &CallParams,
    candidates: &[String],
) -> Result<RoutedResponse, RouterError> {
    if candidates.is_empty() {
        return Err(RouterError::NoCandidates);
    }

    let mut attempts: Vec<(String, ProviderError)> = Vec::new();
    for (index, model_id) in candidates.iter().enumerate() {
        match client.call(model_id, messages, params).await {
            Ok(response) => {
                return Ok(RoutedResponse {
                    response,
                    model_id: model_id.clone(),
                    used_fallback: index > 0,
                    attempts: index as u32 + 1,
                });
            }
            Err(e) if e.aborts_cascade() => {
                return Err(RouterError::Aborted(model_id.clone(), e));
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "candidate {} failed ({}), falling over ({} left)",
                        model_id,
                        e.kind(),
                        candidates.len() - index - 1
                    );
                }
                attempts.push((model_id.clone(), e));
            }
        }
    }
    Err(RouterError::AllProvidersFailed(attempts))
}
