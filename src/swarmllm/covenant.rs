//! Covenant data model.
//!
//! A covenant bundles a user intent with its quantitative constraints and the
//! state of the system's response to it.  The mediator owns covenant
//! lifecycles; the orchestrator reports back through a
//! [`CallbackHandle`].
//!
//! # State machine
//!
//! ```text
//! draft -> active -> completed | failed | rejected
//!               \-> delegated -> completed | failed | rejected
//! ```
//!
//! Transitions are one-directional; [`Covenant::advance`] rejects anything
//! else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

use crate::swarmllm::client_wrapper::Role;

/// Hard floor on the per-call provider deadline.  Constraints below it cannot
/// be satisfied and are rejected as validation failures.
pub const MIN_PROVIDER_DEADLINE_MS: u64 = 3_000;

/// Requested quality tier for a covenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Latency first; edge-class answers are acceptable.
    Fast,
    /// The default trade-off.
    Balanced,
    /// Quality first; flagship models become eligible.
    Quality,
}

/// Quantitative constraints attached to a covenant.  Immutable once attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraints {
    /// Cost ceiling for satisfying the intent, USD.
    pub max_cost_usd: f64,
    /// Latency deadline for satisfying the intent, milliseconds.
    pub max_latency_ms: u64,
    /// Requested quality tier.
    pub required_quality: QualityTier,
    /// Optional explicit token budget.  Derived from the complexity score when
    /// absent.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_cost_usd: 0.10,
            max_latency_ms: 15_000,
            required_quality: QualityTier::Balanced,
            max_tokens: None,
        }
    }
}

/// Validation failures for intents and constraints.
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// `max_cost_usd` must be strictly positive.
    NonPositiveCost(f64),
    /// `max_latency_ms` is below [`MIN_PROVIDER_DEADLINE_MS`].
    LatencyBelowFloor(u64),
    /// The intent text is empty.
    EmptyIntent,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NonPositiveCost(v) => {
                write!(f, "max_cost_usd must be positive, got {}", v)
            }
            ValidationError::LatencyBelowFloor(v) => write!(
                f,
                "max_latency_ms {} is below the {} ms provider deadline floor",
                v, MIN_PROVIDER_DEADLINE_MS
            ),
            ValidationError::EmptyIntent => write!(f, "intent must not be empty"),
        }
    }
}

impl Error for ValidationError {}

impl Constraints {
    /// Check the boundary rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_cost_usd <= 0.0 {
            return Err(ValidationError::NonPositiveCost(self.max_cost_usd));
        }
        if self.max_latency_ms < MIN_PROVIDER_DEADLINE_MS {
            return Err(ValidationError::LatencyBelowFloor(self.max_latency_ms));
        }
        Ok(())
    }

    /// The hard per-call deadline derived from these constraints.
    pub fn call_deadline_ms(&self) -> u64 {
        self.max_latency_ms.min(30_000)
    }
}

/// Lifecycle state of a covenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovenantState {
    /// Created, not yet classified.
    Draft,
    /// Classified and decision recorded.
    Active,
    /// Handed to an orchestrator actor.
    Delegated,
    /// Terminal: resolved with results.
    Completed,
    /// Terminal: resolution failed.
    Failed,
    /// Terminal: the quality gate declined the results.
    Rejected,
}

impl CovenantState {
    /// Whether this state ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CovenantState::Completed | CovenantState::Failed | CovenantState::Rejected
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: CovenantState) -> bool {
        match (self, next) {
            (CovenantState::Draft, CovenantState::Active) => true,
            (CovenantState::Active, CovenantState::Delegated) => true,
            (CovenantState::Active, s) if s.is_terminal() => true,
            (CovenantState::Delegated, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for CovenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CovenantState::Draft => "draft",
            CovenantState::Active => "active",
            CovenantState::Delegated => "delegated",
            CovenantState::Completed => "completed",
            CovenantState::Failed => "failed",
            CovenantState::Rejected => "rejected",
        };
        write!(f, "{}", tag)
    }
}

/// Results attached to a terminal covenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovenantResults {
    /// The authoritative answer content.
    pub content: String,
    /// Quality score in `[0, 1]`.  The fast path records 1.0; delegated runs
    /// carry the evaluator's clamped score.
    pub quality: f64,
    /// Total cost of the run, USD.
    pub cost_usd: f64,
    /// Wall-clock latency of the run, milliseconds.
    pub latency_ms: u64,
    /// Number of sub-agents that participated (zero on the fast path).
    pub sub_agent_count: u32,
    /// Whether the smart router had to fall over past its first candidate.
    #[serde(default)]
    pub used_fallback: bool,
    /// Error detail carried by failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Errors raised by covenant lifecycle operations.
#[derive(Debug, Clone)]
pub enum CovenantError {
    /// An attempt to move the state machine backwards or skip a state.
    IllegalTransition {
        from: CovenantState,
        to: CovenantState,
    },
}

impl fmt::Display for CovenantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CovenantError::IllegalTransition { from, to } => {
                write!(f, "illegal covenant transition {} -> {}", from, to)
            }
        }
    }
}

impl Error for CovenantError {}

/// A covenant: one user intent, its constraints, and the lifecycle of the
/// system's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Covenant {
    /// Opaque unique id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// The natural-language intent.
    pub intent: String,
    /// Constraints, immutable once attached.
    pub constraints: Constraints,
    /// Current lifecycle state.
    pub state: CovenantState,
    /// Append-only mediator decision log.
    pub mediator_decision: Vec<String>,
    /// Description of the orchestration plan, set on delegation.
    #[serde(default)]
    pub orchestration_plan: Option<String>,
    /// Results, present on `completed` covenants (and carrying error detail on
    /// failed/rejected ones).
    #[serde(default)]
    pub results: Option<CovenantResults>,
    /// Machine-readable terminal reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable terminal message.
    #[serde(default)]
    pub message: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; monotonic.
    pub updated_at: DateTime<Utc>,
}

impl Covenant {
    /// Create a fresh covenant in `draft`.
    pub fn new(
        user_id: impl Into<String>,
        intent: impl Into<String>,
        constraints: Constraints,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            intent: intent.into(),
            constraints,
            state: CovenantState::Draft,
            mediator_decision: Vec::new(),
            orchestration_plan: None,
            results: None,
            reason: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the state machine, refusing backward or skipping transitions.
    pub fn advance(&mut self, next: CovenantState) -> Result<(), CovenantError> {
        if !self.state.can_advance_to(next) {
            return Err(CovenantError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Append one line to the decision log.
    pub fn append_decision(&mut self, line: impl Into<String>) {
        self.mediator_decision.push(line.into());
        self.touch();
    }

    /// Record the terminal reason/message pair.
    pub fn set_reason(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// One conversation turn in a user's message log.  The mediator is the only
/// writer of this log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Opaque unique id.
    pub id: String,
    /// Covenant this turn belongs to; `None` for system notices.
    pub covenant_id: Option<String>,
    /// Author role.
    pub role: Role,
    /// The message body.
    pub content: String,
    /// When the turn was recorded.
    pub ts: DateTime<Utc>,
}

impl StoredMessage {
    /// Create a message stamped now.
    pub fn new(covenant_id: Option<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            covenant_id,
            role,
            content: content.into(),
            ts: Utc::now(),
        }
    }
}

/// Rolling per-user performance counters, derived from the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub total_covenants: u64,
    pub delegated_count: u64,
    pub completed_count: u64,
    pub rejected_count: u64,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
}

/// Context snapshot the mediator hands to an orchestrator on delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorContext {
    /// Owning user.
    pub user_id: String,
    /// The trailing slice of the user's message log.
    pub recent_messages: Vec<StoredMessage>,
    /// Rolling counters at delegation time.
    pub performance: PerformanceCounters,
}

/// Metadata the orchestrator attaches to its completion payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMetadata {
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock execution time, milliseconds.
    pub execution_time_ms: u64,
    /// The quality score the run settled on.
    pub quality: f64,
    /// Number of sub-agents spawned.
    pub sub_agent_count: u32,
}

/// Completion payload delivered back to the mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionPayload {
    /// The covenant this payload resolves.
    pub covenant_id: String,
    /// `completed` or `failed`; never a non-terminal state.
    pub state: CovenantState,
    /// The run's results (carrying error detail when failed).
    pub results: CovenantResults,
    /// Run metadata for the mediator's bookkeeping.
    pub orchestrator_metadata: OrchestratorMetadata,
}

/// Location-independent reference to a mediator's callback inbox.
///
/// The mediator hands one of these to the orchestrator at delegation time;
/// neither actor owns the other.  Delivery failures surface as
/// [`CallbackError`] so the orchestrator can retry once and then record a
/// post-mortem row.
#[derive(Clone)]
pub struct CallbackHandle {
    tx: mpsc::Sender<CompletionPayload>,
}

/// The callback target is gone (its mediator actor stopped).
#[derive(Debug, Clone)]
pub struct CallbackError;

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback target is no longer reachable")
    }
}

impl Error for CallbackError {}

impl CallbackHandle {
    /// Wrap a sender into a mediator's callback inbox.
    pub fn new(tx: mpsc::Sender<CompletionPayload>) -> Self {
        Self { tx }
    }

    /// Deliver a completion payload.
    pub async fn deliver(&self, payload: CompletionPayload) -> Result<(), CallbackError> {
        self.tx.send(payload).await.map_err(|_| CallbackError)
    }
}

/// Validate a sub-agent parentage edge set: every `parent_id` must resolve
/// within `ids` and the edges must not close a cycle.  Tasks are inserted in
/// creation order, so a parent that appears after its child is rejected too.
pub fn validate_dag(ids_in_order: &[(String, Option<String>)]) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    for (id, parent) in ids_in_order {
        if let Some(p) = parent {
            if p == id || !seen.contains(p.as_str()) {
                return false;
            }
        }
        seen.insert(id.as_str());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_never_move_backwards() {
        let mut c = Covenant::new("u", "hello there", Constraints::default());
        assert!(c.advance(CovenantState::Active).is_ok());
        assert!(c.advance(CovenantState::Draft).is_err());
        assert!(c.advance(CovenantState::Delegated).is_ok());
        assert!(c.advance(CovenantState::Active).is_err());
        assert!(c.advance(CovenantState::Completed).is_ok());
        assert!(c.advance(CovenantState::Failed).is_err());
    }

    #[test]
    fn draft_cannot_skip_active() {
        let mut c = Covenant::new("u", "hello there", Constraints::default());
        assert!(c.advance(CovenantState::Delegated).is_err());
        assert!(c.advance(CovenantState::Completed).is_err());
    }

    #[test]
    fn constraint_boundaries() {
        let mut c = Constraints::default();
        c.max_cost_usd = 0.0;
        assert!(matches!(
            c.validate(),
            Err(ValidationError::NonPositiveCost(_))
        ));

        let mut c = Constraints::default();
        c.max_latency_ms = 2_999;
        assert!(matches!(
            c.validate(),
            Err(ValidationError::LatencyBelowFloor(_))
        ));

        assert!(Constraints::default().validate().is_ok());
    }

    #[test]
    fn dag_rejects_forward_and_self_references() {
        let ok = vec![
            ("a".to_string(), None),
            ("b".to_string(), Some("a".to_string())),
            ("c".to_string(), Some("b".to_string())),
        ];
        assert!(validate_dag(&ok));

        let self_ref = vec![("a".to_string(), Some("a".to_string()))];
        assert!(!validate_dag(&self_ref));

        let forward = vec![
            ("a".to_string(), Some("b".to_string())),
            ("b".to_string(), None),
        ];
        assert!(!validate_dag(&forward));
    }
}
