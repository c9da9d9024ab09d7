//! Per-covenant orchestrator actor.
//!
//! One orchestrator owns the sub-agent swarm for one delegated covenant.  It
//! builds a plan (a pattern-detected rainbow swarm or the generic five-role
//! pipeline), executes it with hierarchical context, aggregates the results,
//! and reports back through the [`CallbackHandle`] the mediator handed in at
//! delegation time.  Neither actor owns the other.
//!
//! # Task state machine
//!
//! ```text
//! pending -> planning -> executing -> aggregating -> completed | failed
//! ```
//!
//! Transitions are one-directional and each one is broadcast on the actor's
//! event bus.
//!
//! # Fail-soft rules
//!
//! - A single executor failure never aborts the batch; the evaluator sees an
//!   error placeholder instead.
//! - Evaluator failure degrades to the default quality of 0.5.
//! - All executors failing, planning failure, cancellation, or blowing the
//!   overall `2 x max_latency_ms` budget all still produce a callback with
//!   `state = failed` and a machine-readable reason.
//! - Callback delivery is retried once with backoff; a second failure leaves a
//!   post-mortem row in the evaluations table.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};

use crate::swarmllm::client_wrapper::ProviderClient;
use crate::swarmllm::config::SwarmConfig;
use crate::swarmllm::covenant::{
    validate_dag, CallbackHandle, CompletionPayload, Covenant, CovenantResults, CovenantState,
    MediatorContext, OrchestratorMetadata, QualityTier,
};
use crate::swarmllm::event::{EventBus, ServerEvent, Subscription};
use crate::swarmllm::registry::{ModelRegistry, ModelTier};
use crate::swarmllm::router::{classify, extract_score};
use crate::swarmllm::store::CovenantStore;
use crate::swarmllm::subagent::{
    self, ParentContext, SubAgentRole, SubAgentStatus, SubAgentTask,
};

lazy_static! {
    static ref RAINBOW_RE: Regex =
        Regex::new(r"(?i)rainbow|colors?|gradient|roygbiv|sub-?agent.*color").unwrap();
}

/// Phase of an orchestrator's task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Planning,
    Executing,
    Aggregating,
    Completed,
    Failed,
}

impl TaskPhase {
    /// Whether the phase ends the task.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            TaskPhase::Pending => "pending",
            TaskPhase::Planning => "planning",
            TaskPhase::Executing => "executing",
            TaskPhase::Aggregating => "aggregating",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
        };
        write!(f, "{}", tag)
    }
}

/// The shape of a constructed plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// Spawner, seven sequential color agents, aggregator.
    Rainbow,
    /// Classifier, router, `executor_count` parallel executors, evaluator,
    /// coordinator.
    Generic { executor_count: u32 },
}

/// A constructed orchestration plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationPlan {
    pub kind: PlanKind,
    /// Human-readable description persisted with the task head.
    pub description: String,
}

/// Whether an intent asks for the rainbow swarm.
pub fn detect_rainbow(intent: &str) -> bool {
    RAINBOW_RE.is_match(intent)
}

/// Build the plan for an intent.  The rainbow detector runs first; otherwise
/// the generic pipeline is sized from the complexity score, clamped into
/// `[1, parallel_executor_cap]`.
pub fn build_plan(intent: &str, config: &SwarmConfig) -> OrchestrationPlan {
    if detect_rainbow(intent) {
        return OrchestrationPlan {
            kind: PlanKind::Rainbow,
            description: "rainbow swarm: spawner, seven color agents in gradient order, aggregator"
                .to_string(),
        };
    }
    let score = classify(intent).score;
    let cap = config.parallel_executor_cap.max(1);
    let executor_count = ((score * 5.0).ceil() as u32).max(1).min(cap);
    OrchestrationPlan {
        kind: PlanKind::Generic { executor_count },
        description: format!(
            "generic pipeline: classifier, router, {} parallel executors, evaluator, coordinator",
            executor_count
        ),
    }
}

/// Errors internal to an orchestrator run.  Each maps onto a machine-readable
/// reason carried by the failure callback.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Plan construction failed (e.g. the registry has no usable model).
    PlanError(String),
    /// Every executor branch failed.
    NoExecutorResult,
    /// The client cancelled the covenant; outputs are discarded.
    Cancelled,
    /// The overall `2 x max_latency_ms` budget elapsed.
    OverallTimeout(u64),
    /// A sub-agent parentage edge did not resolve acyclically.
    InvalidParent(String),
    /// Anything unexpected.
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable reason tag.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::PlanError(_) => "plan_error",
            OrchestratorError::NoExecutorResult => "no_executor_result",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::OverallTimeout(_) => "overall_timeout",
            OrchestratorError::InvalidParent(_) => "internal",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::PlanError(d) => write!(f, "plan construction failed: {}", d),
            OrchestratorError::NoExecutorResult => write!(f, "every executor branch failed"),
            OrchestratorError::Cancelled => write!(f, "cancelled by client"),
            OrchestratorError::OverallTimeout(ms) => {
                write!(f, "overall budget of {} ms exceeded", ms)
            }
            OrchestratorError::InvalidParent(id) => {
                write!(f, "sub-agent parent did not resolve: {}", id)
            }
            OrchestratorError::Internal(d) => write!(f, "internal orchestrator error: {}", d),
        }
    }
}

impl Error for OrchestratorError {}

/// Durable head snapshot of an orchestrator actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub covenant_id: String,
    pub phase: TaskPhase,
    pub plan: Option<OrchestrationPlan>,
    pub sub_agents: Vec<SubAgentTask>,
}

/// Everything an orchestrator needs to run.
pub struct OrchestratorSeed {
    pub covenant: Covenant,
    pub context: MediatorContext,
    pub callback: CallbackHandle,
    pub registry: Arc<ModelRegistry>,
    pub client: Arc<dyn ProviderClient>,
    pub config: SwarmConfig,
    pub store_path: PathBuf,
}

enum OrchestratorMsg {
    Cancel,
}

/// Cloneable, location-independent reference to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    covenant_id: String,
    cmd_tx: mpsc::Sender<OrchestratorMsg>,
    status_rx: watch::Receiver<TaskPhase>,
    bus: EventBus,
}

impl OrchestratorHandle {
    /// The covenant this orchestrator serves.
    pub fn covenant_id(&self) -> &str {
        &self.covenant_id
    }

    /// Current task phase.  Reading it never blocks the actor.
    pub fn status(&self) -> TaskPhase {
        *self.status_rx.borrow()
    }

    /// Whether the task reached a terminal phase.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Ask the actor to cancel.  In-flight sub-agents are allowed to complete
    /// but their outputs are discarded.
    pub async fn cancel(&self) {
        let _ = self.cmd_tx.send(OrchestratorMsg::Cancel).await;
    }

    /// Attach a read-only event stream; replays the head snapshot first.
    pub async fn subscribe(&self) -> Subscription {
        self.bus.subscribe().await
    }
}

/// Spawn the orchestrator actor for one covenant.  Returns immediately; the
/// run proceeds asynchronously and resolves through the seed's callback.
pub fn spawn(seed: OrchestratorSeed) -> OrchestratorHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<OrchestratorMsg>(8);
    let (status_tx, status_rx) = watch::channel(TaskPhase::Pending);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let bus = EventBus::new();

    let handle = OrchestratorHandle {
        covenant_id: seed.covenant.id.clone(),
        cmd_tx,
        status_rx,
        bus: bus.clone(),
    };

    tokio::spawn(async move {
        while let Some(OrchestratorMsg::Cancel) = cmd_rx.recv().await {
            let _ = cancel_tx.send(true);
        }
    });

    tokio::spawn(actor_main(seed, status_tx, cancel_rx, bus));

    handle
}

struct RunState {
    covenant: Covenant,
    context: MediatorContext,
    registry: Arc<ModelRegistry>,
    client: Arc<dyn ProviderClient>,
    config: SwarmConfig,
    store: CovenantStore,
    bus: EventBus,
    status_tx: watch::Sender<TaskPhase>,
    phase: TaskPhase,
    plan: Option<OrchestrationPlan>,
    tasks: Vec<SubAgentTask>,
    started: Instant,
}

impl RunState {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            covenant_id: self.covenant.id.clone(),
            phase: self.phase,
            plan: self.plan.clone(),
            sub_agents: self.tasks.clone(),
        }
    }

    async fn persist_head(&self) {
        if let Err(e) = self.store.put_head(&self.snapshot()).await {
            if log::log_enabled!(log::Level::Error) {
                log::error!("orchestrator {} head persist failed: {}", self.covenant.id, e);
            }
        }
    }

    async fn set_phase(&mut self, phase: TaskPhase) {
        self.phase = phase;
        let _ = self.status_tx.send(phase);
        self.persist_head().await;
        self.bus
            .publish(ServerEvent::StatusChange {
                covenant_id: Some(self.covenant.id.clone()),
                phase: phase.to_string(),
                detail: None,
            })
            .await;
    }

    /// Append a task, enforcing that its parent resolves acyclically within
    /// this actor's scope.
    fn push_task(&mut self, task: SubAgentTask) -> Result<usize, OrchestratorError> {
        let mut edges: Vec<(String, Option<String>)> = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.parent_id.clone()))
            .collect();
        edges.push((task.id.clone(), task.parent_id.clone()));
        if !validate_dag(&edges) {
            return Err(OrchestratorError::InvalidParent(
                task.parent_id.clone().unwrap_or_default(),
            ));
        }
        self.tasks.push(task);
        Ok(self.tasks.len() - 1)
    }

    fn pick_model(&self, role: SubAgentRole) -> Result<String, OrchestratorError> {
        let quality = self.covenant.constraints.required_quality;
        let tier = match role {
            SubAgentRole::Executor => ModelTier::Primary,
            SubAgentRole::Evaluator | SubAgentRole::Coordinator => {
                if quality == QualityTier::Quality {
                    ModelTier::Flagship
                } else {
                    ModelTier::Primary
                }
            }
            _ => ModelTier::Edge,
        };
        self.registry
            .best_of_tier(tier)
            .map(|m| m.id.to_string())
            .ok_or_else(|| OrchestratorError::PlanError(format!("no model in {} tier", tier)))
    }

    fn parent_context(&self, branch_index: Option<u32>, previous: Vec<String>) -> ParentContext {
        ParentContext {
            intent: self.covenant.intent.clone(),
            constraints: self.covenant.constraints.clone(),
            recent_messages: self.context.recent_messages.clone(),
            branch_index,
            previous_results: previous,
        }
    }

    fn max_tokens(&self) -> u32 {
        let score = classify(&self.covenant.intent).score;
        self.covenant
            .constraints
            .max_tokens
            .unwrap_or_else(|| self.config.tokens_for_score(score))
    }

    async fn emit_spawn(&self, index: usize) {
        let t = &self.tasks[index];
        self.bus
            .publish(ServerEvent::AgentSpawn {
                covenant_id: self.covenant.id.clone(),
                agent_id: t.id.clone(),
                role: t.role.to_string(),
            })
            .await;
    }

    async fn emit_complete(&self, index: usize) {
        let t = &self.tasks[index];
        self.bus
            .publish(ServerEvent::AgentComplete {
                covenant_id: self.covenant.id.clone(),
                agent_id: t.id.clone(),
                success: t.status == SubAgentStatus::Completed,
            })
            .await;
    }

    /// Record a finished sub-agent in the metrics table.
    async fn record_task_metric(&self, index: usize) {
        let t = &self.tasks[index];
        let latency = match (t.started_at, t.completed_at) {
            (Some(s), Some(c)) => (c - s).num_milliseconds().max(0) as u64,
            _ => 0,
        };
        let cost = t
            .usage
            .as_ref()
            .map(|u| self.registry.price(&t.model_id, u))
            .unwrap_or(0.0);
        if let Err(e) = self
            .store
            .record_metric(
                Some(&self.covenant.id),
                latency,
                cost,
                t.status == SubAgentStatus::Completed,
            )
            .await
        {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("metric row failed for {}: {}", t.id, e);
            }
        }
    }

    /// Run a model-backed task sequentially, with progress broadcast.
    async fn run_task(&mut self, index: usize, context: ParentContext) {
        let covenant_id = self.covenant.id.clone();
        let deadline = self.covenant.constraints.call_deadline_ms();
        self.bus
            .publish(ServerEvent::AgentProgress {
                covenant_id: covenant_id.clone(),
                agent_id: self.tasks[index].id.clone(),
                progress: 10,
                thought: Some("running".to_string()),
            })
            .await;
        let client = Arc::clone(&self.client);
        {
            let task = &mut self.tasks[index];
            subagent::run(task, client.as_ref(), &context, deadline).await;
        }
        self.record_task_metric(index).await;
        self.emit_complete(index).await;
        self.persist_head().await;
    }

    fn output_text(&self, index: usize) -> String {
        self.tasks[index]
            .output
            .as_ref()
            .map(|o| o.as_text())
            .unwrap_or_default()
    }

    fn total_cost(&self) -> f64 {
        self.tasks
            .iter()
            .filter_map(|t| t.usage.as_ref().map(|u| self.registry.price(&t.model_id, u)))
            .sum()
    }

    fn results(&self, content: String, quality: f64) -> CovenantResults {
        CovenantResults {
            content,
            quality: quality.max(0.0).min(1.0),
            cost_usd: self.total_cost(),
            latency_ms: self.started.elapsed().as_millis() as u64,
            sub_agent_count: self.tasks.len() as u32,
            used_fallback: false,
            error: None,
        }
    }
}

async fn actor_main(
    seed: OrchestratorSeed,
    status_tx: watch::Sender<TaskPhase>,
    cancel_rx: watch::Receiver<bool>,
    bus: EventBus,
) {
    let OrchestratorSeed {
        covenant,
        context,
        callback,
        registry,
        client,
        config,
        store_path,
    } = seed;

    let store = match CovenantStore::open(&store_path).await {
        Ok(store) => store,
        Err(e) => {
            if log::log_enabled!(log::Level::Error) {
                log::error!("orchestrator store unavailable at {:?}: {}", store_path, e);
            }
            let payload = failure_payload(
                &covenant,
                0,
                0,
                &OrchestratorError::Internal(format!("store unavailable: {}", e)),
            );
            let _ = callback.deliver(payload).await;
            return;
        }
    };

    bus.set_snapshot(covenant.clone()).await;

    let mut state = RunState {
        covenant,
        context,
        registry,
        client,
        config,
        store,
        bus,
        status_tx,
        phase: TaskPhase::Pending,
        plan: None,
        tasks: Vec::new(),
        started: Instant::now(),
    };

    state.persist_head().await;
    state
        .bus
        .publish(ServerEvent::TaskStart {
            covenant_id: state.covenant.id.clone(),
        })
        .await;

    let budget_ms = state.covenant.constraints.max_latency_ms
        * u64::from(state.config.orchestrator_timeout_multiplier.max(1));

    state.set_phase(TaskPhase::Planning).await;
    let plan = build_plan(&state.covenant.intent, &state.config);
    state.plan = Some(plan.clone());
    state.persist_head().await;

    state.set_phase(TaskPhase::Executing).await;
    let run = execute_plan(&mut state, &plan, cancel_rx);
    let outcome = match tokio::time::timeout(Duration::from_millis(budget_ms), run).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::OverallTimeout(budget_ms)),
    };

    match outcome {
        Ok(results) => {
            state.set_phase(TaskPhase::Completed).await;
            state
                .bus
                .publish(ServerEvent::TaskComplete {
                    covenant_id: state.covenant.id.clone(),
                })
                .await;
            let payload = CompletionPayload {
                covenant_id: state.covenant.id.clone(),
                state: CovenantState::Completed,
                orchestrator_metadata: OrchestratorMetadata {
                    completed_at: Utc::now(),
                    execution_time_ms: state.started.elapsed().as_millis() as u64,
                    quality: results.quality,
                    sub_agent_count: results.sub_agent_count,
                },
                results,
            };
            deliver_with_retry(&state, &callback, payload).await;
        }
        Err(e) => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("orchestrator {} failed: {}", state.covenant.id, e);
            }
            state.set_phase(TaskPhase::Failed).await;
            if let Err(se) = state
                .store
                .record_evaluation(&state.covenant.id, e.kind(), &e.to_string())
                .await
            {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("evaluation row failed: {}", se);
                }
            }
            state
                .bus
                .publish(ServerEvent::Error {
                    covenant_id: Some(state.covenant.id.clone()),
                    reason: e.kind().to_string(),
                    message: e.to_string(),
                })
                .await;
            let payload = failure_payload(
                &state.covenant,
                state.started.elapsed().as_millis() as u64,
                state.tasks.len() as u32,
                &e,
            );
            deliver_with_retry(&state, &callback, payload).await;
        }
    }
}

fn failure_payload(
    covenant: &Covenant,
    execution_time_ms: u64,
    sub_agent_count: u32,
    error: &OrchestratorError,
) -> CompletionPayload {
    CompletionPayload {
        covenant_id: covenant.id.clone(),
        state: CovenantState::Failed,
        results: CovenantResults {
            content: String::new(),
            quality: 0.0,
            cost_usd: 0.0,
            latency_ms: execution_time_ms,
            sub_agent_count,
            used_fallback: false,
            error: Some(error.kind().to_string()),
        },
        orchestrator_metadata: OrchestratorMetadata {
            completed_at: Utc::now(),
            execution_time_ms,
            quality: 0.0,
            sub_agent_count,
        },
    }
}

async fn deliver_with_retry(state: &RunState, callback: &CallbackHandle, payload: CompletionPayload) {
    if callback.deliver(payload.clone()).await.is_ok() {
        return;
    }
    tokio::time::sleep(Duration::from_millis(250)).await;
    if callback.deliver(payload.clone()).await.is_err() {
        if log::log_enabled!(log::Level::Error) {
            log::error!(
                "callback for {} undeliverable after retry; leaving post-mortem row",
                payload.covenant_id
            );
        }
        let _ = state
            .store
            .record_evaluation(&payload.covenant_id, "callback_error", "mediator unreachable")
            .await;
    }
}

async fn execute_plan(
    state: &mut RunState,
    plan: &OrchestrationPlan,
    cancel_rx: watch::Receiver<bool>,
) -> Result<CovenantResults, OrchestratorError> {
    let results = match plan.kind {
        PlanKind::Rainbow => run_rainbow(state, &cancel_rx).await?,
        PlanKind::Generic { executor_count } => {
            run_generic(state, executor_count, &cancel_rx).await?
        }
    };

    if *cancel_rx.borrow() {
        return Err(OrchestratorError::Cancelled);
    }

    state.set_phase(TaskPhase::Aggregating).await;
    state.persist_head().await;
    Ok(results)
}

fn cancelled(cancel_rx: &watch::Receiver<bool>) -> Result<(), OrchestratorError> {
    if *cancel_rx.borrow() {
        Err(OrchestratorError::Cancelled)
    } else {
        Ok(())
    }
}

/// Rainbow plan: spawner, seven sequential color agents paced at least 150 ms
/// apart, and an aggregator that verifies gradient order locally.
async fn run_rainbow(
    state: &mut RunState,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<CovenantResults, OrchestratorError> {
    let pacing = Duration::from_millis(state.config.effective_rainbow_pacing_ms());
    let max_tokens = 64;

    let mut spawner = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Spawner,
        "Announce the rainbow swarm.",
        String::new(),
        max_tokens,
        None,
    );
    subagent::complete_locally(
        &mut spawner,
        "spawning seven color agents in gradient order".to_string(),
        true,
    );
    let spawner_id = spawner.id.clone();
    let spawner_idx = state.push_task(spawner)?;
    state.emit_spawn(spawner_idx).await;
    state.emit_complete(spawner_idx).await;
    state.persist_head().await;

    let color_model = state.pick_model(SubAgentRole::ColorRed)?;
    let mut color_indices = Vec::with_capacity(SubAgentRole::RAINBOW.len());

    for (i, role) in SubAgentRole::RAINBOW.iter().enumerate() {
        cancelled(cancel_rx)?;
        if i > 0 {
            tokio::time::sleep(pacing).await;
        }
        let task = SubAgentTask::new(
            state.covenant.id.clone(),
            *role,
            "Produce your color of the rainbow.",
            color_model.clone(),
            max_tokens,
            Some(spawner_id.clone()),
        );
        let index = state.push_task(task)?;
        state.emit_spawn(index).await;
        let context = state.parent_context(Some(i as u32), Vec::new());
        state.run_task(index, context).await;
        color_indices.push(index);
    }

    cancelled(cancel_rx)?;

    // Aggregation is deterministic: verify the gradient order and concatenate.
    let expected: Vec<&str> = SubAgentRole::RAINBOW
        .iter()
        .filter_map(|r| r.color_name())
        .collect();
    let outputs: Vec<String> = color_indices
        .iter()
        .map(|&i| state.output_text(i).trim().to_uppercase())
        .collect();
    let verified = outputs.len() == expected.len()
        && outputs
            .iter()
            .zip(expected.iter())
            .all(|(out, want)| out.contains(want));
    let concatenation = outputs.join(" ");

    let mut aggregator = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Aggregator,
        "Verify gradient order and concatenate the colors.",
        String::new(),
        max_tokens,
        Some(spawner_id),
    );
    if verified {
        subagent::complete_locally(&mut aggregator, concatenation.clone(), true);
    } else {
        subagent::complete_locally(
            &mut aggregator,
            format!("gradient order check failed: {}", concatenation),
            false,
        );
    }
    let agg_idx = state.push_task(aggregator)?;
    state.emit_spawn(agg_idx).await;
    state.emit_complete(agg_idx).await;
    state.persist_head().await;

    let quality = if verified { 1.0 } else { 0.3 };
    Ok(state.results(concatenation, quality))
}

/// Generic plan: classifier, router, parallel executors, evaluator,
/// coordinator.
async fn run_generic(
    state: &mut RunState,
    executor_count: u32,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<CovenantResults, OrchestratorError> {
    let max_tokens = state.max_tokens();
    let intent = state.covenant.intent.clone();

    // Classifier.
    cancelled(cancel_rx)?;
    let classifier = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Classifier,
        intent.clone(),
        state.pick_model(SubAgentRole::Classifier)?,
        512,
        None,
    );
    let classifier_idx = state.push_task(classifier)?;
    state.emit_spawn(classifier_idx).await;
    let ctx = state.parent_context(None, Vec::new());
    state.run_task(classifier_idx, ctx).await;
    let classifier_out = state.output_text(classifier_idx);
    let classifier_id = state.tasks[classifier_idx].id.clone();

    // Router.
    cancelled(cancel_rx)?;
    let router = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Router,
        intent.clone(),
        state.pick_model(SubAgentRole::Router)?,
        512,
        Some(classifier_id),
    );
    let router_idx = state.push_task(router)?;
    state.emit_spawn(router_idx).await;
    let ctx = state.parent_context(None, vec![classifier_out.clone()]);
    state.run_task(router_idx, ctx).await;
    let router_out = state.output_text(router_idx);
    let router_id = state.tasks[router_idx].id.clone();

    // Parallel executors.  A failing branch is absorbed: the evaluator sees
    // its error placeholder instead of aborting the batch.
    cancelled(cancel_rx)?;
    let executor_model = state.pick_model(SubAgentRole::Executor)?;
    let deadline = state.covenant.constraints.call_deadline_ms();
    let mut handles = Vec::with_capacity(executor_count as usize);
    for branch in 0..executor_count {
        let mut task = SubAgentTask::new(
            state.covenant.id.clone(),
            SubAgentRole::Executor,
            intent.clone(),
            executor_model.clone(),
            max_tokens,
            Some(router_id.clone()),
        );
        task.thoughts.push(format!("branch {}", branch));
        state
            .bus
            .publish(ServerEvent::AgentSpawn {
                covenant_id: state.covenant.id.clone(),
                agent_id: task.id.clone(),
                role: task.role.to_string(),
            })
            .await;
        let context = state.parent_context(
            Some(branch),
            vec![classifier_out.clone(), router_out.clone()],
        );
        let client = Arc::clone(&state.client);
        let bus = state.bus.clone();
        let covenant_id = state.covenant.id.clone();
        handles.push(tokio::spawn(async move {
            bus.publish(ServerEvent::AgentProgress {
                covenant_id: covenant_id.clone(),
                agent_id: task.id.clone(),
                progress: 10,
                thought: Some(format!("branch {} running", branch)),
            })
            .await;
            subagent::run(&mut task, client.as_ref(), &context, deadline).await;
            bus.publish(ServerEvent::AgentComplete {
                covenant_id,
                agent_id: task.id.clone(),
                success: task.status == SubAgentStatus::Completed,
            })
            .await;
            task
        }));
    }

    let mut executor_indices = Vec::with_capacity(executor_count as usize);
    for joined in join_all(handles).await {
        let task = joined.map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        let index = state.push_task(task)?;
        state.record_task_metric(index).await;
        executor_indices.push(index);
    }
    state.persist_head().await;

    let any_executor_succeeded = executor_indices
        .iter()
        .any(|&i| state.tasks[i].status == SubAgentStatus::Completed);
    if !any_executor_succeeded {
        return Err(OrchestratorError::NoExecutorResult);
    }

    let executor_outputs: Vec<String> = executor_indices
        .iter()
        .map(|&i| state.output_text(i))
        .collect();

    // Evaluator.  Failure degrades to the default quality.
    cancelled(cancel_rx)?;
    let evaluator = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Evaluator,
        intent.clone(),
        state.pick_model(SubAgentRole::Evaluator)?,
        1024,
        Some(router_id.clone()),
    );
    let evaluator_idx = state.push_task(evaluator)?;
    state.emit_spawn(evaluator_idx).await;
    let ctx = state.parent_context(None, executor_outputs.clone());
    state.run_task(evaluator_idx, ctx).await;
    let quality = if state.tasks[evaluator_idx].status == SubAgentStatus::Completed {
        extract_score(&state.output_text(evaluator_idx)).unwrap_or(0.5)
    } else {
        0.5
    };

    // Coordinator.  Its output is the authoritative content; if it fails, the
    // executor branches are joined verbatim so the user still gets substance.
    cancelled(cancel_rx)?;
    let coordinator = SubAgentTask::new(
        state.covenant.id.clone(),
        SubAgentRole::Coordinator,
        intent,
        state.pick_model(SubAgentRole::Coordinator)?,
        max_tokens,
        Some(router_id),
    );
    let coordinator_idx = state.push_task(coordinator)?;
    state.emit_spawn(coordinator_idx).await;
    let mut previous = executor_outputs;
    previous.push(state.output_text(evaluator_idx));
    let ctx = state.parent_context(None, previous);
    state.run_task(coordinator_idx, ctx).await;

    let content = if state.tasks[coordinator_idx].status == SubAgentStatus::Completed {
        state.output_text(coordinator_idx)
    } else {
        executor_indices
            .iter()
            .filter(|&&i| state.tasks[i].status == SubAgentStatus::Completed)
            .map(|&i| state.output_text(i))
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    Ok(state.results(content, quality))
}
