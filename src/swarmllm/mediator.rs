//! Per-user mediator actor.
//!
//! One long-lived mediator exists per user.  It ingests intents, scores their
//! complexity, owns the covenant lifecycle and the user's message log, and
//! decides between the fast path (one direct smart-router call) and delegation
//! to an orchestrator swarm.  When a delegated run calls back, the mediator
//! applies the quality gate before anything reaches the user's log.
//!
//! The actor is logically single-threaded: commands and the orchestrator
//! callback serialize through one `select` loop, so two mutations of the same
//! covenant can never interleave.
//!
//! # Delegation decision
//!
//! An intent is delegated when its classified complexity is not `simple` or
//! its score exceeds 0.4; everything else resolves on the fast path.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::swarmllm::client_wrapper::{CallParams, ChatMessage, ProviderClient, Role};
use crate::swarmllm::config::SwarmConfig;
use crate::swarmllm::covenant::{
    CallbackHandle, CompletionPayload, Constraints, Covenant, CovenantResults, CovenantState,
    MediatorContext, StoredMessage, ValidationError, PerformanceCounters,
};
use crate::swarmllm::event::{ClientCommand, EventBus, ServerEvent, Subscription};
use crate::swarmllm::orchestrator::OrchestratorHandle;
use crate::swarmllm::registry::ModelRegistry;
use crate::swarmllm::router::{self, classify, Classification, Complexity, RouterError};
use crate::swarmllm::store::{CovenantStore, StoreError};

const FAST_PATH_PROMPT: &str =
    "You are a capable assistant. Answer the user's request directly and concisely.";

/// Errors surfaced by mediator operations.
#[derive(Debug)]
pub enum MediatorError {
    /// The intent or its constraints failed validation.
    Validation(ValidationError),
    /// The fast path exhausted or aborted its candidate cascade.
    Router(RouterError),
    /// The durable store refused a write.
    Store(StoreError),
    /// The actor task is no longer running.
    ActorGone,
    /// Anything unexpected.
    Internal(String),
}

impl fmt::Display for MediatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediatorError::Validation(e) => write!(f, "validation failed: {}", e),
            MediatorError::Router(e) => write!(f, "routing failed: {}", e),
            MediatorError::Store(e) => write!(f, "store failed: {}", e),
            MediatorError::ActorGone => write!(f, "mediator actor is not running"),
            MediatorError::Internal(d) => write!(f, "internal mediator error: {}", d),
        }
    }
}

impl Error for MediatorError {}

impl From<ValidationError> for MediatorError {
    fn from(e: ValidationError) -> Self {
        MediatorError::Validation(e)
    }
}

impl From<StoreError> for MediatorError {
    fn from(e: StoreError) -> Self {
        MediatorError::Store(e)
    }
}

impl From<RouterError> for MediatorError {
    fn from(e: RouterError) -> Self {
        MediatorError::Router(e)
    }
}

/// Read-only mediator snapshot.
#[derive(Debug, Clone)]
pub struct MediatorStatus {
    /// The current covenant head, if any intent was ever submitted.
    pub covenant_head: Option<Covenant>,
    /// Rolling performance counters from the durable store.
    pub performance: PerformanceCounters,
}

/// Seam through which a mediator obtains orchestrator actors.
///
/// Production wiring is provided by [`SwarmHost`](crate::host::SwarmHost);
/// tests substitute counting or failing spawners.
#[async_trait]
pub trait OrchestratorSpawner: Send + Sync {
    /// Create (or address) the orchestrator actor for `covenant` and hand it
    /// the context and callback.  Must be called at most once per covenant.
    async fn spawn_orchestrator(
        &self,
        covenant: Covenant,
        context: MediatorContext,
        callback: CallbackHandle,
    ) -> OrchestratorHandle;
}

/// Everything a mediator needs to run.
pub struct MediatorSeed {
    pub user_id: String,
    pub config: SwarmConfig,
    pub registry: Arc<ModelRegistry>,
    pub client: Arc<dyn ProviderClient>,
    pub spawner: Arc<dyn OrchestratorSpawner>,
    pub store_path: PathBuf,
}

enum MediatorMsg {
    SubmitIntent {
        intent: String,
        constraints: Option<Constraints>,
        reply: oneshot::Sender<Result<Covenant, MediatorError>>,
    },
    Status {
        reply: oneshot::Sender<MediatorStatus>,
    },
    OpenStream {
        reply: oneshot::Sender<Subscription>,
    },
    Command(ClientCommand),
    Deadline {
        covenant_id: String,
    },
}

/// Cloneable, location-independent reference to a running mediator.
#[derive(Clone)]
pub struct MediatorHandle {
    user_id: String,
    tx: mpsc::Sender<MediatorMsg>,
    bus: EventBus,
}

impl MediatorHandle {
    /// The user this mediator serves.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Submit an intent.  Returns once the covenant is terminal (fast path) or
    /// delegated; delegated covenants resolve later through the event stream.
    pub async fn submit_intent(
        &self,
        intent: impl Into<String>,
        constraints: Option<Constraints>,
    ) -> Result<Covenant, MediatorError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(MediatorMsg::SubmitIntent {
                intent: intent.into(),
                constraints,
                reply,
            })
            .await
            .map_err(|_| MediatorError::ActorGone)?;
        reply_rx.await.map_err(|_| MediatorError::ActorGone)?
    }

    /// Read-only snapshot of the head and performance counters.
    pub async fn status(&self) -> Result<MediatorStatus, MediatorError> {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(MediatorMsg::Status { reply })
            .await
            .map_err(|_| MediatorError::ActorGone)?;
        reply_rx.await.map_err(|_| MediatorError::ActorGone)
    }

    /// Attach a client to the event bus.  The current covenant head is
    /// replayed as an initial snapshot before any live event.  Attachment is
    /// serialized through the actor so it cannot race head recovery on wake.
    pub async fn open_stream(&self) -> Subscription {
        let (reply, reply_rx) = oneshot::channel();
        if self.tx.send(MediatorMsg::OpenStream { reply }).await.is_ok() {
            if let Ok(subscription) = reply_rx.await {
                return subscription;
            }
        }
        self.bus.subscribe().await
    }

    /// Deliver a client command (create/analyze/delegate/cancel).  Outcomes
    /// are broadcast on the event bus rather than returned.
    pub async fn command(&self, command: ClientCommand) -> Result<(), MediatorError> {
        self.tx
            .send(MediatorMsg::Command(command))
            .await
            .map_err(|_| MediatorError::ActorGone)
    }
}

/// Spawn the mediator actor for one user.
pub fn spawn(seed: MediatorSeed) -> MediatorHandle {
    let (tx, rx) = mpsc::channel::<MediatorMsg>(32);
    let (callback_tx, callback_rx) = mpsc::channel::<CompletionPayload>(8);
    let bus = EventBus::new();

    let handle = MediatorHandle {
        user_id: seed.user_id.clone(),
        tx: tx.clone(),
        bus: bus.clone(),
    };

    tokio::spawn(actor_main(
        seed,
        rx,
        callback_rx,
        callback_tx,
        tx.downgrade(),
        bus,
    ));

    handle
}

struct Delegation {
    covenant_id: String,
    handle: OrchestratorHandle,
    monitor: JoinHandle<()>,
    deadline: JoinHandle<()>,
}

impl Delegation {
    fn abort_watchers(&self) {
        self.monitor.abort();
        self.deadline.abort();
    }
}

struct MediatorActor {
    user_id: String,
    config: SwarmConfig,
    registry: Arc<ModelRegistry>,
    client: Arc<dyn ProviderClient>,
    spawner: Arc<dyn OrchestratorSpawner>,
    store: CovenantStore,
    bus: EventBus,
    head: Option<Covenant>,
    delegation: Option<Delegation>,
    callback_tx: mpsc::Sender<CompletionPayload>,
    // Weak so the actor can shut down once every external handle is dropped.
    self_tx: mpsc::WeakSender<MediatorMsg>,
}

async fn actor_main(
    seed: MediatorSeed,
    mut rx: mpsc::Receiver<MediatorMsg>,
    mut callback_rx: mpsc::Receiver<CompletionPayload>,
    callback_tx: mpsc::Sender<CompletionPayload>,
    self_tx: mpsc::WeakSender<MediatorMsg>,
    bus: EventBus,
) {
    let store = match CovenantStore::open(&seed.store_path).await {
        Ok(store) => store,
        Err(e) => {
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "mediator for {} cannot open store at {:?}: {}",
                    seed.user_id,
                    seed.store_path,
                    e
                );
            }
            return;
        }
    };

    let mut actor = MediatorActor {
        user_id: seed.user_id,
        config: seed.config,
        registry: seed.registry,
        client: seed.client,
        spawner: seed.spawner,
        store,
        bus,
        head: None,
        delegation: None,
        callback_tx,
        self_tx,
    };

    // Wake with the last persisted head so reconnecting clients replay it.
    match actor.store.get_head::<Covenant>().await {
        Ok(Some(head)) => {
            actor.bus.set_snapshot(head.clone()).await;
            actor.head = Some(head);
        }
        Ok(None) => {}
        Err(e) => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("mediator {} head reload failed: {}", actor.user_id, e);
            }
        }
    }

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => actor.handle_msg(msg).await,
                None => break,
            },
            Some(payload) = callback_rx.recv() => actor.handle_callback(payload).await,
        }
    }
}

impl MediatorActor {
    async fn handle_msg(&mut self, msg: MediatorMsg) {
        match msg {
            MediatorMsg::SubmitIntent {
                intent,
                constraints,
                reply,
            } => {
                let result = self.submit_intent(intent, constraints).await;
                let _ = reply.send(result);
            }
            MediatorMsg::Status { reply } => {
                let performance = match self.store.performance().await {
                    Ok(p) => p,
                    Err(e) => {
                        if log::log_enabled!(log::Level::Warn) {
                            log::warn!("performance query failed: {}", e);
                        }
                        PerformanceCounters::default()
                    }
                };
                let _ = reply.send(MediatorStatus {
                    covenant_head: self.head.clone(),
                    performance,
                });
            }
            MediatorMsg::OpenStream { reply } => {
                let _ = reply.send(self.bus.subscribe().await);
            }
            MediatorMsg::Command(command) => self.handle_command(command).await,
            MediatorMsg::Deadline { covenant_id } => self.handle_deadline(covenant_id).await,
        }
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::CreateCovenant {
                intent,
                constraints,
            } => {
                // Outcome travels over the bus; stream clients have no reply slot.
                let _ = self.submit_intent(intent, constraints).await;
            }
            ClientCommand::Analyze { intent } => {
                let classification = classify(&intent);
                let detail = serde_json::to_string(&classification).unwrap_or_default();
                self.bus
                    .publish(ServerEvent::StatusChange {
                        covenant_id: None,
                        phase: "analyzed".to_string(),
                        detail: Some(detail),
                    })
                    .await;
            }
            ClientCommand::Delegate { covenant_id } => {
                let covenant = match &self.head {
                    Some(c) if c.id == covenant_id && c.state == CovenantState::Active => c.clone(),
                    _ => {
                        self.publish_error(
                            Some(covenant_id),
                            "validation",
                            "no active covenant with that id",
                        )
                        .await;
                        return;
                    }
                };
                let classification = classify(&covenant.intent);
                if let Err(e) = self.delegate(covenant, &classification).await {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("forced delegation failed: {}", e);
                    }
                }
            }
            ClientCommand::Cancel { covenant_id } => self.handle_cancel(covenant_id).await,
        }
    }

    async fn submit_intent(
        &mut self,
        intent: String,
        constraints: Option<Constraints>,
    ) -> Result<Covenant, MediatorError> {
        let intent = intent.trim().to_string();
        if intent.is_empty() {
            self.publish_error(None, "validation", "intent must not be empty")
                .await;
            return Err(ValidationError::EmptyIntent.into());
        }
        let constraints = constraints.unwrap_or_default();
        if let Err(e) = constraints.validate() {
            self.publish_error(None, "validation", &e.to_string()).await;
            return Err(e.into());
        }

        let mut covenant = Covenant::new(self.user_id.clone(), intent.clone(), constraints);
        self.store
            .append_message(&StoredMessage::new(
                Some(covenant.id.clone()),
                Role::User,
                intent.clone(),
            ))
            .await?;
        self.commit(&covenant).await?;

        let classification = classify(&intent);
        covenant.append_decision(format!(
            "classified {} (score {:.2}; factors: {})",
            classification.complexity,
            classification.score,
            if classification.factors.is_empty() {
                "none".to_string()
            } else {
                classification.factors.join(", ")
            }
        ));
        covenant
            .advance(CovenantState::Active)
            .map_err(|e| MediatorError::Internal(e.to_string()))?;
        self.commit(&covenant).await?;

        let needs_swarm =
            classification.complexity != Complexity::Simple || classification.score > 0.4;
        if needs_swarm {
            self.delegate(covenant, &classification).await
        } else {
            self.fast_path(covenant, &classification).await
        }
    }

    /// Resolve a simple covenant with one routed call, no orchestrator.
    async fn fast_path(
        &mut self,
        mut covenant: Covenant,
        classification: &Classification,
    ) -> Result<Covenant, MediatorError> {
        covenant.append_decision("fast path: single routed call".to_string());

        let score = classification.score;
        let max_tokens = covenant
            .constraints
            .max_tokens
            .unwrap_or_else(|| self.config.tokens_for_score(score));
        let timeout_ms = self
            .config
            .latency_for_score(score)
            .min(covenant.constraints.call_deadline_ms());
        let params = CallParams {
            temperature: 0.7,
            max_tokens,
            top_p: None,
            timeout_ms,
        };

        let candidates = router::plan(&self.registry, &covenant.constraints, classification);
        let messages = [
            ChatMessage::system(FAST_PATH_PROMPT),
            ChatMessage::user(&covenant.intent),
        ];

        match router::execute(self.client.as_ref(), &messages, &params, &candidates).await {
            Ok(routed) => {
                let cost = self
                    .registry
                    .price(&routed.model_id, &routed.response.usage);
                self.store
                    .append_message(&StoredMessage::new(
                        Some(covenant.id.clone()),
                        Role::Assistant,
                        routed.response.content.clone(),
                    ))
                    .await?;
                self.store
                    .record_metric(
                        Some(&covenant.id),
                        routed.response.latency_ms,
                        cost,
                        true,
                    )
                    .await?;
                covenant.append_decision(format!(
                    "resolved by {} after {} attempt(s)",
                    routed.model_id, routed.attempts
                ));
                let results = CovenantResults {
                    content: routed.response.content,
                    quality: 1.0,
                    cost_usd: cost,
                    latency_ms: routed.response.latency_ms,
                    sub_agent_count: 0,
                    used_fallback: routed.used_fallback,
                    error: None,
                };
                covenant.results = Some(results.clone());
                covenant
                    .advance(CovenantState::Completed)
                    .map_err(|e| MediatorError::Internal(e.to_string()))?;
                self.commit(&covenant).await?;
                self.bus
                    .publish(ServerEvent::Completed {
                        covenant_id: covenant.id.clone(),
                        results,
                    })
                    .await;
                Ok(covenant)
            }
            Err(e) => {
                if let Err(se) = self
                    .store
                    .record_metric(Some(&covenant.id), 0, 0.0, false)
                    .await
                {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("failure metric row failed: {}", se);
                    }
                }
                covenant.set_reason(e.kind(), e.to_string());
                covenant
                    .advance(CovenantState::Failed)
                    .map_err(|ie| MediatorError::Internal(ie.to_string()))?;
                self.commit(&covenant).await?;
                self.publish_error(Some(covenant.id.clone()), e.kind(), &e.to_string())
                    .await;
                Err(e.into())
            }
        }
    }

    /// Hand the covenant to an orchestrator swarm and start the watchers.
    async fn delegate(
        &mut self,
        mut covenant: Covenant,
        classification: &Classification,
    ) -> Result<Covenant, MediatorError> {
        covenant.append_decision(format!(
            "delegating to orchestrator swarm (complexity {})",
            classification.complexity
        ));
        covenant.orchestration_plan = Some(format!(
            "swarm delegation (complexity {}, score {:.2})",
            classification.complexity, classification.score
        ));

        let context = MediatorContext {
            user_id: self.user_id.clone(),
            recent_messages: self
                .store
                .recent_messages(self.config.context_window_messages)
                .await?,
            performance: self.store.performance().await?,
        };
        let callback = CallbackHandle::new(self.callback_tx.clone());
        let handle = self
            .spawner
            .spawn_orchestrator(covenant.clone(), context, callback)
            .await;

        covenant
            .advance(CovenantState::Delegated)
            .map_err(|e| MediatorError::Internal(e.to_string()))?;
        self.commit(&covenant).await?;
        self.bus
            .publish(ServerEvent::DelegationStarted {
                covenant_id: covenant.id.clone(),
            })
            .await;

        // Liveness monitor: bounded polling for connected UIs only.  The
        // callback stays the sole authority on completion.
        let monitor = tokio::spawn(monitor_loop(
            handle.clone(),
            self.bus.clone(),
            Duration::from_millis(self.config.mediator_poll_interval_ms),
            self.config.mediator_poll_max_attempts,
        ));

        // Watchdog converting a silent orchestrator into a terminal failure.
        let deadline_ms = covenant.constraints.max_latency_ms
            * u64::from(self.config.orchestrator_timeout_multiplier.max(1))
            + 500;
        let deadline = {
            let weak_tx = self.self_tx.clone();
            let covenant_id = covenant.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(deadline_ms)).await;
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.send(MediatorMsg::Deadline { covenant_id }).await;
                }
            })
        };

        self.delegation = Some(Delegation {
            covenant_id: covenant.id.clone(),
            handle,
            monitor,
            deadline,
        });
        Ok(covenant)
    }

    /// Quality-gate an orchestrator callback.
    async fn handle_callback(&mut self, payload: CompletionPayload) {
        if let Some(delegation) = self.delegation.take() {
            if delegation.covenant_id == payload.covenant_id {
                delegation.abort_watchers();
            } else {
                self.delegation = Some(delegation);
            }
        }

        let mut covenant = match &self.head {
            Some(c) if c.id == payload.covenant_id && c.state == CovenantState::Delegated => {
                c.clone()
            }
            _ => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!(
                        "ignoring callback for {}: not the delegated head",
                        payload.covenant_id
                    );
                }
                return;
            }
        };

        if let Err(e) = self
            .store
            .record_metric(
                Some(&covenant.id),
                payload.results.latency_ms,
                payload.results.cost_usd,
                payload.state == CovenantState::Completed,
            )
            .await
        {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("callback metric row failed: {}", e);
            }
        }

        if payload.state == CovenantState::Failed {
            let reason = payload
                .results
                .error
                .clone()
                .unwrap_or_else(|| "internal".to_string());
            covenant.results = Some(payload.results);
            covenant.set_reason(
                reason.clone(),
                format!("orchestrator run failed: {}", reason),
            );
            if covenant.advance(CovenantState::Failed).is_ok() {
                self.best_effort_commit(&covenant).await;
            }
            self.bus
                .publish(ServerEvent::DelegationComplete {
                    covenant_id: covenant.id.clone(),
                })
                .await;
            self.publish_error(
                Some(covenant.id.clone()),
                &reason,
                "orchestrator run failed",
            )
            .await;
            return;
        }

        let quality = payload.results.quality;
        if quality >= self.config.quality_gate_threshold {
            if let Err(e) = self
                .store
                .append_message(&StoredMessage::new(
                    Some(covenant.id.clone()),
                    Role::Assistant,
                    payload.results.content.clone(),
                ))
                .await
            {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("assistant message persist failed: {}", e);
                }
            }
            covenant.append_decision(format!(
                "quality gate passed ({:.2} >= {:.2})",
                quality, self.config.quality_gate_threshold
            ));
            covenant.results = Some(payload.results.clone());
            if covenant.advance(CovenantState::Completed).is_ok() {
                self.best_effort_commit(&covenant).await;
            }
            self.bus
                .publish(ServerEvent::DelegationComplete {
                    covenant_id: covenant.id.clone(),
                })
                .await;
            self.bus
                .publish(ServerEvent::Completed {
                    covenant_id: covenant.id.clone(),
                    results: payload.results,
                })
                .await;
        } else {
            // Below the gate: no assistant message reaches the user's log.
            covenant.append_decision(format!(
                "quality gate rejected ({:.2} < {:.2})",
                quality, self.config.quality_gate_threshold
            ));
            covenant.results = Some(payload.results);
            covenant.set_reason(
                "quality_below_threshold",
                format!("quality {:.2} is below the gate", quality),
            );
            if covenant.advance(CovenantState::Rejected).is_ok() {
                self.best_effort_commit(&covenant).await;
            }
            self.bus
                .publish(ServerEvent::DelegationComplete {
                    covenant_id: covenant.id.clone(),
                })
                .await;
            self.bus
                .publish(ServerEvent::Rejected {
                    covenant_id: covenant.id.clone(),
                    reason: "quality_below_threshold".to_string(),
                    quality,
                })
                .await;
        }
    }

    async fn handle_deadline(&mut self, covenant_id: String) {
        let mut covenant = match &self.head {
            Some(c) if c.id == covenant_id && c.state == CovenantState::Delegated => c.clone(),
            _ => return,
        };
        if let Some(delegation) = self.delegation.take() {
            delegation.abort_watchers();
            delegation.handle.cancel().await;
        }
        covenant.set_reason(
            "orchestrator_timeout",
            "orchestrator did not call back within the latency budget",
        );
        if covenant.advance(CovenantState::Failed).is_ok() {
            self.best_effort_commit(&covenant).await;
        }
        self.publish_error(
            Some(covenant_id),
            "orchestrator_timeout",
            "orchestrator did not call back within the latency budget",
        )
        .await;
    }

    async fn handle_cancel(&mut self, covenant_id: String) {
        let mut covenant = match &self.head {
            Some(c) if c.id == covenant_id && !c.state.is_terminal() => c.clone(),
            _ => {
                self.publish_error(
                    Some(covenant_id),
                    "validation",
                    "no cancellable covenant with that id",
                )
                .await;
                return;
            }
        };
        if let Some(delegation) = self.delegation.take() {
            delegation.abort_watchers();
            delegation.handle.cancel().await;
        }
        covenant.set_reason("cancelled", "cancelled by client");
        if covenant.advance(CovenantState::Failed).is_ok() {
            self.best_effort_commit(&covenant).await;
        }
        self.publish_error(Some(covenant.id.clone()), "cancelled", "cancelled by client")
            .await;
    }

    /// Persist, refresh the in-memory head, then broadcast the update.
    /// Writes always land before the broadcast.
    async fn commit(&mut self, covenant: &Covenant) -> Result<(), MediatorError> {
        self.store.upsert_covenant(covenant).await?;
        self.store.put_head(covenant).await?;
        self.head = Some(covenant.clone());
        self.bus
            .publish(ServerEvent::CovenantUpdate {
                covenant: covenant.clone(),
            })
            .await;
        Ok(())
    }

    async fn best_effort_commit(&mut self, covenant: &Covenant) {
        if let Err(e) = self.commit(covenant).await {
            if log::log_enabled!(log::Level::Error) {
                log::error!("covenant {} commit failed: {}", covenant.id, e);
            }
        }
    }

    async fn publish_error(&self, covenant_id: Option<String>, reason: &str, message: &str) {
        self.bus
            .publish(ServerEvent::Error {
                covenant_id,
                reason: reason.to_string(),
                message: message.to_string(),
            })
            .await;
    }
}

/// Bounded liveness poll of a delegated orchestrator.  Publishes coarse
/// `status_change` notices so connected UIs see motion; it never mutates the
/// covenant, and completion remains authoritative via the callback.
async fn monitor_loop(
    handle: OrchestratorHandle,
    bus: EventBus,
    interval: Duration,
    max_attempts: u32,
) {
    for attempt in 0..max_attempts {
        tokio::time::sleep(interval).await;
        let phase = handle.status();
        bus.publish(ServerEvent::StatusChange {
            covenant_id: Some(handle.covenant_id().to_string()),
            phase: format!("orchestrator:{}", phase),
            detail: Some(format!("poll {}", attempt + 1)),
        })
        .await;
        if phase.is_terminal() {
            break;
        }
    }
}
