//! Per-actor event bus.
//!
//! Each mediator and each orchestrator owns one logical duplex channel to its
//! connected clients.  Server-to-client traffic is the [`ServerEvent`]
//! discriminated union; client-to-server traffic is [`ClientCommand`].  Both
//! serialize with a `type` tag so an external WebSocket layer can relay frames
//! verbatim.
//!
//! # Guarantees
//!
//! - **Per-connection FIFO**: each subscriber sees events in publish order.
//! - **Snapshot before live**: a subscriber attaching mid-run receives a
//!   single synthesized [`ServerEvent::CovenantUpdate`] with the current head
//!   before any live event.
//! - **Bounded buffers with progress coalescing**: when a subscriber's queue
//!   is full, the oldest unsent *progress* event is dropped to make room;
//!   status and terminal events are never dropped.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::event::{EventBus, ServerEvent};
//!
//! # async {
//! let bus = EventBus::new();
//! let sub = bus.subscribe().await;
//!
//! bus.publish(ServerEvent::TaskStart { covenant_id: "c1".into() }).await;
//! let ev = sub.recv().await;
//! println!("{:?}", ev);
//! # };
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, Notify};

use crate::swarmllm::covenant::{Constraints, Covenant, CovenantResults};

/// Default per-subscriber queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Server-to-client event kinds.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full current covenant head.  Also the synthesized snapshot an attaching
    /// client receives first.
    CovenantUpdate { covenant: Covenant },
    /// Coarse phase/liveness notice.  `covenant_id` is absent for
    /// notices that are not tied to a covenant (e.g. an analyze reply).
    StatusChange {
        covenant_id: Option<String>,
        phase: String,
        detail: Option<String>,
    },
    /// The mediator handed the covenant to an orchestrator.
    DelegationStarted { covenant_id: String },
    /// The orchestrator called back and the mediator finished processing.
    DelegationComplete { covenant_id: String },
    /// The orchestrator accepted its task.
    TaskStart { covenant_id: String },
    /// A sub-agent task was created.
    AgentSpawn {
        covenant_id: String,
        agent_id: String,
        role: String,
    },
    /// A sub-agent reported progress.
    AgentProgress {
        covenant_id: String,
        agent_id: String,
        progress: u8,
        thought: Option<String>,
    },
    /// A sub-agent reached a terminal status.
    AgentComplete {
        covenant_id: String,
        agent_id: String,
        success: bool,
    },
    /// The orchestrator finished executing and aggregating.
    TaskComplete { covenant_id: String },
    /// The covenant completed and carries results.
    Completed {
        covenant_id: String,
        results: CovenantResults,
    },
    /// The quality gate declined the results.
    Rejected {
        covenant_id: String,
        reason: String,
        quality: f64,
    },
    /// A terminal error; `reason` is machine-readable, `message` human-readable.
    Error {
        covenant_id: Option<String>,
        reason: String,
        message: String,
    },
}

impl ServerEvent {
    /// Whether the event may be coalesced away under backpressure.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, ServerEvent::AgentProgress { .. })
    }

    /// Whether the event terminates a covenant's stream segment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::Completed { .. } | ServerEvent::Rejected { .. } | ServerEvent::Error { .. }
        )
    }
}

/// Client-to-server command kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Submit an intent; equivalent to the `POST /intent` surface.
    CreateCovenant {
        intent: String,
        #[serde(default)]
        constraints: Option<Constraints>,
    },
    /// Classify an intent without creating a covenant.  The classification is
    /// broadcast as a `status_change` notice.
    Analyze { intent: String },
    /// Force delegation of the current active covenant.
    Delegate { covenant_id: String },
    /// Cancel a covenant; it transitions to `failed` with reason `cancelled`.
    Cancel { covenant_id: String },
}

struct SubQueue {
    buf: Mutex<VecDeque<ServerEvent>>,
    notify: Notify,
    capacity: usize,
}

impl SubQueue {
    async fn push(&self, event: ServerEvent) {
        let mut buf = self.buf.lock().await;
        if buf.len() >= self.capacity {
            // Make room by coalescing the oldest progress event; status and
            // terminal events are never dropped, so the queue may exceed its
            // capacity when nothing is coalescable.
            if let Some(pos) = buf.iter().position(|e| e.is_coalescable()) {
                buf.remove(pos);
            } else if event.is_coalescable() {
                return;
            }
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }
}

/// A live attachment to an [`EventBus`].  Dropping it detaches the client;
/// in-flight actor work is unaffected.
pub struct Subscription {
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Receive the next event, waiting if none is queued.
    pub async fn recv(&self) -> ServerEvent {
        loop {
            {
                let mut buf = self.queue.buf.lock().await;
                if let Some(event) = buf.pop_front() {
                    return event;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Receive the next event if one is already queued.
    pub async fn try_recv(&self) -> Option<ServerEvent> {
        self.queue.buf.lock().await.pop_front()
    }

    /// Number of events currently queued.
    pub async fn len(&self) -> usize {
        self.queue.buf.lock().await.len()
    }

    /// Whether the queue is currently empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct BusInner {
    snapshot: Option<Covenant>,
    subscribers: Vec<Weak<SubQueue>>,
}

/// Per-actor broadcast hub with snapshot replay.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    capacity: usize,
}

impl EventBus {
    /// A bus with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// A bus with an explicit per-subscriber capacity.  Mostly useful for
    /// exercising the coalescing policy.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                snapshot: None,
                subscribers: Vec::new(),
            })),
            capacity: capacity.max(2),
        }
    }

    /// Replace the head snapshot replayed to attaching clients.
    pub async fn set_snapshot(&self, covenant: Covenant) {
        self.inner.lock().await.snapshot = Some(covenant);
    }

    /// Attach a client.  The current head (when one exists) is enqueued as a
    /// synthesized `covenant_update` before any live event can arrive.
    pub async fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubQueue {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
        });
        let mut inner = self.inner.lock().await;
        if let Some(head) = inner.snapshot.clone() {
            queue
                .push(ServerEvent::CovenantUpdate { covenant: head })
                .await;
        }
        inner.subscribers.push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Broadcast an event to every live subscriber, in FIFO order per
    /// subscriber.  A `covenant_update` also refreshes the snapshot.
    ///
    /// The bus lock is held across the fan-out so concurrent publishers
    /// cannot interleave differently on different connections.
    pub async fn publish(&self, event: ServerEvent) {
        let mut inner = self.inner.lock().await;
        if let ServerEvent::CovenantUpdate { covenant } = &event {
            inner.snapshot = Some(covenant.clone());
        }
        let mut live = Vec::new();
        inner.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                live.push(queue);
                true
            }
            None => false,
        });
        for queue in live {
            queue.push(event.clone()).await;
        }
    }

    /// Number of currently attached clients.
    pub async fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|weak| weak.strong_count() > 0);
        inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
