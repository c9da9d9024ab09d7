//! Shared primitives for the provider-agnostic gateway client.
//!
//! The core talks to every upstream model through the [`ProviderClient`] trait and the
//! lightweight data types defined in this module.  The trait abstracts over the concrete
//! gateway transport while the supporting structs describe chat messages, call parameters,
//! and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use swarmllm::client_wrapper::{CallParams, ChatMessage, ProviderClient};
//! use swarmllm::clients::gateway::GatewayClient;
//! use swarmllm::config::SwarmConfig;
//! use swarmllm::registry::ModelRegistry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SwarmConfig::from_env()?;
//!     let client = GatewayClient::new(&config, Arc::new(ModelRegistry::builtin()));
//!
//!     let response = client
//!         .call(
//!             "openai/gpt-4.1-mini",
//!             &[ChatMessage::user("Who are you?")],
//!             &CallParams::default(),
//!         )
//!         .await?;
//!
//!     println!("Assistant: {}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Represents the possible roles for a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (frequently a mirror of a human end-user request).
    User,
    /// An assistant authored message (model responses).
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single chat message sent to (or received from) a model.
///
/// The body is stored as `Arc<str>` so that prompt assemblies can be cheaply
/// cloned across sub-agent tasks.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: Arc<str>,
}

impl ChatMessage {
    /// Create a system-role message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::System,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Create a user-role message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::User,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Create an assistant-role message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self {
            role: Role::Assistant,
            content: Arc::from(content.as_ref()),
        }
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the gateway.
    pub prompt_tokens: u64,
    /// Number of generated/output tokens billed by the gateway.
    pub completion_tokens: u64,
}

impl TokenUsage {
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Sampling and budget parameters carried by a single provider call.
#[derive(Debug, Clone)]
pub struct CallParams {
    /// Sampling temperature forwarded to the model.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Optional nucleus-sampling cutoff.
    pub top_p: Option<f32>,
    /// Hard deadline for the round trip, in milliseconds.  Callers derive this
    /// as `min(constraints.max_latency_ms, 30_000)`.
    pub timeout_ms: u64,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            top_p: None,
            timeout_ms: 30_000,
        }
    }
}

/// The uniform result shape of a successful provider call.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Aggregated assistant content.
    pub content: String,
    /// Token accounting reported by the gateway, zeroed when absent.
    pub usage: TokenUsage,
    /// Wall-clock round-trip time.
    pub latency_ms: u64,
    /// The model that actually served the request (the gateway may substitute
    /// a snapshot alias for the requested id).
    pub model_id_effective: String,
}

/// Failure kinds surfaced by a provider call.
///
/// The distinction matters to the smart router: every kind except
/// [`BadRequest`](ProviderError::BadRequest) is eligible for cascading
/// fallback, and only [`Timeout`](ProviderError::Timeout) /
/// [`Transport`](ProviderError::Transport) earn the single transparent retry
/// inside the gateway client.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The gateway rejected the bearer token.
    Auth(String),
    /// The gateway returned 429.
    RateLimited(String),
    /// The requested model id is not served by the gateway.
    UnsupportedModel(String),
    /// The request itself was malformed (any other 4xx).
    BadRequest(String),
    /// The hard per-call deadline elapsed.
    Timeout(u64),
    /// Connection-level failure or a 5xx from the gateway.
    Transport(String),
    /// The gateway answered 200 but the choice carried no content.  Treated as
    /// a failure so the router can fall over to the next candidate.
    EmptyContent(String),
}

impl ProviderError {
    /// Stable machine-readable tag for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::UnsupportedModel(_) => "unsupported_model",
            ProviderError::BadRequest(_) => "bad_request",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Transport(_) => "transport",
            ProviderError::EmptyContent(_) => "empty_content",
        }
    }

    /// Whether the gateway client may transparently retry the call once.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Transport(_))
    }

    /// Whether the error kind aborts a router cascade instead of falling over.
    ///
    /// A malformed request fails identically on every candidate, so retrying
    /// it against other models only burns budget.
    pub fn aborts_cascade(&self) -> bool {
        matches!(self, ProviderError::BadRequest(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(detail) => write!(f, "gateway auth rejected: {}", detail),
            ProviderError::RateLimited(detail) => write!(f, "rate limited: {}", detail),
            ProviderError::UnsupportedModel(id) => write!(f, "unsupported model: {}", id),
            ProviderError::BadRequest(detail) => write!(f, "bad request: {}", detail),
            ProviderError::Timeout(ms) => write!(f, "provider call timed out after {} ms", ms),
            ProviderError::Transport(detail) => write!(f, "transport failure: {}", detail),
            ProviderError::EmptyContent(model) => {
                write!(f, "model {} returned empty content", model)
            }
        }
    }
}

impl Error for ProviderError {}

/// One metric event, emitted per provider call.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetric {
    /// The model that was asked to serve the request.
    pub model_id: String,
    /// Round-trip time.
    pub latency_ms: u64,
    /// Priced cost of the call, zero when the model is unknown to the registry.
    pub cost_usd: f64,
    /// Whether the call produced usable content.
    pub success: bool,
    /// When the call finished.
    pub ts: DateTime<Utc>,
}

/// Trait for receiving per-call metric events.
///
/// The `Send + Sync` bound allows the sink to be shared across actors via
/// `Arc<dyn MetricsSink>`.  The default sink is [`LogSink`].
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Called once after every provider call, success or failure.
    async fn record(&self, metric: &CallMetric);
}

/// Metrics sink that forwards events to the `log` facade at info level.
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn record(&self, metric: &CallMetric) {
        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "provider call model={} latency_ms={} cost_usd={:.6} success={}",
                metric.model_id,
                metric.latency_ms,
                metric.cost_usd,
                metric.success
            );
        }
    }
}

/// Trait-driven abstraction over the chat-completion gateway.
///
/// The production implementation is
/// [`GatewayClient`](crate::clients::gateway::GatewayClient); tests substitute
/// scripted implementations.  Implementations **must** be thread-safe
/// (`Send + Sync`) so they can be shared between actors.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send one chat-completion request to the given model.
    ///
    /// The `messages` slice must include any system priming message the caller
    /// wishes to send.  Implementations are responsible for honouring
    /// [`CallParams::timeout_ms`] as a hard deadline and for performing at most
    /// one transparent retry on transient transport failures.
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> Result<ProviderResponse, ProviderError>;
}
