//! Shared plumbing for the gateway client.
//!
//! Provides a tuned [`reqwest`] client with persistent connection pooling and
//! the OpenAI-compatible wire schema the gateway speaks.  Everything here is
//! transport-shaped; the error taxonomy and retry policy live in
//! [`gateway`](crate::clients::gateway).

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::swarmllm::client_wrapper::{ChatMessage, Role, TokenUsage};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm, which
    /// matters when a swarm issues many concurrent requests at the gateway.
    /// Per-call deadlines are applied per request; the client itself carries
    /// only a connect timeout.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Wire tag for a conversation role.
pub fn role_tag(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[derive(Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

/// OpenAI-compatible chat-completion request body.
#[derive(Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<WireMessage<'a>>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(
        model: &'a str,
        messages: &'a [ChatMessage],
        temperature: f32,
        max_tokens: u32,
        top_p: Option<f32>,
    ) -> Self {
        Self {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: role_tag(m.role),
                    content: m.content.as_ref(),
                })
                .collect(),
            temperature,
            max_tokens,
            top_p,
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    pub usage: Option<WireUsage>,
    pub model: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChoiceMessage,
}

#[derive(Deserialize)]
pub(crate) struct ChoiceMessage {
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl WireUsage {
    pub fn into_usage(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
        }
    }
}
