//! Chat-completion client for the unified LLM gateway.
//!
//! Every upstream provider sits behind a single OpenAI-compatible endpoint at
//! `{base}/compat/chat/completions`; provider routing is inferred from the
//! `provider/` prefix of the model id, and a single bearer token authenticates
//! the gateway.  No per-provider key is handled here.
//!
//! # Key behaviours
//!
//! - **Hard deadline**: every call honours [`CallParams::timeout_ms`].
//! - **One transparent retry** on transient transport failure (timeout, 5xx);
//!   never on 4xx.
//! - **Empty content is a failure**: a 200 with a null choice is surfaced as
//!   [`ProviderError::EmptyContent`] so the router can fall over.
//! - **One metric event per call**, delivered to the configured
//!   [`MetricsSink`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::swarmllm::client_wrapper::{
    CallMetric, CallParams, ChatMessage, LogSink, MetricsSink, ProviderClient, ProviderError,
    ProviderResponse, TokenUsage,
};
use crate::swarmllm::clients::common::{get_shared_http_client, ChatRequest, ChatResponse};
use crate::swarmllm::config::SwarmConfig;
use crate::swarmllm::registry::ModelRegistry;

/// Uniform client over the OpenAI-compatible gateway.
pub struct GatewayClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    registry: Arc<ModelRegistry>,
    sink: Arc<dyn MetricsSink>,
}

impl GatewayClient {
    /// Build a client from the gateway settings in `config`, pricing calls
    /// against `registry` and reporting metrics through [`LogSink`].
    pub fn new(config: &SwarmConfig, registry: Arc<ModelRegistry>) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            endpoint: format!(
                "{}/compat/chat/completions",
                config.gateway_base_url.trim_end_matches('/')
            ),
            token: config.gateway_token.clone(),
            registry,
            sink: Arc::new(LogSink),
        }
    }

    /// Replace the metrics sink (builder pattern).
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    async fn post_once(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> Result<(String, TokenUsage, Option<String>), ProviderError> {
        let body = ChatRequest::new(
            model_id,
            messages,
            params.temperature,
            params.max_tokens,
            params.top_p,
        );

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .timeout(Duration::from_millis(params.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(params.timeout_ms)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(detail),
                429 => ProviderError::RateLimited(detail),
                404 => ProviderError::UnsupportedModel(model_id.to_string()),
                400..=499 => ProviderError::BadRequest(detail),
                _ => ProviderError::Transport(format!("gateway returned {}: {}", status, detail)),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(format!("malformed gateway response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::EmptyContent(model_id.to_string()))?;

        let usage = parsed.usage.map(|u| u.into_usage()).unwrap_or_default();
        Ok((content, usage, parsed.model))
    }
}

#[async_trait]
impl ProviderClient for GatewayClient {
    async fn call(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CallParams,
    ) -> Result<ProviderResponse, ProviderError> {
        let started = Instant::now();

        let mut outcome = self.post_once(model_id, messages, params).await;
        if let Err(ref e) = outcome {
            if e.is_transient() {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("transient failure on {}, retrying once: {}", model_id, e);
                }
                outcome = self.post_once(model_id, messages, params).await;
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((content, usage, effective)) => {
                let cost_usd = self.registry.price(model_id, &usage);
                self.sink
                    .record(&CallMetric {
                        model_id: model_id.to_string(),
                        latency_ms,
                        cost_usd,
                        success: true,
                        ts: Utc::now(),
                    })
                    .await;
                Ok(ProviderResponse {
                    content,
                    usage,
                    latency_ms,
                    model_id_effective: effective.unwrap_or_else(|| model_id.to_string()),
                })
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("gateway call failed model={} kind={}: {}", model_id, e.kind(), e);
                }
                self.sink
                    .record(&CallMetric {
                        model_id: model_id.to_string(),
                        latency_ms,
                        cost_usd: 0.0,
                        success: false,
                        ts: Utc::now(),
                    })
                    .await;
                Err(e)
            }
        }
    }
}
