//! Configuration for the orchestration core.
//!
//! Provides the [`SwarmConfig`] struct holding every tunable the core reads.
//! Users construct this manually or via [`SwarmConfig::from_env`]; no
//! config-file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::config::SwarmConfig;
//!
//! // Start from the defaults and point at a gateway.
//! let config = SwarmConfig {
//!     gateway_base_url: "https://gateway.internal".into(),
//!     gateway_token: "token".into(),
//!     ..SwarmConfig::default()
//! };
//! assert_eq!(config.parallel_executor_cap, 5);
//! ```

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Process exit code for a normal shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code when required configuration is missing or invalid.
pub const EXIT_CONFIG: i32 = 64;
/// Process exit code when the durable backing store is unavailable.
pub const EXIT_UNAVAILABLE: i32 = 69;
/// Process exit code for an unrecoverable internal failure.
pub const EXIT_INTERNAL: i32 = 70;

/// Errors raised while assembling or validating configuration.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// `gateway_base_url` is empty and no `SWARMLLM_GATEWAY_URL` was set.
    MissingGatewayUrl,
    /// `gateway_token` is empty and no `SWARMLLM_GATEWAY_TOKEN` was set.
    MissingGatewayToken,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingGatewayUrl => write!(f, "gateway base URL is not configured"),
            ConfigError::MissingGatewayToken => write!(f, "gateway bearer token is not configured"),
        }
    }
}

impl Error for ConfigError {}

/// Every tunable the core reads, with production defaults.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Provider gateway endpoint, e.g. `https://gateway.internal`.  Required
    /// before a [`GatewayClient`](crate::clients::gateway::GatewayClient) can
    /// be built.
    pub gateway_base_url: String,
    /// Bearer token authenticating the gateway.  Required.
    pub gateway_token: String,
    /// Directory where per-actor SQLite files are stored.
    pub state_dir: PathBuf,

    /// Fast-path token budget for simple intents.
    pub default_user_tokens_simple: u32,
    /// Fast-path token budget for moderate intents.
    pub default_user_tokens_moderate: u32,
    /// Fast-path token budget for complex intents.
    pub default_user_tokens_complex: u32,

    /// Upper bound on parallel executor fan-out in a generic plan.
    pub parallel_executor_cap: u32,
    /// Multiplier applied to `max_latency_ms` for the orchestrator's overall
    /// budget and the mediator's callback deadline.
    pub orchestrator_timeout_multiplier: u32,

    /// Interval between mediator liveness polls of a delegated orchestrator.
    pub mediator_poll_interval_ms: u64,
    /// Number of liveness polls before the monitor gives up.  The monitor is
    /// UI plumbing only; completion stays authoritative via the callback.
    pub mediator_poll_max_attempts: u32,

    /// Pacing gap between rainbow color sub-agent starts.  Valid range is
    /// 150..=300 ms; the orchestrator clamps into it.
    pub rainbow_pacing_ms: u64,
    /// Number of trailing user messages forwarded as context on delegation.
    pub context_window_messages: usize,
    /// Approval floor the mediator applies to orchestrator results.
    pub quality_gate_threshold: f64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            gateway_base_url: String::new(),
            gateway_token: String::new(),
            state_dir: PathBuf::from("covenant_state"),
            default_user_tokens_simple: 2048,
            default_user_tokens_moderate: 4096,
            default_user_tokens_complex: 8192,
            parallel_executor_cap: 5,
            orchestrator_timeout_multiplier: 2,
            mediator_poll_interval_ms: 500,
            mediator_poll_max_attempts: 60,
            rainbow_pacing_ms: 150,
            context_window_messages: 5,
            quality_gate_threshold: 0.6,
        }
    }
}

impl SwarmConfig {
    /// Assemble a config from the environment.
    ///
    /// `SWARMLLM_GATEWAY_URL` and `SWARMLLM_GATEWAY_TOKEN` are required;
    /// `SWARMLLM_STATE_DIR` optionally overrides the state directory.  All
    /// other knobs keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.gateway_base_url =
            std::env::var("SWARMLLM_GATEWAY_URL").map_err(|_| ConfigError::MissingGatewayUrl)?;
        config.gateway_token =
            std::env::var("SWARMLLM_GATEWAY_TOKEN").map_err(|_| ConfigError::MissingGatewayToken)?;
        if let Ok(dir) = std::env::var("SWARMLLM_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        config.validate_gateway()?;
        Ok(config)
    }

    /// Check that the gateway settings are present.
    pub fn validate_gateway(&self) -> Result<(), ConfigError> {
        if self.gateway_base_url.trim().is_empty() {
            return Err(ConfigError::MissingGatewayUrl);
        }
        if self.gateway_token.trim().is_empty() {
            return Err(ConfigError::MissingGatewayToken);
        }
        Ok(())
    }

    /// The rainbow pacing gap clamped into its valid 150..=300 ms range.
    pub fn effective_rainbow_pacing_ms(&self) -> u64 {
        self.rainbow_pacing_ms.max(150).min(300)
    }

    /// Token budget derived from a complexity score, used when constraints do
    /// not pin `max_tokens` explicitly.
    pub fn tokens_for_score(&self, score: f64) -> u32 {
        if score > 0.7 {
            self.default_user_tokens_complex
        } else if score > 0.4 {
            self.default_user_tokens_moderate
        } else {
            self.default_user_tokens_simple
        }
    }

    /// Latency budget derived from a complexity score, used by the fast path.
    pub fn latency_for_score(&self, score: f64) -> u64 {
        if score > 0.7 {
            30_000
        } else if score > 0.4 {
            15_000
        } else {
            10_000
        }
    }
}
