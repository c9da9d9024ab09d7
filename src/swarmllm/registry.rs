//! Static catalog of model descriptors.
//!
//! The registry is immutable, shared process-wide, and is the only place where
//! pricing, tiering, and capability metadata live.  The smart router plans
//! candidate cascades from it and the orchestrator picks role models out of it.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::registry::{ModelRegistry, ModelTier};
//!
//! let registry = ModelRegistry::builtin();
//!
//! let primaries = registry.by_tier(ModelTier::Primary);
//! assert!(!primaries.is_empty());
//!
//! let cheap = registry
//!     .cheapest_meeting(ModelTier::Edge, 1.0, 3)
//!     .expect("edge tier always has a budget model");
//! println!("last resort: {}", cheap.id);
//! ```

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

use crate::swarmllm::client_wrapper::TokenUsage;

/// Cost/latency tier a model belongs to.  Tiers partition the catalog: every
/// descriptor carries exactly one tier, and the router cascades across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Balanced default tier; first choice for most work.
    Primary,
    /// Cheap, fast, lower-quality tier; always the last resort in a cascade.
    Edge,
    /// Highest-quality tier; selected for `quality` covenants and hard prompts.
    Flagship,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Primary => write!(f, "primary"),
            ModelTier::Edge => write!(f, "edge"),
            ModelTier::Flagship => write!(f, "flagship"),
        }
    }
}

/// Capability flags attached to a catalog entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the upstream serves incremental responses.
    pub supports_streaming: bool,
    /// Whether the upstream accepts native tool definitions.
    pub supports_tools: bool,
    /// Whether the upstream exposes a reasoning/thinking mode.
    pub supports_thinking: bool,
    /// Coarse quality ranking, 1 (weakest) to 10 (strongest).
    pub quality_rank: u8,
}

/// An immutable catalog entry describing one routable model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    /// Opaque `provider/model_name` identifier, as sent to the gateway.
    pub id: &'static str,
    /// Provider tag, the prefix of `id`.
    pub provider: &'static str,
    /// Tier this model belongs to.
    pub tier: ModelTier,
    /// Blended price per million tokens (prompt + completion), USD.
    pub cost_per_million_tokens: f64,
    /// Nominal generation speed in tokens per second.
    pub nominal_speed_tokens_per_sec: f64,
    /// Context window size in tokens.
    pub max_context_tokens: u32,
    /// Capability flags.
    pub capabilities: Capabilities,
}

impl ModelDescriptor {
    /// Shorthand for the descriptor's quality rank.
    pub fn quality_rank(&self) -> u8 {
        self.capabilities.quality_rank
    }
}

/// Errors returned by registry lookups.
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// The requested id is not in the catalog.
    UnknownModel(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownModel(id) => write!(f, "unknown model id: {}", id),
        }
    }
}

impl Error for RegistryError {}

const fn caps(streaming: bool, tools: bool, thinking: bool, quality_rank: u8) -> Capabilities {
    Capabilities {
        supports_streaming: streaming,
        supports_tools: tools,
        supports_thinking: thinking,
        quality_rank,
    }
}

/// The built-in catalog.  Three tiers, four providers, priced per million
/// blended tokens.
const BUILTIN_CATALOG: &[ModelDescriptor] = &[
    // ── Primary tier ─────────────────────────────────────────────────────
    ModelDescriptor {
        id: "openai/gpt-4.1-mini",
        provider: "openai",
        tier: ModelTier::Primary,
        cost_per_million_tokens: 0.70,
        nominal_speed_tokens_per_sec: 180.0,
        max_context_tokens: 1_047_576,
        capabilities: caps(true, true, false, 7),
    },
    ModelDescriptor {
        id: "anthropic/claude-sonnet-4",
        provider: "anthropic",
        tier: ModelTier::Primary,
        cost_per_million_tokens: 3.60,
        nominal_speed_tokens_per_sec: 110.0,
        max_context_tokens: 200_000,
        capabilities: caps(true, true, true, 8),
    },
    ModelDescriptor {
        id: "google/gemini-2.5-flash",
        provider: "google",
        tier: ModelTier::Primary,
        cost_per_million_tokens: 0.60,
        nominal_speed_tokens_per_sec: 220.0,
        max_context_tokens: 1_048_576,
        capabilities: caps(true, true, true, 7),
    },
    // ── Edge tier ────────────────────────────────────────────────────────
    ModelDescriptor {
        id: "openai/gpt-4.1-nano",
        provider: "openai",
        tier: ModelTier::Edge,
        cost_per_million_tokens: 0.17,
        nominal_speed_tokens_per_sec: 260.0,
        max_context_tokens: 1_047_576,
        capabilities: caps(true, true, false, 4),
    },
    ModelDescriptor {
        id: "google/gemini-2.0-flash-lite",
        provider: "google",
        tier: ModelTier::Edge,
        cost_per_million_tokens: 0.13,
        nominal_speed_tokens_per_sec: 300.0,
        max_context_tokens: 1_048_576,
        capabilities: caps(true, false, false, 3),
    },
    ModelDescriptor {
        id: "meta/llama-3.3-70b",
        provider: "meta",
        tier: ModelTier::Edge,
        cost_per_million_tokens: 0.25,
        nominal_speed_tokens_per_sec: 190.0,
        max_context_tokens: 128_000,
        capabilities: caps(true, false, false, 4),
    },
    // ── Flagship tier ────────────────────────────────────────────────────
    ModelDescriptor {
        id: "openai/gpt-5",
        provider: "openai",
        tier: ModelTier::Flagship,
        cost_per_million_tokens: 5.60,
        nominal_speed_tokens_per_sec: 90.0,
        max_context_tokens: 400_000,
        capabilities: caps(true, true, true, 9),
    },
    ModelDescriptor {
        id: "anthropic/claude-opus-4",
        provider: "anthropic",
        tier: ModelTier::Flagship,
        cost_per_million_tokens: 37.50,
        nominal_speed_tokens_per_sec: 60.0,
        max_context_tokens: 200_000,
        capabilities: caps(true, true, true, 10),
    },
    ModelDescriptor {
        id: "google/gemini-2.5-pro",
        provider: "google",
        tier: ModelTier::Flagship,
        cost_per_million_tokens: 6.25,
        nominal_speed_tokens_per_sec: 85.0,
        max_context_tokens: 1_048_576,
        capabilities: caps(true, true, true, 9),
    },
];

/// Pure-data model catalog.
///
/// Cloning is cheap (descriptors are `'static`); share it as
/// `Arc<ModelRegistry>` between actors.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// The built-in production catalog.
    pub fn builtin() -> Self {
        Self {
            models: BUILTIN_CATALOG.to_vec(),
        }
    }

    /// A registry over a caller-supplied catalog.  Used by tests.
    pub fn with_models(models: Vec<ModelDescriptor>) -> Self {
        Self { models }
    }

    /// All descriptors, in catalog order.
    pub fn list(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Look up one descriptor by id.
    pub fn get(&self, id: &str) -> Result<&ModelDescriptor, RegistryError> {
        self.models
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| RegistryError::UnknownModel(id.to_string()))
    }

    /// All descriptors in the given tier, in catalog order.
    pub fn by_tier(&self, tier: ModelTier) -> Vec<&ModelDescriptor> {
        self.models.iter().filter(|m| m.tier == tier).collect()
    }

    /// The cheapest descriptor of `tier` whose quality rank is at least
    /// `min_quality_rank` and whose per-million price does not exceed
    /// `max_cost_per_million`.
    pub fn cheapest_meeting(
        &self,
        tier: ModelTier,
        max_cost_per_million: f64,
        min_quality_rank: u8,
    ) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| {
                m.tier == tier
                    && m.quality_rank() >= min_quality_rank
                    && m.cost_per_million_tokens <= max_cost_per_million
            })
            .min_by(|a, b| {
                a.cost_per_million_tokens
                    .partial_cmp(&b.cost_per_million_tokens)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// The strongest descriptor of `tier`: highest quality rank, price as the
    /// tie breaker.
    pub fn best_of_tier(&self, tier: ModelTier) -> Option<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.tier == tier)
            .min_by(|a, b| {
                b.quality_rank().cmp(&a.quality_rank()).then(
                    a.cost_per_million_tokens
                        .partial_cmp(&b.cost_per_million_tokens)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            })
    }

    /// Price a call against the catalog.  Unknown models price at zero.
    pub fn price(&self, model_id: &str, usage: &TokenUsage) -> f64 {
        match self.get(model_id) {
            Ok(descriptor) => {
                descriptor.cost_per_million_tokens * usage.total() as f64 / 1_000_000.0
            }
            Err(_) => 0.0,
        }
    }
}
