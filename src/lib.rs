// src/lib.rs

// Import the top-level `swarmllm` module.
pub mod swarmllm;

// Re-exporting key items for easier external access.
pub use swarmllm::client_wrapper::{ChatMessage, ProviderClient, Role};
pub use swarmllm::covenant::{Constraints, Covenant, CovenantState, QualityTier};
pub use swarmllm::host::SwarmHost;

// Module aliases so paths read as swarmllm::router::... from the outside.
pub use swarmllm::client_wrapper;
pub use swarmllm::clients;
pub use swarmllm::config;
pub use swarmllm::covenant;
pub use swarmllm::event;
pub use swarmllm::host;
pub use swarmllm::mediator;
pub use swarmllm::orchestrator;
pub use swarmllm::registry;
pub use swarmllm::router;
pub use swarmllm::store;
pub use swarmllm::subagent;
