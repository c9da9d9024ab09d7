//! Actor host: the embedding seam external front-ends talk to.
//!
//! A [`SwarmHost`] owns the shared wiring (config, model registry, provider
//! client) plus the registries of live actors: one mediator per user, one
//! orchestrator per delegated covenant.  HTTP or WebSocket layers sit outside
//! this crate and only ever touch the host surface:
//!
//! - `POST /intent`            -> [`SwarmHost::mediator`] + `submit_intent`
//! - `GET /status/{user}`      -> `mediator(user).status()`
//! - `WS /stream/{user}`       -> [`SwarmHost::attach_stream`]
//! - `WS /stream/task/{id}`    -> [`SwarmHost::attach_task_stream`]
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmllm::config::SwarmConfig;
//! use swarmllm::host::SwarmHost;
//!
//! # async {
//! let config = SwarmConfig::from_env()?;
//! let host = SwarmHost::with_gateway(config)?;
//!
//! let mediator = host.mediator("user-7").await;
//! let covenant = mediator.submit_intent("What is 2+2?", None).await?;
//! println!("{} -> {}", covenant.id, covenant.state);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # };
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::swarmllm::client_wrapper::ProviderClient;
use crate::swarmllm::clients::gateway::GatewayClient;
use crate::swarmllm::config::{ConfigError, SwarmConfig};
use crate::swarmllm::covenant::{CallbackHandle, Covenant, MediatorContext};
use crate::swarmllm::event::Subscription;
use crate::swarmllm::mediator::{self, MediatorHandle, MediatorSeed, OrchestratorSpawner};
use crate::swarmllm::orchestrator::{self, OrchestratorHandle, OrchestratorSeed};
use crate::swarmllm::registry::ModelRegistry;

struct HostInner {
    config: SwarmConfig,
    registry: Arc<ModelRegistry>,
    client: Arc<dyn ProviderClient>,
    mediators: Mutex<HashMap<String, MediatorHandle>>,
    orchestrators: Mutex<HashMap<String, OrchestratorHandle>>,
}

/// Shared, cloneable actor host.
#[derive(Clone)]
pub struct SwarmHost {
    inner: Arc<HostInner>,
}

impl SwarmHost {
    /// A host over an explicit provider client.  This is also the seam tests
    /// use to substitute scripted clients.
    pub fn new(config: SwarmConfig, client: Arc<dyn ProviderClient>) -> Self {
        Self::with_registry(config, client, Arc::new(ModelRegistry::builtin()))
    }

    /// A host over an explicit client and catalog.
    pub fn with_registry(
        config: SwarmConfig,
        client: Arc<dyn ProviderClient>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                registry,
                client,
                mediators: Mutex::new(HashMap::new()),
                orchestrators: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A host over the production [`GatewayClient`].  Fails when the gateway
    /// settings are missing.
    pub fn with_gateway(config: SwarmConfig) -> Result<Self, ConfigError> {
        config.validate_gateway()?;
        let registry = Arc::new(ModelRegistry::builtin());
        let client = Arc::new(GatewayClient::new(&config, Arc::clone(&registry)));
        Ok(Self::with_registry(config, client, registry))
    }

    /// The shared configuration.
    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    /// The shared model catalog.
    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Get or create the mediator actor for a user.
    pub async fn mediator(&self, user_id: &str) -> MediatorHandle {
        let mut mediators = self.inner.mediators.lock().await;
        if let Some(handle) = mediators.get(user_id) {
            return handle.clone();
        }
        let store_path = self
            .inner
            .config
            .state_dir
            .join(format!("mediator-{}.db", sanitize(user_id)));
        let handle = mediator::spawn(MediatorSeed {
            user_id: user_id.to_string(),
            config: self.inner.config.clone(),
            registry: Arc::clone(&self.inner.registry),
            client: Arc::clone(&self.inner.client),
            spawner: Arc::new(HostSpawner {
                inner: Arc::clone(&self.inner),
            }),
            store_path,
        });
        mediators.insert(user_id.to_string(), handle.clone());
        handle
    }

    /// Attach a bidirectional stream to a user's mediator.  The current
    /// covenant head is replayed as a snapshot first.
    pub async fn attach_stream(&self, user_id: &str) -> Subscription {
        self.mediator(user_id).await.open_stream().await
    }

    /// Attach a read-only stream to a delegated covenant's orchestrator, when
    /// one exists.
    pub async fn attach_task_stream(&self, covenant_id: &str) -> Option<Subscription> {
        let orchestrators = self.inner.orchestrators.lock().await;
        match orchestrators.get(covenant_id) {
            Some(handle) => Some(handle.subscribe().await),
            None => None,
        }
    }

    /// The orchestrator handle for a covenant, when one was created.
    pub async fn orchestrator(&self, covenant_id: &str) -> Option<OrchestratorHandle> {
        self.inner.orchestrators.lock().await.get(covenant_id).cloned()
    }

    /// Number of live orchestrator registrations.
    pub async fn orchestrator_count(&self) -> usize {
        self.inner.orchestrators.lock().await.len()
    }
}

struct HostSpawner {
    inner: Arc<HostInner>,
}

#[async_trait]
impl OrchestratorSpawner for HostSpawner {
    async fn spawn_orchestrator(
        &self,
        covenant: Covenant,
        context: MediatorContext,
        callback: CallbackHandle,
    ) -> OrchestratorHandle {
        let mut orchestrators = self.inner.orchestrators.lock().await;
        // One orchestrator per covenant: a duplicate delegation addresses the
        // existing actor instead of racing a second swarm.
        if let Some(existing) = orchestrators.get(&covenant.id) {
            return existing.clone();
        }
        let store_path = self
            .inner
            .config
            .state_dir
            .join(format!("orchestrator-{}.db", sanitize(&covenant.id)));
        let handle = orchestrator::spawn(OrchestratorSeed {
            covenant: covenant.clone(),
            context,
            callback,
            registry: Arc::clone(&self.inner.registry),
            client: Arc::clone(&self.inner.client),
            config: self.inner.config.clone(),
            store_path,
        });
        orchestrators.insert(covenant.id, handle.clone());
        handle
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
