//! Registry of flow orchestrators, one per configuration.
//!
//! Every orchestrator shares the transport, the storage backend and the
//! event bus of the client. Storage keys are namespaced by `config_id`, so
//! configurations never see each other's state.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigError, OidcSettings, OpenIdConfiguration};
use crate::error::{OidcError, OidcResult};
use crate::events::EventBus;
use crate::flow::{AuthorizedState, FlowOrchestrator, Navigator};
use crate::session::CheckSessionChannel;
use crate::storage::{MemoryStorage, StoragePersistence};
use crate::transport::HttpTransport;

/// Builder for [`OidcClient`].
pub struct OidcClientBuilder {
    configs: Vec<OpenIdConfiguration>,
    navigator: Arc<dyn Navigator>,
    transport: Option<Arc<dyn HttpTransport>>,
    storage: Option<Arc<dyn StoragePersistence>>,
    channel: Option<Arc<dyn CheckSessionChannel>>,
    events: EventBus,
}

impl OidcClientBuilder {
    /// Adds one configuration.
    #[must_use]
    pub fn configuration(mut self, config: OpenIdConfiguration) -> Self {
        self.configs.push(config);
        self
    }

    /// Adds every client of a loaded settings file.
    #[must_use]
    pub fn settings(mut self, settings: &OidcSettings) -> Self {
        self.configs.extend(settings.clients.iter().cloned());
        self
    }

    /// Shares `transport` between all configurations.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Shares `storage` between all configurations.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StoragePersistence>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enables check-session polling for configurations that ask for it.
    #[must_use]
    pub fn check_session_channel(mut self, channel: Arc<dyn CheckSessionChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Publishes events of every configuration on `events`.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Builds one orchestrator per configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid configuration or a
    /// repeated `config_id`.
    pub fn build(self) -> OidcResult<OidcClient> {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let mut flows = BTreeMap::new();
        for config in self.configs {
            let config_id = config.config_id().to_string();
            if flows.contains_key(&config_id) {
                return Err(ConfigError::Load(format!("duplicate config_id: {config_id}")).into());
            }

            let mut builder = FlowOrchestrator::builder(config, Arc::clone(&self.navigator))
                .storage(Arc::clone(&storage))
                .events(self.events.clone());
            if let Some(transport) = &self.transport {
                builder = builder.transport(Arc::clone(transport));
            }
            if let Some(channel) = &self.channel {
                builder = builder.check_session_channel(Arc::clone(channel));
            }
            flows.insert(config_id, builder.build()?);
        }

        info!(configurations = flows.len(), "OIDC client ready");
        Ok(OidcClient {
            flows,
            events: self.events,
        })
    }
}

/// One [`FlowOrchestrator`] per `config_id`.
pub struct OidcClient {
    flows: BTreeMap<String, Arc<FlowOrchestrator>>,
    events: EventBus,
}

impl OidcClient {
    /// Starts a builder; `navigator` is shared by all configurations.
    pub fn builder(navigator: Arc<dyn Navigator>) -> OidcClientBuilder {
        OidcClientBuilder {
            configs: Vec::new(),
            navigator,
            transport: None,
            storage: None,
            channel: None,
            events: EventBus::new(),
        }
    }

    /// The orchestrator of `config_id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownConfiguration` if no such configuration exists.
    pub fn get(&self, config_id: &str) -> OidcResult<&Arc<FlowOrchestrator>> {
        self.flows
            .get(config_id)
            .ok_or_else(|| OidcError::unknown_configuration(config_id))
    }

    /// The only orchestrator, or the one named by `config_id`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownConfiguration` when `config_id` is unknown, or when
    /// it is `None` and the client does not hold exactly one configuration.
    pub fn get_or_single(&self, config_id: Option<&str>) -> OidcResult<&Arc<FlowOrchestrator>> {
        match config_id {
            Some(id) => self.get(id),
            None if self.flows.len() == 1 => self
                .flows
                .values()
                .next()
                .ok_or_else(|| OidcError::unknown_configuration("")),
            None => Err(OidcError::unknown_configuration("<unspecified>")),
        }
    }

    /// All configuration ids, sorted.
    pub fn config_ids(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    /// All orchestrators, sorted by configuration id.
    pub fn orchestrators(&self) -> impl Iterator<Item = &Arc<FlowOrchestrator>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// The event bus shared by every configuration.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Authorization state per configuration.
    pub fn authorized_states(&self) -> BTreeMap<String, AuthorizedState> {
        self.flows
            .iter()
            .map(|(id, flow)| (id.clone(), flow.authorized_state()))
            .collect()
    }

    /// Runs `check_auth` for every configuration in turn.
    ///
    /// A callback URL is only handled by the configuration whose pending
    /// intent owns its `state`; the others fail their state check and
    /// report an error.
    pub async fn check_auth_all(
        &self,
        current_url: Option<&str>,
    ) -> BTreeMap<String, OidcResult<AuthorizedState>> {
        let mut results = BTreeMap::new();
        for (id, flow) in &self.flows {
            results.insert(id.clone(), flow.check_auth(current_url).await);
        }
        results
    }

    /// Local logoff of every configuration.
    pub fn logoff_local_all(&self) {
        for flow in self.flows.values() {
            flow.logoff_local();
        }
    }
}

impl std::fmt::Debug for OidcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcClient")
            .field("config_ids", &self.flows.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
