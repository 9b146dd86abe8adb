//! The flow orchestrator.
//!
//! [`FlowOrchestrator`] drives every flow of one configuration: interactive
//! login (code flow with PKCE, implicit flow, optional PAR), the redirect
//! callback, silent renew through a hidden frame, the refresh token grant,
//! user info, revocation and logoff. It owns the [`AuthorizedState`] of its
//! configuration; nothing else changes it.
//!
//! Redirect flows are two-phase. `login` persists a [`FlowIntent`] keyed by
//! the request's `state` before handing the URL to the [`Navigator`];
//! `handle_callback` reads it back, possibly in another process that shares
//! the storage backend.
//!
//! At most one transition runs per configuration. A `login`, `refresh`,
//! silent renew or callback started while another is running fails with
//! [`OidcError::FlowInProgress`]. Local logoff does not wait for it.

mod authorize;
mod complete;
mod logoff;
mod navigator;
mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

pub use navigator::Navigator;
pub use state::{
    AuthOutcome, AuthorizedState, FlowIntent, FlowState, IntentKind, LoginOptions, LogoffOutcome,
};

use self::state::IntentStore;
use crate::callback::CallbackParser;
use crate::config::OpenIdConfiguration;
use crate::discovery::{AuthWellKnownEndpoints, DiscoveryService};
use crate::error::{OidcError, OidcResult};
use crate::events::{EventBus, EventKind};
use crate::jwks::JwksService;
use crate::nonce::NonceStateStore;
use crate::renew::{ExpiryCheck, RenewalReason, TokenRefreshScheduler, renewal_due};
use crate::session::{CheckSessionChannel, SessionMonitor};
use crate::storage::{ConfigStorage, MemoryStorage, StorageKey, StoragePersistence};
use crate::token::{IdTokenClaims, TokenResponse, decode_claims, expires_within};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::url::UrlBuilder;
use crate::validation::TokenValidator;

/// Builder for [`FlowOrchestrator`].
pub struct FlowOrchestratorBuilder {
    config: OpenIdConfiguration,
    navigator: Arc<dyn Navigator>,
    transport: Option<Arc<dyn HttpTransport>>,
    storage: Option<Arc<dyn StoragePersistence>>,
    channel: Option<Arc<dyn CheckSessionChannel>>,
    events: Option<EventBus>,
}

impl FlowOrchestratorBuilder {
    /// Uses `transport` instead of a reqwest client.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses `storage` instead of in-memory storage.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StoragePersistence>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Enables check-session polling over `channel`.
    #[must_use]
    pub fn check_session_channel(mut self, channel: Arc<dyn CheckSessionChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Publishes on `events` instead of a private bus.
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the configuration and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `OidcError::Configuration` for an invalid configuration, or a
    /// transport error if the default HTTP client cannot be built.
    pub fn build(self) -> OidcResult<Arc<FlowOrchestrator>> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout)?),
        };
        let backend = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let events = self.events.unwrap_or_default();
        let config = Arc::new(self.config);
        let storage = ConfigStorage::new(config.config_id(), backend);

        let monitor = self.channel.map(|channel| {
            SessionMonitor::new(config.clone(), channel, storage.clone(), events.clone())
        });

        let orchestrator = Arc::new_cyclic(|this| FlowOrchestrator {
            discovery: DiscoveryService::new(config.clone(), transport.clone(), storage.clone()),
            jwks: JwksService::new(transport.clone(), storage.clone()),
            nonces: NonceStateStore::new(storage.clone()),
            intents: IntentStore::new(storage.clone()),
            validator: TokenValidator::new(config.clone()),
            urls: UrlBuilder::new(config.clone()),
            scheduler: TokenRefreshScheduler::new(config.token_refresh_interval()),
            monitor,
            navigator: self.navigator,
            authorized: RwLock::new(AuthorizedState::Unknown),
            flow_state: RwLock::new(FlowState::Idle),
            transition: Mutex::new(()),
            generation: AtomicU64::new(0),
            this: this.clone(),
            config,
            transport,
            storage,
            events,
        });

        info!(
            config_id = %orchestrator.config_id(),
            authority = %orchestrator.config.authority,
            response_type = %orchestrator.config.response_type.as_str(),
            "OIDC configuration loaded"
        );
        orchestrator.publish(EventKind::ConfigLoaded);
        Ok(orchestrator)
    }
}

/// Drives the flows of one configuration.
pub struct FlowOrchestrator {
    config: Arc<OpenIdConfiguration>,
    storage: ConfigStorage,
    transport: Arc<dyn HttpTransport>,
    navigator: Arc<dyn Navigator>,
    events: EventBus,
    discovery: DiscoveryService,
    jwks: JwksService,
    nonces: NonceStateStore,
    intents: IntentStore,
    validator: TokenValidator,
    urls: UrlBuilder,
    monitor: Option<SessionMonitor>,
    scheduler: TokenRefreshScheduler,
    authorized: RwLock<AuthorizedState>,
    flow_state: RwLock<FlowState>,
    transition: Mutex<()>,
    /// Bumped every time authentication data is reset.
    generation: AtomicU64,
    this: Weak<FlowOrchestrator>,
}

impl FlowOrchestrator {
    /// Starts building an orchestrator for `config`.
    #[must_use]
    pub fn builder(
        config: OpenIdConfiguration,
        navigator: Arc<dyn Navigator>,
    ) -> FlowOrchestratorBuilder {
        FlowOrchestratorBuilder {
            config,
            navigator,
            transport: None,
            storage: None,
            channel: None,
            events: None,
        }
    }

    /// The configuration id.
    #[must_use]
    pub fn config_id(&self) -> &str {
        self.storage.config_id()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &OpenIdConfiguration {
        &self.config
    }

    /// The event bus this orchestrator publishes on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The session monitor, when a check-session channel was configured.
    #[must_use]
    pub fn session_monitor(&self) -> Option<&SessionMonitor> {
        self.monitor.as_ref()
    }

    /// Current authorized state.
    #[must_use]
    pub fn authorized_state(&self) -> AuthorizedState {
        self.authorized
            .read()
            .map(|s| *s)
            .unwrap_or(AuthorizedState::Unknown)
    }

    /// Returns `true` when a validated principal is held.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authorized_state() == AuthorizedState::Authorized
    }

    /// Position in the current or last flow.
    #[must_use]
    pub fn flow_state(&self) -> FlowState {
        self.flow_state.read().map(|s| *s).unwrap_or_default()
    }

    /// The held access token.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.read_storage(StorageKey::AuthzData)
    }

    /// The held ID token.
    #[must_use]
    pub fn id_token(&self) -> Option<String> {
        self.auth_result().and_then(|r| r.id_token)
    }

    /// The held refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.auth_result().and_then(|r| r.refresh_token)
    }

    /// Claims of the held ID token.
    #[must_use]
    pub fn id_token_claims(&self) -> Option<IdTokenClaims> {
        self.id_token().and_then(|t| decode_claims(&t).ok())
    }

    /// Unix time at which the held access token expires.
    #[must_use]
    pub fn access_token_expires_at(&self) -> Option<i64> {
        self.read_storage(StorageKey::AccessTokenExpiresAt)
            .and_then(|v| v.parse().ok())
    }

    /// Stored user info claims.
    #[must_use]
    pub fn user_data(&self) -> Option<serde_json::Value> {
        self.storage
            .read_json(StorageKey::UserData)
            .unwrap_or_else(|err| {
                warn!(config_id = %self.config_id(), error = %err, "Failed to read user data");
                None
            })
    }

    /// The last stored token response.
    #[must_use]
    pub fn auth_result(&self) -> Option<TokenResponse> {
        self.storage
            .read_json(StorageKey::AuthnResult)
            .unwrap_or_else(|err| {
                warn!(config_id = %self.config_id(), error = %err, "Failed to read auth result");
                None
            })
    }

    /// Establishes the authorized state on startup.
    ///
    /// When `current_url` carries a redirect callback it is completed.
    /// Otherwise stored tokens that are still fresh restore `Authorized`
    /// and restart session monitoring and the periodic token check.
    ///
    /// # Errors
    ///
    /// Returns the error of the callback when one was processed.
    pub async fn check_auth(&self, current_url: Option<&str>) -> OidcResult<AuthorizedState> {
        self.publish(EventKind::CheckingAuth);

        if let Some(url) = current_url
            && CallbackParser::is_callback(url)
        {
            debug!(config_id = %self.config_id(), "Current URL is a callback");
            return match self.handle_callback(url).await {
                Ok(_) => {
                    self.publish(EventKind::CheckingAuthFinished);
                    Ok(self.authorized_state())
                }
                Err(err) => {
                    self.publish(EventKind::CheckingAuthFinishedWithError(err.to_string()));
                    Err(err)
                }
            };
        }

        let state = if self.stored_tokens_fresh(OffsetDateTime::now_utc()) {
            debug!(config_id = %self.config_id(), "Restoring authentication from storage");
            self.set_authorized_state(AuthorizedState::Authorized);
            self.start_background_tasks().await;
            AuthorizedState::Authorized
        } else {
            self.set_authorized_state(AuthorizedState::Unauthorized);
            AuthorizedState::Unauthorized
        };
        self.publish(EventKind::CheckingAuthFinished);
        Ok(state)
    }

    /// Checks the held tokens and starts a renewal when one is due.
    ///
    /// Runs on every tick of the periodic check; does nothing unless
    /// authorized, renewal is enabled and no renewal is running.
    pub async fn renew_if_due(&self) {
        if !self.is_authenticated() || !self.renewal_enabled() || self.renewal_running() {
            return;
        }

        let reason = renewal_due(
            self.access_token_expires_at(),
            self.id_token_claims().and_then(|c| c.exp),
            self.config.silent_renew_offset_seconds,
            self.config.trigger_refresh_when_id_token_expired,
            OffsetDateTime::now_utc(),
        );
        let Some(reason) = reason else {
            return;
        };

        info!(config_id = %self.config_id(), reason = ?reason, "Token renewal due");
        self.publish(match reason {
            RenewalReason::AccessTokenExpiring => EventKind::TokenExpired,
            RenewalReason::IdTokenExpiring => EventKind::IdTokenExpired,
        });

        let result = if self.config.use_refresh_token {
            self.refresh().await.map(|_| ())
        } else {
            self.begin_silent_renew().await.map(|_| ())
        };
        match result {
            Ok(()) | Err(OidcError::FlowInProgress { .. }) => {}
            Err(err) => {
                warn!(config_id = %self.config_id(), error = %err, "Scheduled renewal failed");
            }
        }
    }

    fn renewal_enabled(&self) -> bool {
        self.config.silent_renew || self.config.use_refresh_token
    }

    fn stored_tokens_fresh(&self, now: OffsetDateTime) -> bool {
        let offset = self.config.silent_renew_offset_seconds;
        let id_token_fresh = self
            .id_token_claims()
            .and_then(|c| c.exp)
            .is_some_and(|exp| !expires_within(exp, offset, now));
        let access_token_fresh = self
            .access_token_expires_at()
            .is_none_or(|exp| !expires_within(exp, offset, now));
        id_token_fresh && access_token_fresh
    }

    pub(crate) fn renewal_running(&self) -> bool {
        self.read_storage(StorageKey::SilentRenewRunning).is_some()
    }

    pub(crate) fn set_renewal_running(&self, running: bool) {
        let result = if running {
            self.storage.write(StorageKey::SilentRenewRunning, "running")
        } else {
            self.storage.remove(StorageKey::SilentRenewRunning)
        };
        if let Err(err) = result {
            warn!(config_id = %self.config_id(), error = %err, "Failed to update renewal flag");
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Fails when a logoff ran since `generation` was read.
    pub(crate) fn ensure_not_reset(&self, generation: u64) -> OidcResult<()> {
        if self.generation() == generation {
            Ok(())
        } else {
            debug!(config_id = %self.config_id(), "Authentication data reset during renewal");
            Err(OidcError::renewal_cancelled(self.config_id()))
        }
    }

    /// Claims the single transition slot of this configuration.
    fn begin_transition(&self) -> OidcResult<MutexGuard<'_, ()>> {
        self.transition.try_lock().map_err(|_| {
            debug!(config_id = %self.config_id(), "Rejecting concurrent flow");
            OidcError::flow_in_progress(self.config_id())
        })
    }

    async fn endpoints(&self) -> OidcResult<AuthWellKnownEndpoints> {
        Ok(self.discovery.get().await?)
    }

    pub(crate) fn set_flow_state(&self, state: FlowState) {
        if let Ok(mut current) = self.flow_state.write()
            && *current != state
        {
            debug!(config_id = %self.config_id(), from = %*current, to = %state, "Flow state");
            *current = state;
        }
    }

    pub(crate) fn set_authorized_state(&self, state: AuthorizedState) {
        let changed = match self.authorized.write() {
            Ok(mut current) if *current != state => {
                *current = state;
                true
            }
            _ => false,
        };
        if changed {
            info!(config_id = %self.config_id(), state = %state, "Authorized state changed");
            self.publish(EventKind::AuthorizedStateChanged(state));
        }
    }

    pub(crate) fn publish(&self, kind: EventKind) {
        self.events.publish(self.config_id(), kind);
    }

    fn read_storage(&self, key: StorageKey) -> Option<String> {
        self.storage.read(key).unwrap_or_else(|err| {
            warn!(config_id = %self.config_id(), key = %key, error = %err, "Storage read failed");
            None
        })
    }

    /// Starts the session monitor and the periodic token check, as
    /// configured.
    async fn start_background_tasks(&self) {
        if let Some(monitor) = &self.monitor
            && self.config.start_check_session
        {
            match self.discovery.get().await {
                Ok(endpoints) => match endpoints.check_session_iframe_url.as_deref().map(Url::parse) {
                    Some(Ok(url)) => {
                        monitor.start(&url);
                    }
                    Some(Err(err)) => {
                        warn!(config_id = %self.config_id(), error = %err, "Invalid check session iframe URL");
                    }
                    None => {
                        debug!(config_id = %self.config_id(), "No check session iframe advertised");
                    }
                },
                Err(err) => {
                    warn!(config_id = %self.config_id(), error = %err, "Cannot start session monitor");
                }
            }
        }

        if self.renewal_enabled() {
            let target: Weak<dyn ExpiryCheck> = self.this.clone();
            self.scheduler.start(self.config_id(), target);
        }
    }

    fn stop_background_tasks(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.stop();
            monitor.reset();
        }
        self.scheduler.stop();
    }

    /// Removes everything that authenticates the current principal and
    /// marks the configuration unauthorized.
    pub(crate) fn reset_authorization_data(&self) {
        let had_user_data = self.read_storage(StorageKey::UserData).is_some();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_background_tasks();
        if let Err(err) = self.storage.remove_all(&StorageKey::AUTH_DATA) {
            warn!(config_id = %self.config_id(), error = %err, "Failed to clear auth data");
        }
        self.set_authorized_state(AuthorizedState::Unauthorized);
        if had_user_data {
            self.publish(EventKind::UserDataChanged);
        }
    }
}

#[async_trait]
impl ExpiryCheck for FlowOrchestrator {
    async fn check_expiry(&self) {
        self.renew_if_due().await;
    }
}

impl std::fmt::Debug for FlowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowOrchestrator")
            .field("config_id", &self.config_id())
            .field("authorized", &self.authorized_state())
            .field("flow_state", &self.flow_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
