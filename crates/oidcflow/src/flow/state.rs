//! Flow states, outcomes and durable intents.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::nonce::NONCE_STATE_TTL;
use crate::storage::{ConfigStorage, StorageError, StorageKey};

/// Whether the principal of a configuration is logged in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizedState {
    /// Not determined yet (before `check_auth`).
    #[default]
    Unknown,
    /// A validated ID token is held.
    Authorized,
    /// No valid authentication is held.
    Unauthorized,
}

impl AuthorizedState {
    /// Returns the state name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Authorized => "authorized",
            Self::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for AuthorizedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of the orchestrator in a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// No flow started.
    #[default]
    Idle,
    /// Authorize request being prepared.
    AuthorizeRequested,
    /// User agent sent to the authorization server.
    AwaitingCallback,
    /// Calling the token endpoint.
    Exchanging,
    /// Validating the ID token.
    Validating,
    /// Calling the user info endpoint.
    FetchingUserInfo,
    /// Flow finished with a validated principal.
    Authorized,
    /// Flow finished without one.
    Unauthorized,
}

impl FlowState {
    /// Returns the state name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AuthorizeRequested => "authorize_requested",
            Self::AwaitingCallback => "awaiting_callback",
            Self::Exchanging => "exchanging",
            Self::Validating => "validating",
            Self::FetchingUserInfo => "fetching_user_info",
            Self::Authorized => "authorized",
            Self::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options of an interactive login.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    /// `prompt` parameter (`login`, `consent`, `select_account`, ...).
    pub prompt: Option<String>,
    /// Extra authorize parameters for this call only.
    pub custom_params: BTreeMap<String, String>,
}

impl LoginOptions {
    /// Sets `prompt`.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Adds one extra authorize parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_params.insert(key.into(), value.into());
        self
    }
}

/// Result of a completed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthOutcome {
    /// Whether a validated principal is now held.
    pub is_authenticated: bool,
    /// Whether the flow was a renewal.
    pub is_renew_process: bool,
}

/// How a logoff reached the authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoffOutcome {
    /// Only local data was cleared.
    LocalOnly,
    /// The user agent was sent to the end-session URL.
    Redirected(url::Url),
    /// The end-session parameters were posted in the background.
    Posted,
}

/// Which flow produced an authorize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Interactive login.
    Login,
    /// Hidden-frame renewal.
    SilentRenew,
}

/// What `begin` persisted for `complete`, keyed by the request's state.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowIntent {
    /// Producing flow.
    pub kind: IntentKind,
    /// Nonce sent with the request.
    pub nonce: String,
    /// PKCE verifier (code flow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    /// Redirect URI sent with the request; the token request must repeat it.
    pub redirect_uri: String,
    /// Creation time, Unix milliseconds.
    pub created_at: i64,
}

impl fmt::Debug for FlowIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowIntent")
            .field("kind", &self.kind)
            .field("redirect_uri", &self.redirect_uri)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl FlowIntent {
    /// Returns `true` for hidden-frame renewals.
    #[must_use]
    pub fn is_renew(&self) -> bool {
        self.kind == IntentKind::SilentRenew
    }
}

/// Durable intents of one configuration. Expire with the state they are
/// keyed by.
#[derive(Debug)]
pub(crate) struct IntentStore {
    storage: ConfigStorage,
    lock: Mutex<()>,
}

impl IntentStore {
    pub(crate) fn new(storage: ConfigStorage) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn save(&self, state: &str, intent: FlowIntent) -> Result<(), StorageError> {
        self.update(|intents| {
            intents.insert(state.to_string(), intent);
        })
    }

    pub(crate) fn take(&self, state: &str) -> Result<Option<FlowIntent>, StorageError> {
        let mut taken = None;
        self.update(|intents| taken = intents.remove(state))?;
        Ok(taken)
    }

    fn update(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, FlowIntent>),
    ) -> Result<(), StorageError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::backend("intent lock poisoned"))?;

        let mut intents: BTreeMap<String, FlowIntent> = self
            .storage
            .read_json(StorageKey::FlowIntents)?
            .unwrap_or_default();
        let cutoff = now_ms() - NONCE_STATE_TTL.as_millis() as i64;
        intents.retain(|_, intent| intent.created_at > cutoff);

        f(&mut intents);

        if intents.is_empty() {
            self.storage.remove(StorageKey::FlowIntents)
        } else {
            self.storage.write_json(StorageKey::FlowIntents, &intents)
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
