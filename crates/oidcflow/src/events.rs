//! Public event bus.
//!
//! Every orchestrator publishes [`OidcEvent`]s on a shared [`EventBus`].
//! Hosts subscribe to react to logins, renewals and session changes without
//! polling. Slow receivers lose the oldest events once the buffer is full.

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::flow::AuthorizedState;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 100;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventKind {
    /// A configuration was registered.
    ConfigLoaded,
    /// `check_auth` started.
    CheckingAuth,
    /// `check_auth` finished.
    CheckingAuthFinished,
    /// `check_auth` failed.
    CheckingAuthFinishedWithError(String),
    /// The check-session frame answered with something other than
    /// `unchanged`.
    CheckSessionReceived(String),
    /// User info was stored or cleared.
    UserDataChanged,
    /// A flow finished.
    NewAuthenticationResult {
        /// Whether the principal is now authorized.
        is_authenticated: bool,
        /// Whether the flow was a renewal.
        is_renew_process: bool,
    },
    /// The access token is about to expire.
    TokenExpired,
    /// The ID token is about to expire.
    IdTokenExpired,
    /// A renewal started.
    SilentRenewStarted,
    /// A renewal failed; the tokens held before it are kept.
    SilentRenewFailed,
    /// The authorized state changed.
    AuthorizedStateChanged(AuthorizedState),
}

/// An event tagged with the configuration that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OidcEvent {
    /// Configuration id.
    pub config_id: String,
    /// Payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl fmt::Display for OidcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::ConfigLoaded => write!(f, "[{}] configuration loaded", self.config_id),
            EventKind::CheckingAuth => write!(f, "[{}] checking auth", self.config_id),
            EventKind::CheckingAuthFinished => {
                write!(f, "[{}] checking auth finished", self.config_id)
            }
            EventKind::CheckingAuthFinishedWithError(message) => {
                write!(f, "[{}] checking auth failed: {message}", self.config_id)
            }
            EventKind::CheckSessionReceived(data) => {
                write!(f, "[{}] check session: {data}", self.config_id)
            }
            EventKind::UserDataChanged => write!(f, "[{}] user data changed", self.config_id),
            EventKind::NewAuthenticationResult {
                is_authenticated,
                is_renew_process,
            } => write!(
                f,
                "[{}] authentication result: authenticated={is_authenticated} renew={is_renew_process}",
                self.config_id
            ),
            EventKind::TokenExpired => write!(f, "[{}] access token expiring", self.config_id),
            EventKind::IdTokenExpired => write!(f, "[{}] id token expiring", self.config_id),
            EventKind::SilentRenewStarted => write!(f, "[{}] renewal started", self.config_id),
            EventKind::SilentRenewFailed => write!(f, "[{}] renewal failed", self.config_id),
            EventKind::AuthorizedStateChanged(state) => {
                write!(f, "[{}] authorized state: {state}", self.config_id)
            }
        }
    }
}

/// Broadcaster shared by all configurations of a client.
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OidcEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus with a custom buffer size.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event.
    ///
    /// Returns the number of subscribers that received it; 0 when nobody
    /// listens.
    pub fn publish(&self, config_id: &str, kind: EventKind) -> usize {
        tracing::trace!(config_id = %config_id, event = ?kind, "Publishing event");
        self.sender
            .send(OidcEvent {
                config_id: config_id.to_string(),
                kind,
            })
            .unwrap_or_default()
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OidcEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
