//! Error types for the OpenID Connect client engine.
//!
//! Every concern owns a focused error enum (`TransportError`, `StorageError`,
//! `DiscoveryError`, ...). `OidcError` is the crate-wide error returned by the
//! flow orchestrator and wraps them all.
//!
//! Validation failures never carry the name of the check that failed. The
//! orchestrator logs the specific check and returns the generic
//! [`OidcError::AuthenticationFailed`].

use std::fmt;

use crate::callback::CallbackError;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::jwks::JwksError;
use crate::pkce::PkceError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Result alias used throughout the crate.
pub type OidcResult<T> = Result<T, OidcError>;

/// Errors produced by the flow orchestrator and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// The configuration is invalid. Fatal, raised synchronously at setup.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// No configuration is registered under the requested id.
    #[error("Unknown configuration: {config_id}")]
    UnknownConfiguration {
        /// The requested configuration id.
        config_id: String,
    },

    /// The redirect callback could not be accepted.
    #[error("Callback rejected: {0}")]
    Callback(#[from] CallbackError),

    /// The authorization server answered with an OAuth error.
    #[error("Authorization server error: {error}")]
    AuthorizationServer {
        /// OAuth error code (e.g. `invalid_grant`).
        error: String,
        /// Optional human readable description.
        description: Option<String>,
    },

    /// The ID token or user info response failed validation.
    ///
    /// The specific failed check is logged, never returned.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The authorization server could not be reached. Try again later.
    #[error("Authorization server unavailable: {message}")]
    Unavailable {
        /// Description of the connectivity failure.
        message: String,
    },

    /// A request failed for a reason other than connectivity.
    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// Loading the well-known document failed.
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Loading the signing keys failed.
    #[error("Key set error: {0}")]
    Jwks(#[from] JwksError),

    /// PKCE material could not be created or restored.
    #[error("PKCE error: {0}")]
    Pkce(#[from] PkceError),

    /// The persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Another transition is already running for this configuration.
    #[error("A flow is already in progress for configuration {config_id}")]
    FlowInProgress {
        /// The busy configuration.
        config_id: String,
    },

    /// A renewal was overtaken by a logoff; nothing was stored.
    #[error("Renewal cancelled for configuration {config_id}")]
    RenewalCancelled {
        /// The configuration that logged off.
        config_id: String,
    },

    /// A refresh was requested but no refresh token is held.
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// The well-known document lacks an endpoint the operation needs.
    #[error("Endpoint not advertised by the authorization server: {endpoint}")]
    MissingEndpoint {
        /// Name of the missing endpoint.
        endpoint: &'static str,
    },

    /// The token endpoint answered with an unusable body.
    #[error("Invalid token response: {message}")]
    InvalidTokenResponse {
        /// Description of what is wrong with the response.
        message: String,
    },

    /// A URL could not be built.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<TransportError> for OidcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connectivity(message) => Self::Unavailable { message },
            other => Self::Transport(other),
        }
    }
}

impl OidcError {
    /// Creates a new `AuthorizationServer` error.
    #[must_use]
    pub fn authorization_server(error: impl Into<String>, description: Option<String>) -> Self {
        Self::AuthorizationServer {
            error: error.into(),
            description,
        }
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `FlowInProgress` error.
    #[must_use]
    pub fn flow_in_progress(config_id: impl Into<String>) -> Self {
        Self::FlowInProgress {
            config_id: config_id.into(),
        }
    }

    /// Creates a new `RenewalCancelled` error.
    #[must_use]
    pub fn renewal_cancelled(config_id: impl Into<String>) -> Self {
        Self::RenewalCancelled {
            config_id: config_id.into(),
        }
    }

    /// Creates a new `InvalidTokenResponse` error.
    #[must_use]
    pub fn invalid_token_response(message: impl Into<String>) -> Self {
        Self::InvalidTokenResponse {
            message: message.into(),
        }
    }

    /// Creates a new `UnknownConfiguration` error.
    #[must_use]
    pub fn unknown_configuration(config_id: impl Into<String>) -> Self {
        Self::UnknownConfiguration {
            config_id: config_id.into(),
        }
    }

    /// Returns `true` if the failure is connectivity-class and the operation
    /// may succeed when tried again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Discovery(err) => err.is_connectivity(),
            Self::Jwks(err) => err.is_connectivity(),
            _ => false,
        }
    }

    /// Returns `true` if this is a token validation failure.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }

    /// Returns `true` if the authorization server or the callback violated
    /// the protocol. These are terminal for the current callback.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Callback(_)
                | Self::AuthorizationServer { .. }
                | Self::InvalidTokenResponse { .. }
                | Self::MissingEndpoint { .. }
        )
    }

    /// Returns `true` if this is a setup error.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnknownConfiguration { .. }
        )
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::UnknownConfiguration { .. } => {
                ErrorCategory::Configuration
            }
            Self::Callback(_)
            | Self::AuthorizationServer { .. }
            | Self::InvalidTokenResponse { .. }
            | Self::MissingEndpoint { .. } => ErrorCategory::Protocol,
            Self::AuthenticationFailed => ErrorCategory::Validation,
            Self::Unavailable { .. } | Self::Transport(_) => ErrorCategory::Transport,
            Self::Discovery(err) if err.is_connectivity() => ErrorCategory::Transport,
            Self::Jwks(err) if err.is_connectivity() => ErrorCategory::Transport,
            Self::Discovery(_) | Self::Jwks(_) => ErrorCategory::Protocol,
            Self::Storage(_) => ErrorCategory::Infrastructure,
            Self::FlowInProgress { .. }
            | Self::RenewalCancelled { .. }
            | Self::MissingRefreshToken => ErrorCategory::State,
            Self::Pkce(_) | Self::Url(_) => ErrorCategory::Internal,
        }
    }
}

/// Categories of engine errors for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Setup errors.
    Configuration,
    /// Protocol violations by the callback or the authorization server.
    Protocol,
    /// Token validation failures.
    Validation,
    /// Network failures.
    Transport,
    /// Persistence failures.
    Infrastructure,
    /// Operation not allowed in the current flow state.
    State,
    /// Unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Protocol => write!(f, "protocol"),
            Self::Validation => write!(f, "validation"),
            Self::Transport => write!(f, "transport"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::State => write!(f, "state"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
