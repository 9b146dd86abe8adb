//! # oidcflow
//!
//! Client-side OpenID Connect / OAuth2 engine for public clients.
//!
//! This crate provides:
//! - Authorization code flow with PKCE, implicit flow and pushed
//!   authorization requests
//! - ID token validation (signature, issuer, audience, expiry, nonce, hashes)
//! - Silent renew through a hidden frame or the refresh token grant
//! - Check-session monitoring of the server-side session
//! - User info, token revocation and logoff
//!
//! ## Overview
//!
//! A [`FlowOrchestrator`] drives every flow of one configuration and owns its
//! [`AuthorizedState`]. Hosts plug in an [`HttpTransport`], a
//! [`StoragePersistence`] backend, a [`Navigator`] for redirects and,
//! optionally, a [`CheckSessionChannel`]. [`OidcClient`] holds one
//! orchestrator per configuration.
//!
//! ## Modules
//!
//! - [`config`] - Client configuration and file loading
//! - [`flow`] - The flow orchestrator
//! - [`validation`] - ID token validation rules
//! - [`nonce`] - One-time `state` and `nonce` values
//! - [`callback`] - Redirect callback parsing
//! - [`session`] - Check-session monitor
//! - [`renew`] - Periodic token expiry check
//! - [`discovery`] and [`jwks`] - Authorization server metadata and keys
//! - [`storage`] - Storage backends and namespaced keys
//! - [`transport`] - HTTP transport abstraction
//! - [`events`] - Public event bus

pub mod callback;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod flow;
pub mod jwks;
pub mod nonce;
pub mod pkce;
pub mod renew;
pub mod session;
pub mod storage;
pub mod token;
pub mod transport;
pub mod url;
pub mod validation;

#[cfg(test)]
mod testing;

pub use callback::{CallbackError, CallbackParams, CallbackParser};
pub use client::{OidcClient, OidcClientBuilder};
pub use config::{ConfigError, LogoffMethod, OidcSettings, OpenIdConfiguration, ResponseType};
pub use discovery::{AuthWellKnownEndpoints, DiscoveryError};
pub use error::{ErrorCategory, OidcError, OidcResult};
pub use events::{EventBus, EventKind, OidcEvent};
pub use flow::{
    AuthOutcome, AuthorizedState, FlowOrchestrator, FlowOrchestratorBuilder, FlowState,
    LoginOptions, LogoffOutcome, Navigator,
};
pub use nonce::{NonceStateStore, TokenKind};
pub use session::{
    ChannelError, CheckSessionChannel, FrameId, FrameMessage, OpenedFrame, SessionMonitor,
};
pub use storage::{JsonFileStorage, MemoryStorage, StorageError, StorageKey, StoragePersistence};
pub use token::{IdTokenClaims, TokenResponse};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use validation::{FailedCheck, TokenValidator, ValidationOutcome};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use oidcflow::prelude::*;
/// ```
pub mod prelude {
    pub use crate::OidcResult;
    pub use crate::client::OidcClient;
    pub use crate::config::{LogoffMethod, OpenIdConfiguration, ResponseType};
    pub use crate::error::{ErrorCategory, OidcError};
    pub use crate::events::{EventBus, EventKind, OidcEvent};
    pub use crate::flow::{
        AuthOutcome, AuthorizedState, FlowOrchestrator, LoginOptions, LogoffOutcome, Navigator,
    };
    pub use crate::session::{CheckSessionChannel, FrameId, FrameMessage, OpenedFrame};
    pub use crate::storage::{JsonFileStorage, MemoryStorage, StoragePersistence};
    pub use crate::transport::{HttpTransport, ReqwestTransport};
}
