//! OpenID Connect Discovery.
//!
//! Loads the authorization server metadata from
//! `{authority}/.well-known/openid-configuration` once per configuration and
//! caches it in storage for the lifetime of the session. A configuration may
//! instead carry static endpoints, in which case nothing is fetched.
//!
//! # Security Considerations
//!
//! - Only https authorities are accepted unless `allow_http` is set.
//! - The `issuer` of the document must match the authority it was fetched
//!   from (trailing slashes ignored).
//!
//! # References
//!
//! - [OpenID Connect Discovery 1.0](https://openid.net/specs/openid-connect-discovery-1_0.html)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::OpenIdConfiguration;
use crate::storage::{ConfigStorage, StorageError, StorageKey};
use crate::transport::{HttpRequest, HttpTransport, TransportError};

/// Errors that can occur during discovery.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The document could not be fetched.
    #[error("failed to fetch discovery document: {0}")]
    Transport(#[from] TransportError),

    /// The document is not valid JSON or lacks required fields.
    #[error("failed to parse discovery document: {0}")]
    Parse(String),

    /// The authority URL is invalid.
    #[error("invalid authority URL: {0}")]
    InvalidAuthority(String),

    /// The issuer in the document does not match the authority.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// The configured authority.
        expected: String,
        /// The issuer in the document.
        actual: String,
    },

    /// The authority scheme is not allowed.
    #[error("invalid URL scheme: {0} (only https is allowed)")]
    InvalidScheme(String),

    /// The cached document could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DiscoveryError {
    /// Returns `true` if the server could not be reached.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_connectivity())
    }
}

/// The endpoints the engine needs, as advertised by the authorization
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthWellKnownEndpoints {
    /// Issuer identifier; ID tokens must carry exactly this `iss`.
    pub issuer: String,

    /// JWK set location.
    pub jwks_uri: String,

    /// Authorization endpoint.
    pub authorization_endpoint: String,

    /// Token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// User info endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    /// RP-initiated logout endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    /// Hidden check-session frame.
    #[serde(
        default,
        rename = "check_session_iframe",
        skip_serializing_if = "Option::is_none"
    )]
    pub check_session_iframe_url: Option<String>,

    /// Token revocation endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// Token introspection endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// Pushed authorization request endpoint.
    #[serde(
        default,
        rename = "pushed_authorization_request_endpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub par_endpoint: Option<String>,
}

/// Builds `{issuer}/.well-known/openid-configuration`, keeping any path of
/// the issuer.
#[must_use]
pub fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{path}/.well-known/openid-configuration"));
    discovery_url.set_query(None);
    discovery_url
}

/// Loads and caches the endpoints of one configuration.
pub struct DiscoveryService {
    config: Arc<OpenIdConfiguration>,
    transport: Arc<dyn HttpTransport>,
    storage: ConfigStorage,
}

impl DiscoveryService {
    /// Creates a discovery service.
    #[must_use]
    pub fn new(
        config: Arc<OpenIdConfiguration>,
        transport: Arc<dyn HttpTransport>,
        storage: ConfigStorage,
    ) -> Self {
        Self {
            config,
            transport,
            storage,
        }
    }

    /// Returns the endpoints: the static override, else the cached
    /// document, else a freshly fetched one.
    ///
    /// # Errors
    ///
    /// Returns an error if fetching or validating the document fails.
    pub async fn get(&self) -> Result<AuthWellKnownEndpoints, DiscoveryError> {
        if let Some(endpoints) = &self.config.auth_well_known_endpoints {
            return Ok(endpoints.clone());
        }
        if let Some(cached) = self.cached()? {
            return Ok(cached);
        }
        self.refresh().await
    }

    /// The cached endpoints, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub fn cached(&self) -> Result<Option<AuthWellKnownEndpoints>, DiscoveryError> {
        if let Some(endpoints) = &self.config.auth_well_known_endpoints {
            return Ok(Some(endpoints.clone()));
        }
        Ok(self.storage.read_json(StorageKey::AuthWellKnownEndpoints)?)
    }

    /// Fetches the document and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority is not allowed, the fetch fails, or
    /// the document does not validate.
    pub async fn refresh(&self) -> Result<AuthWellKnownEndpoints, DiscoveryError> {
        let authority = Url::parse(&self.config.authority)
            .map_err(|e| DiscoveryError::InvalidAuthority(e.to_string()))?;
        self.validate_scheme(&authority)?;

        let discovery_url = build_discovery_url(&authority);
        tracing::debug!(
            config_id = %self.config.config_id(),
            url = %discovery_url,
            "Fetching discovery document"
        );

        let response = self
            .transport
            .send(HttpRequest::get(discovery_url))
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    config_id = %self.config.config_id(),
                    error = %e,
                    "Failed to fetch discovery document"
                );
            })?;

        let endpoints: AuthWellKnownEndpoints = response
            .json()
            .map_err(|e| DiscoveryError::Parse(e.to_string()))?;
        validate_issuer(&endpoints, &authority)?;

        self.storage
            .write_json(StorageKey::AuthWellKnownEndpoints, &endpoints)?;
        tracing::debug!(
            config_id = %self.config.config_id(),
            issuer = %endpoints.issuer,
            "Discovered authorization server"
        );
        Ok(endpoints)
    }

    /// Drops the cached document.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be written.
    pub fn clear(&self) -> Result<(), DiscoveryError> {
        Ok(self.storage.remove(StorageKey::AuthWellKnownEndpoints)?)
    }

    fn validate_scheme(&self, authority: &Url) -> Result<(), DiscoveryError> {
        match authority.scheme() {
            "https" => Ok(()),
            "http" if self.config.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}

fn validate_issuer(endpoints: &AuthWellKnownEndpoints, expected: &Url) -> Result<(), DiscoveryError> {
    let expected_normalized = expected.as_str().trim_end_matches('/');
    let document_normalized = endpoints.issuer.trim_end_matches('/');

    if expected_normalized != document_normalized {
        return Err(DiscoveryError::IssuerMismatch {
            expected: expected_normalized.to_string(),
            actual: document_normalized.to_string(),
        });
    }
    Ok(())
}
