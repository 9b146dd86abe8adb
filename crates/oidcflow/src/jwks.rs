//! Authorization server signing keys.
//!
//! The JWK set is fetched from `jwks_uri` and cached per configuration. When
//! an incoming token names a `kid` that the cached set does not contain, the
//! set is fetched again once (key rotation) before the token is judged.

use std::sync::Arc;

use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::{ConfigStorage, StorageError, StorageKey};
use crate::transport::{HttpRequest, HttpTransport, TransportError};

/// Errors that can occur while loading keys.
#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    /// The key set could not be fetched.
    #[error("failed to fetch JWKS: {0}")]
    Transport(#[from] TransportError),

    /// The key set is not valid JSON.
    #[error("failed to parse JWKS: {0}")]
    Parse(String),

    /// `jwks_uri` is not a URL.
    #[error("invalid JWKS URI: {0}")]
    InvalidUri(String),

    /// The key material cannot be used for verification.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The cached key set could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl JwksError {
    /// Returns `true` if the server could not be reached.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_connectivity())
    }
}

/// One public key of the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtKey {
    /// Key type, `RSA` for keys this client can use.
    pub kty: String,

    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Intended algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Intended use (`sig` or `enc`).
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// RSA modulus, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent, base64url.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl JwtKey {
    /// Returns `true` for RSA keys usable for signature verification.
    #[must_use]
    pub fn is_rsa_signing_key(&self) -> bool {
        self.kty == "RSA"
            && self.key_use.as_deref().is_none_or(|u| u == "sig")
            && self.n.is_some()
            && self.e.is_some()
    }

    /// Builds the verification key.
    ///
    /// # Errors
    ///
    /// Returns `JwksError::InvalidKey` if the modulus or exponent is missing
    /// or malformed.
    pub fn decoding_key(&self) -> Result<DecodingKey, JwksError> {
        let (Some(n), Some(e)) = (&self.n, &self.e) else {
            return Err(JwksError::InvalidKey("missing RSA modulus or exponent".into()));
        };
        DecodingKey::from_rsa_components(n, e).map_err(|err| JwksError::InvalidKey(err.to_string()))
    }
}

/// An ordered set of public keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtKeySet {
    /// Keys in document order.
    pub keys: Vec<JwtKey>,
}

impl JwtKeySet {
    /// Finds the signing key for a token header `kid`.
    ///
    /// Without a `kid` the key is only unambiguous when the set holds
    /// exactly one signing key.
    #[must_use]
    pub fn find(&self, kid: Option<&str>) -> Option<&JwtKey> {
        let mut signing = self.keys.iter().filter(|k| k.is_rsa_signing_key());
        match kid {
            Some(kid) => signing.find(|k| k.kid.as_deref() == Some(kid)),
            None => {
                let first = signing.next();
                if signing.next().is_some() { None } else { first }
            }
        }
    }

    /// Returns `true` if [`find`](Self::find) would succeed.
    #[must_use]
    pub fn has_key(&self, kid: Option<&str>) -> bool {
        self.find(kid).is_some()
    }
}

/// Fetches and caches the key set of one configuration.
pub struct JwksService {
    transport: Arc<dyn HttpTransport>,
    storage: ConfigStorage,
}

impl JwksService {
    /// Creates a key service.
    #[must_use]
    pub fn new(transport: Arc<dyn HttpTransport>, storage: ConfigStorage) -> Self {
        Self { transport, storage }
    }

    /// The cached key set, fetched on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be fetched or parsed.
    pub async fn key_set(&self, jwks_uri: &str) -> Result<JwtKeySet, JwksError> {
        if let Some(cached) = self.cached()? {
            return Ok(cached);
        }
        self.refresh(jwks_uri).await
    }

    /// A key set suitable for a token whose header names `kid`.
    ///
    /// On a cache miss for `kid` the set is fetched again, once. The
    /// returned set may still lack the key; the validator reports that as a
    /// signature failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be fetched or parsed.
    pub async fn key_set_for(&self, jwks_uri: &str, kid: Option<&str>) -> Result<JwtKeySet, JwksError> {
        if let Some(cached) = self.cached()?
            && cached.has_key(kid)
        {
            tracing::trace!(config_id = %self.storage.config_id(), kid = ?kid, "JWKS cache hit");
            return Ok(cached);
        }
        tracing::debug!(config_id = %self.storage.config_id(), kid = ?kid, "JWKS cache miss, fetching");
        self.refresh(jwks_uri).await
    }

    /// Fetches the set and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the set cannot be fetched or parsed.
    pub async fn refresh(&self, jwks_uri: &str) -> Result<JwtKeySet, JwksError> {
        let url = Url::parse(jwks_uri).map_err(|e| JwksError::InvalidUri(e.to_string()))?;
        let response = self.transport.send(HttpRequest::get(url)).await?;
        let key_set: JwtKeySet = response
            .json()
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        if !key_set.keys.iter().any(JwtKey::is_rsa_signing_key) {
            tracing::warn!(
                config_id = %self.storage.config_id(),
                "JWKS contains no RSA signing keys"
            );
        }

        self.storage.write_json(StorageKey::JwtKeys, &key_set)?;
        Ok(key_set)
    }

    /// The cached key set, without fetching.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub fn cached(&self) -> Result<Option<JwtKeySet>, JwksError> {
        Ok(self.storage.read_json(StorageKey::JwtKeys)?)
    }

    /// Drops the cached set.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be written.
    pub fn clear(&self) -> Result<(), JwksError> {
        Ok(self.storage.remove(StorageKey::JwtKeys)?)
    }
}
