//! Persistent key/value storage.
//!
//! The engine keeps everything it must remember between a redirect and its
//! callback (pending nonces and states, PKCE verifiers, tokens, cached
//! discovery data) in a [`StoragePersistence`] collaborator. Keys are
//! namespaced per configuration: `{config_id}_{key}`.
//!
//! # Implementation Notes
//!
//! - Operations are synchronous so that local logoff completes without
//!   awaiting anything.
//! - Values are opaque strings; the engine stores JSON.
//! - Implementations must be safe to share across tasks.

mod file;
mod memory;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use file::JsonFileStorage;
pub use memory::MemoryStorage;

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be read or written.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized.
    #[error("stored value for {key} is malformed: {message}")]
    Serialization {
        /// Namespaced key of the malformed value.
        key: String,
        /// Serializer message.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// A synchronous key/value store.
pub trait StoragePersistence: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Keys the engine stores per configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// The current access token.
    AuthzData,
    /// The raw token response of the last successful flow.
    AuthnResult,
    /// Unix time (seconds) at which the access token expires.
    AccessTokenExpiresAt,
    /// Cached well-known endpoints.
    AuthWellKnownEndpoints,
    /// Cached signing keys.
    JwtKeys,
    /// User info claims.
    UserData,
    /// The `session_state` of the current AS session.
    SessionState,
    /// Pending nonces.
    Nonces,
    /// Pending states.
    States,
    /// Durable flow intents keyed by state.
    FlowIntents,
    /// Set while a silent renew or refresh is running.
    SilentRenewRunning,
}

impl StorageKey {
    /// The key name without the configuration prefix.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthzData => "authzData",
            Self::AuthnResult => "authnResult",
            Self::AccessTokenExpiresAt => "access_token_expires_at",
            Self::AuthWellKnownEndpoints => "authWellKnownEndPoints",
            Self::JwtKeys => "jwtKeys",
            Self::UserData => "userData",
            Self::SessionState => "session_state",
            Self::Nonces => "authNonces",
            Self::States => "authStateControls",
            Self::FlowIntents => "flowIntents",
            Self::SilentRenewRunning => "storageSilentRenewRunning",
        }
    }

    /// Keys holding the authentication of the current principal.
    pub const AUTH_DATA: [StorageKey; 6] = [
        Self::AuthzData,
        Self::AuthnResult,
        Self::AccessTokenExpiresAt,
        Self::UserData,
        Self::SessionState,
        Self::SilentRenewRunning,
    ];
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage view scoped to one configuration.
#[derive(Clone)]
pub struct ConfigStorage {
    config_id: String,
    inner: Arc<dyn StoragePersistence>,
}

impl fmt::Debug for ConfigStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStorage")
            .field("config_id", &self.config_id)
            .finish_non_exhaustive()
    }
}

impl ConfigStorage {
    /// Creates a view over `inner` prefixed with `config_id`.
    #[must_use]
    pub fn new(config_id: impl Into<String>, inner: Arc<dyn StoragePersistence>) -> Self {
        Self {
            config_id: config_id.into(),
            inner,
        }
    }

    /// The configuration this view belongs to.
    #[must_use]
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// The namespaced key, e.g. `spa_authzData`.
    #[must_use]
    pub fn namespaced(&self, key: StorageKey) -> String {
        format!("{}_{}", self.config_id, key.as_str())
    }

    /// Reads a raw string value.
    pub fn read(&self, key: StorageKey) -> Result<Option<String>, StorageError> {
        self.inner.read(&self.namespaced(key))
    }

    /// Writes a raw string value.
    pub fn write(&self, key: StorageKey, value: &str) -> Result<(), StorageError> {
        self.inner.write(&self.namespaced(key), value)
    }

    /// Removes a value.
    pub fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        self.inner.remove(&self.namespaced(key))
    }

    /// Reads and deserializes a JSON value.
    pub fn read_json<T: DeserializeOwned>(&self, key: StorageKey) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.read(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Serialization {
                key: self.namespaced(key),
                message: e.to_string(),
            })
    }

    /// Serializes and writes a JSON value.
    pub fn write_json<T: Serialize>(&self, key: StorageKey, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|e| StorageError::Serialization {
            key: self.namespaced(key),
            message: e.to_string(),
        })?;
        self.write(key, &raw)
    }

    /// Removes every key in `keys`.
    pub fn remove_all(&self, keys: &[StorageKey]) -> Result<(), StorageError> {
        for key in keys {
            self.remove(*key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_per_configuration() {
        let backend: Arc<dyn StoragePersistence> = Arc::new(MemoryStorage::new());
        let a = ConfigStorage::new("client-a", backend.clone());
        let b = ConfigStorage::new("client-b", backend.clone());

        a.write(StorageKey::AuthzData, "token-a").unwrap();
        b.write(StorageKey::AuthzData, "token-b").unwrap();

        assert_eq!(a.namespaced(StorageKey::AuthzData), "client-a_authzData");
        assert_eq!(
            backend.read("client-a_authzData").unwrap().as_deref(),
            Some("token-a")
        );
        assert_eq!(
            b.read(StorageKey::AuthzData).unwrap().as_deref(),
            Some("token-b")
        );
    }

    #[test]
    fn test_json_roundtrip_and_malformed_value() {
        let backend: Arc<dyn StoragePersistence> = Arc::new(MemoryStorage::new());
        let storage = ConfigStorage::new("spa", backend);

        storage
            .write_json(StorageKey::UserData, &serde_json::json!({"sub": "alice"}))
            .unwrap();
        let value: serde_json::Value = storage.read_json(StorageKey::UserData).unwrap().unwrap();
        assert_eq!(value["sub"], "alice");

        storage.write(StorageKey::UserData, "not json").unwrap();
        let result = storage.read_json::<serde_json::Value>(StorageKey::UserData);
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[test]
    fn test_remove_all() {
        let backend: Arc<dyn StoragePersistence> = Arc::new(MemoryStorage::new());
        let storage = ConfigStorage::new("spa", backend);
        storage.write(StorageKey::AuthzData, "a").unwrap();
        storage.write(StorageKey::SessionState, "s").unwrap();
        storage.write(StorageKey::JwtKeys, "k").unwrap();

        storage.remove_all(&StorageKey::AUTH_DATA).unwrap();

        assert!(storage.read(StorageKey::AuthzData).unwrap().is_none());
        assert!(storage.read(StorageKey::SessionState).unwrap().is_none());
        assert_eq!(storage.read(StorageKey::JwtKeys).unwrap().as_deref(), Some("k"));
    }
}
