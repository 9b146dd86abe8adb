//! One-time `state` and `nonce` values.
//!
//! `state` binds a callback to the request that produced it (CSRF) and
//! `nonce` binds an ID token to that request (replay). Both are issued
//! before the redirect, persisted, and consumed exactly once when the
//! callback is processed.
//!
//! Pending values live in storage as a JSON object keyed by their creation
//! time in milliseconds. Values older than [`NONCE_STATE_TTL`] are purged on
//! every access; there is no background timer.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::storage::{ConfigStorage, StorageError, StorageKey};
use crate::token::random_token;

/// Lifetime of an unconsumed value.
pub const NONCE_STATE_TTL: Duration = Duration::from_millis(3_600_000);

/// Which kind of one-time value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Anti-replay value carried in the ID token.
    Nonce,
    /// Anti-CSRF value carried in the callback.
    State,
}

impl TokenKind {
    fn storage_key(self) -> StorageKey {
        match self {
            Self::Nonce => StorageKey::Nonces,
            Self::State => StorageKey::States,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Nonce => "nonce",
            Self::State => "state",
        }
    }
}

/// A pending value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceStateEntry {
    /// The random value.
    pub value: String,
    /// Creation time, Unix milliseconds.
    pub created_at: i64,
}

type EntryMap = BTreeMap<i64, Vec<String>>;

/// Issues and consumes `state` and `nonce` values for one configuration.
#[derive(Debug)]
pub struct NonceStateStore {
    storage: ConfigStorage,
    // Serializes read-modify-write cycles against storage.
    lock: Mutex<()>,
}

impl NonceStateStore {
    /// Creates a store over the configuration's storage.
    #[must_use]
    pub fn new(storage: ConfigStorage) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Issues a fresh random value and records it.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be written.
    pub fn issue(&self, kind: TokenKind) -> Result<String, StorageError> {
        self.issue_at(kind, OffsetDateTime::now_utc())
    }

    /// Consumes `candidate` if it is pending and not expired.
    ///
    /// Returns `true` exactly once per issued value.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read or written.
    pub fn consume(&self, kind: TokenKind, candidate: &str) -> Result<bool, StorageError> {
        self.consume_at(kind, candidate, OffsetDateTime::now_utc())
    }

    /// Non-expired pending values of `kind`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read or written.
    pub fn pending(&self, kind: TokenKind) -> Result<Vec<NonceStateEntry>, StorageError> {
        self.with_entries(kind, OffsetDateTime::now_utc(), |entries| {
            let pending = entries
                .iter()
                .flat_map(|(created_at, values)| {
                    values.iter().map(|value| NonceStateEntry {
                        value: value.clone(),
                        created_at: *created_at,
                    })
                })
                .collect();
            (pending, false)
        })
    }

    /// Drops every pending value of both kinds.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be written.
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.guard()?;
        self.storage.remove(StorageKey::Nonces)?;
        self.storage.remove(StorageKey::States)
    }

    pub(crate) fn issue_at(
        &self,
        kind: TokenKind,
        now: OffsetDateTime,
    ) -> Result<String, StorageError> {
        let value = random_token();
        let created_at = unix_millis(now);
        self.with_entries(kind, now, |entries| {
            entries.entry(created_at).or_default().push(value.clone());
            ((), true)
        })?;
        tracing::trace!(
            config_id = %self.storage.config_id(),
            kind = kind.as_str(),
            "Issued one-time value"
        );
        Ok(value)
    }

    pub(crate) fn consume_at(
        &self,
        kind: TokenKind,
        candidate: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        if candidate.is_empty() {
            return Ok(false);
        }
        let consumed = self.with_entries(kind, now, |entries| {
            let found = entries.iter().find_map(|(created_at, values)| {
                values
                    .iter()
                    .position(|v| v == candidate)
                    .map(|idx| (*created_at, idx))
            });
            match found {
                Some((created_at, idx)) => {
                    if let Some(values) = entries.get_mut(&created_at) {
                        values.remove(idx);
                        if values.is_empty() {
                            entries.remove(&created_at);
                        }
                    }
                    (true, true)
                }
                None => (false, false),
            }
        })?;
        if !consumed {
            tracing::debug!(
                config_id = %self.storage.config_id(),
                kind = kind.as_str(),
                "One-time value unknown, expired or already used"
            );
        }
        Ok(consumed)
    }

    /// Loads the entries of `kind`, drops expired ones, runs `f`, and writes
    /// back when `f` or the purge changed anything.
    fn with_entries<T, F>(&self, kind: TokenKind, now: OffsetDateTime, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut EntryMap) -> (T, bool),
    {
        let _guard = self.guard()?;
        let key = kind.storage_key();
        let mut entries: EntryMap = self.storage.read_json(key)?.unwrap_or_default();

        let ttl = i64::try_from(NONCE_STATE_TTL.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_millis(now).saturating_sub(ttl);
        let before = entries.len();
        entries.retain(|created_at, _| *created_at > cutoff);
        let purged = entries.len() != before;

        let (result, changed) = f(&mut entries);
        if changed || purged {
            if entries.is_empty() {
                self.storage.remove(key)?;
            } else {
                self.storage.write_json(key, &entries)?;
            }
        }
        Ok(result)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.lock
            .lock()
            .map_err(|_| StorageError::backend("nonce store lock poisoned"))
    }
}

fn unix_millis(now: OffsetDateTime) -> i64 {
    i64::try_from(now.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
