//! Periodic token expiry check.
//!
//! While a principal is authorized, a background task wakes up every
//! `token_refresh_interval_seconds` and asks the orchestrator whether the
//! held tokens are about to expire. The orchestrator decides with
//! [`renewal_due`] and starts a refresh or a silent renew.

use std::sync::{Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::token::expires_within;

/// Why a renewal is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// The access token expires within the renewal offset.
    AccessTokenExpiring,
    /// The ID token expires within the renewal offset.
    IdTokenExpiring,
}

/// Decides whether held tokens need renewing at `now`.
///
/// `access_expires_at` and `id_token_exp` are Unix seconds. The ID token is
/// only considered when `include_id_token` is set. The access token is
/// checked first.
#[must_use]
pub fn renewal_due(
    access_expires_at: Option<i64>,
    id_token_exp: Option<i64>,
    offset_seconds: u64,
    include_id_token: bool,
    now: OffsetDateTime,
) -> Option<RenewalReason> {
    if access_expires_at.is_some_and(|exp| expires_within(exp, offset_seconds, now)) {
        return Some(RenewalReason::AccessTokenExpiring);
    }
    if include_id_token && id_token_exp.is_some_and(|exp| expires_within(exp, offset_seconds, now)) {
        return Some(RenewalReason::IdTokenExpiring);
    }
    None
}

/// Target of the periodic check.
#[async_trait]
pub(crate) trait ExpiryCheck: Send + Sync {
    async fn check_expiry(&self);
}

/// Runs the periodic check for one configuration.
#[derive(Debug)]
pub struct TokenRefreshScheduler {
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TokenRefreshScheduler {
    /// Creates a stopped scheduler.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Starts checking `target` every interval. A no-op returning `false`
    /// while already running. The loop ends once `target` is dropped.
    pub(crate) fn start(&self, config_id: &str, target: Weak<dyn ExpiryCheck>) -> bool {
        let Ok(mut handle) = self.handle.lock() else {
            return false;
        };
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let period = self.interval;
        let config_id = config_id.to_string();
        tracing::debug!(config_id = %config_id, period_secs = period.as_secs(), "Starting token check");
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    tracing::debug!(config_id = %config_id, "Token check target dropped");
                    break;
                };
                target.check_expiry().await;
            }
        }));
        true
    }

    /// Stops the loop. Takes effect immediately.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
    }

    /// Returns `true` while the loop is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for TokenRefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
