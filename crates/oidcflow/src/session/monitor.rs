//! Heartbeat loop against the check-session frame.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{CheckSessionChannel, FrameId, FrameMessage, OpenedFrame};
use crate::config::OpenIdConfiguration;
use crate::events::{EventBus, EventKind};
use crate::storage::{ConfigStorage, StorageKey};

/// Unanswered heartbeats tolerated before an escalation is logged.
pub const MAX_OUTSTANDING_MESSAGES: u32 = 3;

/// Point-in-time counters of a monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// Heartbeats posted since the monitor was created.
    pub heartbeats: u64,
    /// Heartbeats posted since the last reply.
    pub outstanding_messages: u32,
    /// Times the outstanding count exceeded the limit.
    pub escalations: u64,
    /// Times the frame was (re)opened.
    pub reinits: u64,
    /// Whether a `changed` reply was seen since the last reset.
    pub check_session_received: bool,
}

#[derive(Default)]
struct MonitorState {
    heartbeats: AtomicU64,
    outstanding: AtomicU32,
    escalations: AtomicU64,
    reinits: AtomicU64,
    check_session_received: AtomicBool,
}

/// Polls the check-session frame of one configuration.
pub struct SessionMonitor {
    config: Arc<OpenIdConfiguration>,
    channel: Arc<dyn CheckSessionChannel>,
    storage: ConfigStorage,
    events: EventBus,
    state: Arc<MonitorState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new(
        config: Arc<OpenIdConfiguration>,
        channel: Arc<dyn CheckSessionChannel>,
        storage: ConfigStorage,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            channel,
            storage,
            events,
            state: Arc::new(MonitorState::default()),
            handle: Mutex::new(None),
        }
    }

    /// Starts polling `check_session_iframe`.
    ///
    /// A no-op returning `false` while a loop is already scheduled. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, check_session_iframe: &Url) -> bool {
        let Ok(mut handle) = self.handle.lock() else {
            return false;
        };
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            trace!(config_id = %self.storage.config_id(), "Session monitor already running");
            return false;
        }

        let task = HeartbeatTask {
            config_id: self.storage.config_id().to_string(),
            client_id: self.config.client_id.clone(),
            url: check_session_iframe.clone(),
            target_origin: check_session_iframe.origin().ascii_serialization(),
            interval: self.config.check_session_interval(),
            reinit: self.config.check_session_reinit(),
            channel: self.channel.clone(),
            storage: self.storage.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
        };
        info!(
            config_id = %task.config_id,
            interval_ms = task.interval.as_millis() as u64,
            "Starting session monitor"
        );
        *handle = Some(tokio::spawn(task.run()));
        true
    }

    /// Stops polling and closes the channel. Takes effect immediately.
    pub fn stop(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
            self.channel.close();
            self.state.outstanding.store(0, Ordering::SeqCst);
            info!(config_id = %self.storage.config_id(), "Session monitor stopped");
        }
    }

    /// Returns `true` while a loop is scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// `true` only when check-session is enabled and the frame reported a
    /// change since the last [`reset`](Self::reset).
    #[must_use]
    pub fn server_state_changed(&self) -> bool {
        self.config.start_check_session && self.state.check_session_received.load(Ordering::SeqCst)
    }

    /// Forgets any observed change.
    pub fn reset(&self) {
        self.state.check_session_received.store(false, Ordering::SeqCst);
        self.state.outstanding.store(0, Ordering::SeqCst);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            heartbeats: self.state.heartbeats.load(Ordering::SeqCst),
            outstanding_messages: self.state.outstanding.load(Ordering::SeqCst),
            escalations: self.state.escalations.load(Ordering::SeqCst),
            reinits: self.state.reinits.load(Ordering::SeqCst),
            check_session_received: self.state.check_session_received.load(Ordering::SeqCst),
        }
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.handle.lock()
            && let Some(handle) = handle.take()
        {
            handle.abort();
        }
    }
}

struct HeartbeatTask {
    config_id: String,
    client_id: String,
    url: Url,
    target_origin: String,
    interval: Duration,
    reinit: Duration,
    channel: Arc<dyn CheckSessionChannel>,
    storage: ConfigStorage,
    events: EventBus,
    state: Arc<MonitorState>,
}

impl HeartbeatTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frame: Option<OpenedFrame> = None;
        let mut last_init: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat(&mut frame, &mut last_init).await;
                }
                message = next_message(&mut frame) => match (message, frame.as_ref()) {
                    (Some(message), Some(current)) => self.handle_message(&message, current.id),
                    _ => {
                        debug!(config_id = %self.config_id, "Check session channel closed");
                        frame = None;
                    }
                },
            }
        }
    }

    async fn heartbeat(&self, frame: &mut Option<OpenedFrame>, last_init: &mut Option<Instant>) {
        if last_init.is_none_or(|at| at.elapsed() >= self.reinit) {
            match self.channel.open(&self.url).await {
                Ok(opened) => {
                    *frame = Some(opened);
                    *last_init = Some(Instant::now());
                    self.state.reinits.fetch_add(1, Ordering::SeqCst);
                    debug!(config_id = %self.config_id, "Check session frame initialized");
                }
                Err(err) => {
                    warn!(config_id = %self.config_id, error = %err, "Failed to open check session frame");
                    return;
                }
            }
        }

        let session_state = match self.storage.read(StorageKey::SessionState) {
            Ok(value) => value,
            Err(err) => {
                warn!(config_id = %self.config_id, error = %err, "Failed to read session state");
                None
            }
        };
        let Some(session_state) = session_state else {
            trace!(config_id = %self.config_id, "No session state, heartbeat skipped");
            return;
        };

        let message = format!("{} {}", self.client_id, session_state);
        if let Err(err) = self.channel.post(&message, &self.target_origin) {
            warn!(config_id = %self.config_id, error = %err, "Heartbeat not delivered");
            return;
        }
        self.state.heartbeats.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.state.outstanding.fetch_add(1, Ordering::SeqCst) + 1;

        if outstanding > MAX_OUTSTANDING_MESSAGES {
            self.state.escalations.fetch_add(1, Ordering::SeqCst);
            warn!(
                config_id = %self.config_id,
                outstanding,
                "Check session frame is not answering"
            );
        }
    }

    fn handle_message(&self, message: &FrameMessage, frame: FrameId) {
        if message.origin != self.target_origin || message.source != frame {
            trace!(
                config_id = %self.config_id,
                origin = %message.origin,
                source = message.source.0,
                "Ignoring message from another sender"
            );
            return;
        }

        match message.data.as_str() {
            "unchanged" => {
                self.state.outstanding.store(0, Ordering::SeqCst);
                trace!(config_id = %self.config_id, "Session unchanged");
            }
            "changed" => {
                self.state.outstanding.store(0, Ordering::SeqCst);
                self.state.check_session_received.store(true, Ordering::SeqCst);
                info!(config_id = %self.config_id, "Session changed at the authorization server");
                self.events.publish(
                    &self.config_id,
                    EventKind::CheckSessionReceived(message.data.clone()),
                );
            }
            "error" => {
                self.state.outstanding.store(0, Ordering::SeqCst);
                warn!(config_id = %self.config_id, "Check session frame reported an error");
                self.events.publish(
                    &self.config_id,
                    EventKind::CheckSessionReceived(message.data.clone()),
                );
            }
            other => {
                debug!(config_id = %self.config_id, data = %other, "Unrecognized check session reply");
            }
        }
    }
}

async fn next_message(frame: &mut Option<OpenedFrame>) -> Option<FrameMessage> {
    match frame {
        Some(frame) => frame.messages.recv().await,
        None => std::future::pending().await,
    }
}
