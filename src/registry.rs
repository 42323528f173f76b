//! # Connection Registry
//!
//! Owns the map from live connections to their sessions and routes every
//! connection event to the right session.
//!
//! ## Locking:
//! The session map is the only structure shared between connection actors.
//! Registration and removal happen under its write lock, so concurrent
//! open/close of the same connection cannot double-register or double-tear
//! down. Frame handling only takes the read lock long enough to clone the
//! session handle; the session itself is then locked on its own, so one slow
//! connection never blocks another.

use crate::audio::session::{
    Session, SessionBackends, SessionIdentity, SessionSettings, SessionSummary,
};
use crate::protocol::{ClientSink, DisconnectNotice};
use crate::speech::{WindowEvent, WindowEventReceiver};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum UpgradeError {
    #[error("malformed upgrade path '{path}': expected /{{channelId}}/{{transactionId}}")]
    MalformedPath { path: String },
}

/// Channel and transaction identifiers taken from the upgrade path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingIds {
    pub channel_id: String,
    pub transaction_id: String,
}

impl RoutingIds {
    /// Parse `/{channelId}/{transactionId}/...`.
    ///
    /// Empty segments are skipped and any query string is ignored. Fewer than
    /// two remaining segments is a malformed request.
    pub fn from_path(path: &str) -> Result<Self, UpgradeError> {
        let route = path.split('?').next().unwrap_or_default();
        let mut segments = route.split('/').filter(|segment| !segment.is_empty());

        match (segments.next(), segments.next()) {
            (Some(channel_id), Some(transaction_id)) => Ok(Self {
                channel_id: channel_id.to_string(),
                transaction_id: transaction_id.to_string(),
            }),
            _ => Err(UpgradeError::MalformedPath {
                path: path.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One upgraded socket, as seen by the registry.
///
/// Created after a successful upgrade and never reused; a reconnect is a new
/// `Connection` with a new id.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub routing: RoutingIds,
    /// `audiohook-session-id` header, if the client sent one
    pub session_id: Option<String>,
    pub url: String,
    state: ConnectionState,
}

impl Connection {
    pub fn new(routing: RoutingIds, session_id: Option<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing,
            session_id,
            url: url.into(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// The client started the close handshake; later frames are dropped.
    pub fn begin_closing(&mut self) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Closing;
        }
    }
}

/// Inbound WebSocket data frame.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Binary(&'a [u8]),
    Text(&'a str),
}

/// Result of `on_connection_open`.
#[derive(Debug)]
pub enum OpenOutcome {
    /// Session registered; recognizer events for it arrive on the receiver
    Created(WindowEventReceiver),
    /// A session already exists for this connection; nothing changed
    AlreadyRegistered,
    /// The upgrade carried no `audiohook-session-id`
    MissingSessionId,
    /// `max_concurrent_sessions` sessions are already live
    CapacityReached,
}

/// Result of `on_frame`.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Delivered,
    /// Connection is no longer open
    Dropped,
    /// No session for this connection; the notice must be sent to the client
    Rejected(DisconnectNotice),
}

#[derive(Debug, Default)]
struct RegistryCounters {
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    frames_rejected: AtomicU64,
    frames_dropped: AtomicU64,
    teardown_failures: AtomicU64,
    upgrades_rejected: AtomicU64,
}

/// Point-in-time copy of the registry counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub max_concurrent_sessions: usize,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub frames_rejected: u64,
    pub frames_dropped: u64,
    pub teardown_failures: u64,
    pub upgrades_rejected: u64,
}

pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    settings: RwLock<SessionSettings>,
    backends: SessionBackends,
    counters: RegistryCounters,
}

impl ConnectionRegistry {
    pub fn new(settings: SessionSettings, backends: SessionBackends) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings: RwLock::new(settings),
            backends,
            counters: RegistryCounters::default(),
        }
    }

    /// Replace the settings used for sessions created from now on.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self.settings.write() = settings;
    }

    pub fn record_upgrade_rejected(&self) {
        self.counters.upgrades_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a session for a freshly upgraded connection.
    ///
    /// Marks the connection `Open`. Calling this again for a connection that
    /// already has a session is a no-op.
    pub fn on_connection_open(
        &self,
        connection: &mut Connection,
        client: Arc<dyn ClientSink>,
    ) -> OpenOutcome {
        if connection.state == ConnectionState::Connecting {
            connection.state = ConnectionState::Open;
        }

        let Some(session_id) = connection.session_id.clone() else {
            warn!(
                connection_id = %connection.id,
                channel_id = %connection.routing.channel_id,
                "Connection opened without audiohook-session-id; frames will be rejected"
            );
            return OpenOutcome::MissingSessionId;
        };

        let settings = self.settings.read().clone();
        let mut sessions = self.sessions.write();

        if sessions.contains_key(&connection.id) {
            debug!(connection_id = %connection.id, "Session already registered");
            return OpenOutcome::AlreadyRegistered;
        }

        if sessions.len() >= settings.max_concurrent_sessions {
            warn!(
                connection_id = %connection.id,
                session_id = %session_id,
                max = settings.max_concurrent_sessions,
                "Maximum concurrent sessions reached"
            );
            return OpenOutcome::CapacityReached;
        }

        let identity = SessionIdentity {
            connection_id: connection.id,
            session_id,
            routing: connection.routing.clone(),
            url: connection.url.clone(),
        };
        let (session, events) = Session::new(identity, &settings, &self.backends, client);
        sessions.insert(connection.id, Arc::new(Mutex::new(session)));
        self.counters.sessions_created.fetch_add(1, Ordering::Relaxed);

        OpenOutcome::Created(events)
    }

    /// Route one data frame to the connection's session.
    pub fn on_frame(&self, connection: &Connection, frame: Frame<'_>) -> FrameOutcome {
        if !connection.is_open() {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                connection_id = %connection.id,
                state = ?connection.state,
                "Frame on non-open connection dropped"
            );
            return FrameOutcome::Dropped;
        }

        let Some(session) = self.session(connection.id) else {
            self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection_id = %connection.id,
                channel_id = %connection.routing.channel_id,
                "Frame rejected: session does not exist"
            );
            return FrameOutcome::Rejected(
                DisconnectNotice::session_missing()
                    .with_detail("channel_id", connection.routing.channel_id.as_str())
                    .with_detail("transaction_id", connection.routing.transaction_id.as_str()),
            );
        };

        let mut session = session.lock();
        match frame {
            Frame::Binary(bytes) => session.process_binary_message(
                bytes,
                &connection.routing.channel_id,
                &connection.routing.transaction_id,
            ),
            Frame::Text(text) => session.process_text_message(text),
        }
        FrameOutcome::Delivered
    }

    /// Deliver a recognizer event to the connection's session, if it still exists.
    pub fn on_window_event(&self, connection: &Connection, event: WindowEvent) {
        match self.session(connection.id) {
            Some(session) => session.lock().handle_window_event(event),
            None => debug!(
                connection_id = %connection.id,
                window = event.window,
                "Recognizer event for unknown session discarded"
            ),
        }
    }

    /// Transport failure: force the connection through the close path.
    pub fn on_connection_error(&self, connection: &mut Connection, error: &str) -> bool {
        warn!(connection_id = %connection.id, error, "Connection error; closing");
        self.on_connection_close(connection)
    }

    /// Remove and destroy the connection's session.
    ///
    /// Returns whether a session was removed. The entry leaves the map before
    /// teardown runs, and teardown failures are logged, never propagated.
    pub fn on_connection_close(&self, connection: &mut Connection) -> bool {
        if connection.state != ConnectionState::Closed {
            connection.state = ConnectionState::Closing;
        }

        let removed = self.sessions.write().remove(&connection.id);
        connection.state = ConnectionState::Closed;

        let Some(session) = removed else {
            return false;
        };

        self.counters.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
        let mut session = session.lock();
        if let Err(err) = session.close() {
            self.counters.teardown_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                connection_id = %connection.id,
                session_id = %session.session_id(),
                error = %err,
                "Session teardown failed"
            );
        }
        info!(
            connection_id = %connection.id,
            session_id = %session.session_id(),
            "Session destroyed"
        );
        true
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let handles: Vec<_> = self.sessions.read().values().cloned().collect();
        handles.iter().map(|s| s.lock().summary()).collect()
    }

    /// Close every live session; used at shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        let count = drained.len();

        for (connection_id, session) in drained {
            self.counters.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = session.lock().close() {
                self.counters.teardown_failures.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = %connection_id, error = %err, "Session teardown failed");
            }
        }
        count
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.active_session_count(),
            max_concurrent_sessions: self.settings.read().max_concurrent_sessions,
            sessions_created: self.counters.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.counters.sessions_destroyed.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            teardown_failures: self.counters.teardown_failures.load(Ordering::Relaxed),
            upgrades_rejected: self.counters.upgrades_rejected.load(Ordering::Relaxed),
        }
    }

    fn session(&self, connection_id: Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(&connection_id).cloned()
    }
}
