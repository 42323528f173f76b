//! # Gateway Wire Messages
//!
//! JSON messages exchanged on the text side of an AudioHook connection, and
//! the outbound channel sessions use to reach their client.
//!
//! ## Message Flow:
//! - **Client → Server**: binary frames carry audio; text frames carry a
//!   small JSON envelope (`ping`, `synthesize`, `close`)
//! - **Server → Client**: `transcript`, `disconnect`, `error` and `pong`
//!   messages as JSON text, synthesized audio as binary frames

use actix::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages a client may send in a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level liveness check
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    /// Ask the gateway to speak `text` back to the caller
    Synthesize { text: String },
    /// Client is done with the session
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Messages the gateway sends as text frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Recognized text for one completed window
    Transcript {
        session_id: String,
        window: u64,
        text: String,
        /// Confidence score (0.0 to 1.0)
        confidence: f32,
    },
    /// The gateway is ending, or refusing, the conversation
    Disconnect {
        reason: String,
        message: String,
        details: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Non-fatal problem with a request or with audio processing
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Reply to a client `ping`
    Pong { timestamp: u64 },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
            session_id,
        }
    }

    /// Serialize into a text frame.
    pub fn to_outbound(&self) -> Option<Outbound> {
        serde_json::to_string(self).ok().map(Outbound::Text)
    }
}

/// Structured disconnect payload: reason code, human-readable message,
/// open details map.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectNotice {
    pub reason: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl DisconnectNotice {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Notice for a frame that arrived on a connection without a session.
    pub fn session_missing() -> Self {
        Self::new("error", "Session does not exist.")
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn into_message(self, session_id: Option<String>) -> ServerMessage {
        ServerMessage::Disconnect {
            reason: self.reason,
            message: self.message,
            details: self.details,
            session_id,
        }
    }
}

/// Something the connection actor should write to its socket.
#[derive(Debug, Clone, PartialEq, Message)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    /// Close the WebSocket with an optional description
    Close(Option<String>),
}

/// Outbound path from a session to its client.
///
/// Sessions never hold the socket itself. Production code hands them the
/// connection actor's `Recipient<Outbound>`.
pub trait ClientSink: Send + Sync {
    fn send(&self, message: Outbound);
}

impl ClientSink for Recipient<Outbound> {
    fn send(&self, message: Outbound) {
        self.do_send(message);
    }
}
