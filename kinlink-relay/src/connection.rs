//! Transport-neutral connection handles.
//!
//! A [`ConnectionHandle`] is the only way anything in the relay writes to a
//! device. Frames are queued on an unbounded FIFO channel that a per-socket
//! writer task drains, so queueing never blocks and per-connection order is
//! preserved.

use crate::error::SendError;
use kinlink_types::{ForwardedEnvelope, ServerMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server is going away (shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Handshake claims were unacceptable.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Server is temporarily overloaded.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one physical connection, distinct across reconnects of the
/// same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame read from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Keepalive traffic; answered by the transport.
    Ping,
    /// Peer requested close.
    Close,
}

/// A frame queued for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Close the connection with a code and reason.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Capability to send frames to one connected device.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::next(),
                tx,
            },
            rx,
        )
    }

    /// Identifier of the underlying connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the writer is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a raw text frame.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| SendError::Closed)
    }

    /// Queue a server-originated envelope.
    pub fn send_message(&self, message: &ServerMessage) -> Result<(), SendError> {
        self.send_text(message.to_json()?)
    }

    /// Queue a forwarded envelope.
    pub fn send_forwarded(&self, envelope: &ForwardedEnvelope) -> Result<(), SendError> {
        self.send_text(envelope.to_json()?)
    }

    /// Ask the writer to close the connection.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), SendError> {
        self.tx
            .send(OutboundFrame::Close {
                code,
                reason: reason.into(),
            })
            .map_err(|_| SendError::Closed)
    }
}

/// Current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
