//! WebSocket session handle
//!
//! A `Session` represents one established connection. It is handed to every
//! lifecycle callback and is used to send frames back over the connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use uuid::Uuid;

/// Errors that can occur when using a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(Uuid),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Structured reason attached to a connection close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code (RFC 6455 section 7.4)
    pub code: u16,
    /// Human-readable close phrase
    pub phrase: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Create a close reason from a code and phrase
    pub fn new(code: u16, phrase: impl Into<String>) -> Self {
        Self {
            code,
            phrase: phrase.into(),
        }
    }

    /// Normal closure (1000)
    pub fn normal(phrase: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, phrase)
    }

    /// Abnormal closure (1006), used when the connection dropped without a close frame
    pub fn abnormal(phrase: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL, phrase)
    }

    /// Whether the connection ended cleanly (1000 or 1001)
    pub fn is_normal(&self) -> bool {
        self.code == Self::NORMAL || self.code == Self::GOING_AWAY
    }

    /// Codes 1005, 1006 and 1015 must never be sent on the wire
    pub fn is_sendable(&self) -> bool {
        !matches!(self.code, 1005 | 1006 | 1015)
    }

    /// Convert into a tungstenite close frame, if the code may be sent
    pub(crate) fn to_close_frame(&self) -> Option<CloseFrame<'static>> {
        if !self.is_sendable() {
            return None;
        }
        Some(CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.phrase.clone().into(),
        })
    }
}

impl From<CloseFrame<'_>> for CloseReason {
    fn from(frame: CloseFrame<'_>) -> Self {
        Self::new(u16::from(frame.code), frame.reason.into_owned())
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.phrase.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.phrase)
        }
    }
}

/// Frames queued by a session for the connection thread to write
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close(CloseReason),
}

struct SessionInner {
    id: Uuid,
    endpoint_uri: String,
    subprotocol: Option<String>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

/// Handle to one established WebSocket connection
///
/// Cloning is cheap; every clone refers to the same connection. Two sessions
/// compare equal when they refer to the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue
    pub(crate) fn new(
        endpoint_uri: impl Into<String>,
        subprotocol: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                endpoint_uri: endpoint_uri.into(),
                subprotocol,
                outbound_tx,
                open: AtomicBool::new(true),
            }),
        };
        (session, outbound_rx)
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Get the URI this session is connected to
    pub fn endpoint_uri(&self) -> &str {
        &self.inner.endpoint_uri
    }

    /// Subprotocol accepted by the server during the handshake
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    /// Check if the session is still open
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }

    /// Queue a text frame
    pub fn send_text(&self, text: impl Into<String>) -> SessionResult<()> {
        self.enqueue(Outbound::Text(text.into()))
    }

    /// Queue a binary frame
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> SessionResult<()> {
        self.enqueue(Outbound::Binary(data.into()))
    }

    /// Request the connection be closed with the given reason
    ///
    /// The close callback fires on the connection thread once the close
    /// has been written.
    pub fn close(&self, reason: CloseReason) -> SessionResult<()> {
        self.enqueue(Outbound::Close(reason))
    }

    fn enqueue(&self, frame: Outbound) -> SessionResult<()> {
        if !self.is_open() {
            return Err(SessionError::Closed(self.inner.id));
        }
        self.inner
            .outbound_tx
            .send(frame)
            .map_err(|_| SessionError::Closed(self.inner.id))
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("endpoint_uri", &self.inner.endpoint_uri)
            .field("subprotocol", &self.inner.subprotocol)
            .field("open", &self.is_open())
            .finish()
    }
}
