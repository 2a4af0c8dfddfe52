//! Shared client endpoint
//!
//! Holds what every concrete endpoint needs: the client to notify, the
//! target URI, the connection thread label and the live session. Concrete
//! endpoints compose a `WebsocketClientEndpoint` and forward their transport
//! callbacks into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{CloseReason, Session, SessionError};
use super::transport::{self, ConnectionHandle, EndpointHandler, TransportError};

/// Errors that can occur during endpoint operations
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint {0} is not connected")]
    NotConnected(String),

    #[error("Endpoint {0} is already connected")]
    AlreadyConnected(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Result type for endpoint operations
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Capability notified of connection lifecycle and decoded messages
pub trait WebsocketClient: Send + Sync {
    fn on_open(&self, session: &Session);

    fn on_close(&self, session: &Session, reason: &CloseReason);

    fn on_message(&self, message: &str);

    /// The connection could not be established
    fn on_connect_error(&self, _error: &str) {}
}

/// Connection plumbing shared by concrete endpoints
pub struct WebsocketClientEndpoint {
    client: Arc<dyn WebsocketClient>,
    endpoint_uri: String,
    thread_name: String,
    session: RwLock<Option<Session>>,
    connection: Mutex<Option<ConnectionHandle>>,
    /// Set from `connect` until the close callback or a handshake failure
    active: AtomicBool,
}

impl WebsocketClientEndpoint {
    /// Create an endpoint; nothing is connected until `connect`
    pub fn new(
        client: Arc<dyn WebsocketClient>,
        endpoint_uri: impl Into<String>,
        thread_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint_uri: endpoint_uri.into(),
            thread_name: thread_name.into(),
            session: RwLock::new(None),
            connection: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn endpoint_uri(&self) -> &str {
        &self.endpoint_uri
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Current session, if the connection is open
    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_open())
    }

    /// Whether a connection is being established or is open
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the connection, dispatching transport events to `handler`
    pub fn connect(&self, handler: Arc<dyn EndpointHandler>) -> EndpointResult<()> {
        let mut connection = self.connection.lock().unwrap_or_else(|e| e.into_inner());

        let running = connection.as_ref().is_some_and(|h| !h.is_finished());
        if running && self.active.load(Ordering::SeqCst) {
            return Err(EndpointError::AlreadyConnected(self.endpoint_uri.clone()));
        }

        self.active.store(true, Ordering::SeqCst);
        match transport::connect(handler, &self.endpoint_uri, &self.thread_name) {
            Ok(handle) => {
                *connection = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Block until the connection thread exits
    pub fn wait(&self) -> EndpointResult<()> {
        let handle = self
            .connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => Ok(handle.join()?),
            None => Ok(()),
        }
    }

    /// Send a text frame on the current session
    pub fn send_message(&self, message: impl Into<String>) -> EndpointResult<()> {
        let session = self
            .session()
            .ok_or_else(|| EndpointError::NotConnected(self.endpoint_uri.clone()))?;
        session.send_text(message)?;
        Ok(())
    }

    /// Close the current session normally; no-op when not connected
    pub fn close(&self) -> EndpointResult<()> {
        match self.session() {
            Some(session) if session.is_open() => {
                session.close(CloseReason::normal("client disconnect"))?;
                Ok(())
            }
            _ => {
                debug!("Close requested for {} with no open session", self.endpoint_uri);
                Ok(())
            }
        }
    }

    pub fn on_open(&self, session: &Session) {
        info!(
            "Endpoint {} opened session {}",
            self.endpoint_uri,
            session.id()
        );
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.client.on_open(session);
    }

    pub fn on_close(&self, session: &Session, reason: &CloseReason) {
        if reason.is_normal() {
            info!("Endpoint {} closed: {}", self.endpoint_uri, reason);
        } else {
            warn!("Endpoint {} closed: {}", self.endpoint_uri, reason);
        }
        {
            let mut current = self.session.write().unwrap_or_else(|e| e.into_inner());
            if current.as_ref() == Some(session) {
                *current = None;
            }
        }
        self.active.store(false, Ordering::SeqCst);
        self.client.on_close(session, reason);
    }

    pub fn on_message(&self, message: &str) {
        self.client.on_message(message);
    }

    pub fn on_connect_error(&self, error: &TransportError) {
        warn!("Endpoint {} failed to connect: {}", self.endpoint_uri, error);
        self.active.store(false, Ordering::SeqCst);
        self.client.on_connect_error(&error.to_string());
    }
}
