//! Market data stream client
//!
//! Authenticates and subscribes when the connection opens, republishes every
//! decoded message to subscribers, and reconnects after unexpected closes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::endpoint::MarketDataEndpoint;
use super::protocol::{ControlMessage, ProtocolError};
use crate::config::{ConfigError, ReconnectConfig, StreamConfig};
use crate::websocket::{CloseReason, EndpointError, Session, WebsocketClient};

/// Capacity of the message broadcast channel; slower subscribers lag
const MESSAGE_CHANNEL_CAPACITY: usize = 1024;
const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

/// How long shutdown waits for the close handshake
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    /// Connected and sent authentication
    Opened { session_id: Uuid },
    /// Connection closed
    Closed {
        reason: CloseReason,
        will_reconnect: bool,
    },
    /// Handshake failed
    ConnectFailed { error: String, will_reconnect: bool },
}

/// Receives endpoint callbacks on the connection thread
struct MarketDataHandler {
    key_id: String,
    secret_key: String,
    streams: Mutex<BTreeSet<String>>,
    reconnect: ReconnectConfig,
    intentional_close: AtomicBool,
    message_tx: broadcast::Sender<String>,
    lifecycle_tx: broadcast::Sender<Lifecycle>,
}

impl MarketDataHandler {
    fn streams(&self) -> Vec<String> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn send(&self, session: &Session, message: &ControlMessage) {
        let result = message
            .to_json()
            .map_err(ClientError::from)
            .and_then(|json| {
                session
                    .send_text(json)
                    .map_err(|e| ClientError::Endpoint(e.into()))
            });
        match result {
            Ok(()) => debug!("Sent {} request", message.action()),
            Err(e) => error!("Failed to send {} request: {}", message.action(), e),
        }
    }

    fn will_reconnect(&self, reason: Option<&CloseReason>) -> bool {
        self.reconnect.enabled
            && !self.intentional_close.load(Ordering::SeqCst)
            && !reason.is_some_and(CloseReason::is_normal)
    }
}

impl WebsocketClient for MarketDataHandler {
    fn on_open(&self, session: &Session) {
        if self.intentional_close.load(Ordering::SeqCst) {
            info!("Closing session {} opened after disconnect", session.id());
            if let Err(e) = session.close(CloseReason::normal("client disconnect")) {
                warn!("Failed to close session {}: {}", session.id(), e);
            }
            return;
        }

        self.send(
            session,
            &ControlMessage::authenticate(&self.key_id, &self.secret_key),
        );

        let streams = self.streams();
        if !streams.is_empty() {
            self.send(session, &ControlMessage::listen(streams));
        }

        let _ = self.lifecycle_tx.send(Lifecycle::Opened {
            session_id: session.id(),
        });
    }

    fn on_close(&self, _session: &Session, reason: &CloseReason) {
        let will_reconnect = self.will_reconnect(Some(reason));
        let _ = self.lifecycle_tx.send(Lifecycle::Closed {
            reason: reason.clone(),
            will_reconnect,
        });
    }

    fn on_message(&self, message: &str) {
        // No receivers is fine; messages are dropped until someone subscribes
        let _ = self.message_tx.send(message.to_string());
    }

    fn on_connect_error(&self, error: &str) {
        let will_reconnect = self.will_reconnect(None);
        let _ = self.lifecycle_tx.send(Lifecycle::ConnectFailed {
            error: error.to_string(),
            will_reconnect,
        });
    }
}

/// Client for the market data stream
pub struct MarketDataClient {
    handler: Arc<MarketDataHandler>,
    endpoint: Arc<MarketDataEndpoint>,
}

impl MarketDataClient {
    /// Create a client from configuration; does not connect
    pub fn new(config: &StreamConfig) -> ClientResult<Self> {
        config.validate()?;
        let (key_id, secret_key) = config
            .credentials()
            .ok_or_else(|| ConfigError::Invalid("key_id and secret_key are required".to_string()))?;

        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        let handler = Arc::new(MarketDataHandler {
            key_id: key_id.to_string(),
            secret_key: secret_key.to_string(),
            streams: Mutex::new(config.streams.iter().cloned().collect()),
            reconnect: config.reconnect.clone(),
            intentional_close: AtomicBool::new(false),
            message_tx,
            lifecycle_tx,
        });
        let endpoint = Arc::new(MarketDataEndpoint::new(
            Arc::clone(&handler) as Arc<dyn WebsocketClient>,
            config.url.clone(),
        ));

        Ok(Self { handler, endpoint })
    }

    /// Subscribe to decoded messages
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.handler.message_tx.subscribe()
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.handler.lifecycle_tx.subscribe()
    }

    pub fn endpoint(&self) -> &MarketDataEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.endpoint().is_connected()
    }

    /// Streams currently requested
    pub fn streams(&self) -> Vec<String> {
        self.handler.streams()
    }

    /// Open the connection
    pub fn connect(&self) -> ClientResult<()> {
        self.handler.intentional_close.store(false, Ordering::SeqCst);
        self.endpoint.connect()?;
        Ok(())
    }

    /// Close the connection without reconnecting
    pub fn disconnect(&self) -> ClientResult<()> {
        self.handler.intentional_close.store(true, Ordering::SeqCst);
        self.endpoint.endpoint().close()?;
        Ok(())
    }

    /// Add streams; sends a listen request if connected
    pub fn listen<I, S>(&self, streams: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let message = {
            let mut current = self.handler.streams.lock().unwrap_or_else(|e| e.into_inner());
            let mut added: Vec<String> = Vec::new();
            for stream in streams.into_iter().map(Into::into) {
                if !current.contains(&stream) && !added.contains(&stream) {
                    added.push(stream);
                }
            }
            let message = ControlMessage::listen(added.iter().cloned());
            if !added.is_empty() {
                message.validate()?;
            }
            current.extend(added);
            message
        };
        self.send_if_connected(message)
    }

    /// Remove streams; sends an unlisten request if connected
    pub fn unlisten<I, S>(&self, streams: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let message = {
            let mut current = self.handler.streams.lock().unwrap_or_else(|e| e.into_inner());
            let mut removed: Vec<String> = Vec::new();
            for stream in streams.into_iter().map(Into::into) {
                if current.contains(&stream) && !removed.contains(&stream) {
                    removed.push(stream);
                }
            }
            let message = ControlMessage::unlisten(removed.iter().cloned());
            if !removed.is_empty() {
                message.validate()?;
            }
            for stream in &removed {
                current.remove(stream);
            }
            message
        };
        self.send_if_connected(message)
    }

    fn send_if_connected(&self, message: ControlMessage) -> ClientResult<()> {
        let empty = match &message {
            ControlMessage::Listen { streams } | ControlMessage::Unlisten { streams } => {
                streams.is_empty()
            }
            ControlMessage::Authenticate { .. } => false,
        };
        if empty || !self.is_connected() {
            return Ok(());
        }
        let json = message.to_json()?;
        self.endpoint.endpoint().send_message(json)?;
        debug!("Sent {} request", message.action());
        Ok(())
    }

    /// Connect and keep the stream alive until shutdown
    ///
    /// Returns `Ok` on shutdown or when the stream closes without a reconnect,
    /// and `ReconnectExhausted` once the attempt limit is reached.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ClientResult<()> {
        let mut lifecycle = self.subscribe_lifecycle();
        self.connect()?;
        let mut attempt: u32 = 0;

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested, closing market data stream");
                    self.shutdown(&mut lifecycle).await?;
                    return Ok(());
                }
                event = lifecycle.recv() => event,
            };

            let will_reconnect = match event {
                Ok(Lifecycle::Opened { session_id }) => {
                    debug!("Market data session {} opened", session_id);
                    attempt = 0;
                    continue;
                }
                Ok(Lifecycle::Closed { will_reconnect, .. })
                | Ok(Lifecycle::ConnectFailed { will_reconnect, .. }) => will_reconnect,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Lifecycle receiver lagged by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };

            if !will_reconnect {
                info!("Market data stream ended");
                return Ok(());
            }

            attempt += 1;
            if !self.handler.reconnect.allows_attempt(attempt) {
                error!("Giving up after {} reconnect attempts", attempt - 1);
                return Err(ClientError::ReconnectExhausted(attempt - 1));
            }

            let delay = self.handler.reconnect.delay();
            warn!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown requested while waiting to reconnect");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
            self.connect()?;
        }
    }

    /// Close the stream and wait for the connection thread to report it ended
    ///
    /// A handshake still in flight is closed by `on_open` once it completes.
    async fn shutdown(&self, lifecycle: &mut broadcast::Receiver<Lifecycle>) -> ClientResult<()> {
        self.handler.intentional_close.store(true, Ordering::SeqCst);
        if !self.endpoint.endpoint().is_active() {
            return Ok(());
        }
        if self.is_connected() {
            if let Err(e) = self.endpoint.endpoint().close() {
                warn!("Failed to close market data session: {}", e);
            }
        }

        let closed = async {
            loop {
                match lifecycle.recv().await {
                    Ok(Lifecycle::Closed { .. })
                    | Ok(Lifecycle::ConnectFailed { .. })
                    | Err(broadcast::error::RecvError::Closed) => break,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_CLOSE_TIMEOUT, closed).await.is_err() {
            warn!("Timed out waiting for the stream to close");
        }
        Ok(())
    }
}
