//! WebSocket client transport
//!
//! Drives a single client connection on a dedicated, named thread and
//! dispatches lifecycle events to an [`EndpointHandler`]. Handlers register
//! explicitly; the subprotocols they declare are offered during the
//! opening handshake.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::session::{CloseReason, Outbound, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the peer to acknowledge a locally initiated close
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while establishing or running a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Invalid subprotocol list: {0}")]
    InvalidSubprotocol(String),

    #[error("Failed to start connection thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("WebSocket handshake with {uri} failed: {reason}")]
    Handshake { uri: String, reason: String },

    #[error("Connection thread {0} panicked")]
    Panicked(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Callbacks the transport invokes for one connection
///
/// All callbacks run on the connection thread. `on_open` and `on_close` are
/// each called at most once per connection, and `on_close` only after a
/// successful `on_open`.
pub trait EndpointHandler: Send + Sync + 'static {
    /// Subprotocols to request in the opening handshake
    fn subprotocols(&self) -> &[&str] {
        &[]
    }

    /// The handshake completed
    fn on_open(&self, session: &Session);

    /// The connection terminated, locally or remotely
    fn on_close(&self, session: &Session, reason: CloseReason);

    /// A complete binary message arrived
    fn on_binary(&self, payload: &[u8]);

    /// A complete text message arrived
    fn on_text(&self, text: &str) {
        warn!("Ignoring text message ({} bytes)", text.len());
    }

    /// The handshake failed; no other callback fires for this connection
    fn on_connect_error(&self, error: &TransportError) {
        error!("{}", error);
    }
}

/// Handle to a running connection thread
#[derive(Debug)]
pub struct ConnectionHandle {
    thread_name: String,
    thread: JoinHandle<TransportResult<()>>,
}

impl ConnectionHandle {
    /// Name of the thread driving this connection
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Whether the connection thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the connection thread exits
    ///
    /// Returns the handshake error if the connection never opened.
    pub fn join(self) -> TransportResult<()> {
        self.thread
            .join()
            .map_err(|_| TransportError::Panicked(self.thread_name))?
    }
}

/// Build the opening handshake request for `uri`
pub fn build_request(uri: &str, subprotocols: &[&str]) -> TransportResult<Request> {
    let invalid = |reason: String| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    let mut request = uri
        .into_client_request()
        .map_err(|e| invalid(e.to_string()))?;

    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme '{}'", other))),
        None => return Err(invalid("missing scheme".to_string())),
    }

    if !subprotocols.is_empty() {
        let value = HeaderValue::from_str(&subprotocols.join(", "))
            .map_err(|e| TransportError::InvalidSubprotocol(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

/// Start a connection to `uri` on a new thread named `thread_name`
///
/// Returns once the thread is running; the handshake happens on that thread.
/// No callback is invoked before this function returns.
pub fn connect(
    handler: Arc<dyn EndpointHandler>,
    uri: &str,
    thread_name: &str,
) -> TransportResult<ConnectionHandle> {
    let request = build_request(uri, handler.subprotocols())?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let endpoint_uri = uri.to_string();
    let thread = std::thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || runtime.block_on(run_connection(request, endpoint_uri, handler)))?;

    debug!("Started connection thread {} for {}", thread_name, uri);
    Ok(ConnectionHandle {
        thread_name: thread_name.to_string(),
        thread,
    })
}

/// Handshake, then pump frames until the connection ends
async fn run_connection(
    request: Request,
    endpoint_uri: String,
    handler: Arc<dyn EndpointHandler>,
) -> TransportResult<()> {
    info!("Connecting to {}", endpoint_uri);

    let (ws_stream, response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            let err = TransportError::Handshake {
                uri: endpoint_uri,
                reason: e.to_string(),
            };
            handler.on_connect_error(&err);
            return Err(err);
        }
    };

    let subprotocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (session, outbound_rx) = Session::new(endpoint_uri, subprotocol);
    info!(
        "Connected to {} (session {}, subprotocol {:?})",
        session.endpoint_uri(),
        session.id(),
        session.subprotocol()
    );

    // A panicking callback must still end the session before unwinding
    let dispatch = async {
        handler.on_open(&session);
        pump(ws_stream, outbound_rx, &*handler).await
    };
    let outcome = AssertUnwindSafe(dispatch).catch_unwind().await;

    session.mark_closed();
    match outcome {
        Ok(reason) => {
            info!("Session {} closed: {}", session.id(), reason);
            handler.on_close(&session, reason);
            Ok(())
        }
        Err(panic) => {
            error!("Handler panicked in session {}", session.id());
            handler.on_close(
                &session,
                CloseReason::new(CloseReason::INTERNAL_ERROR, "handler panicked"),
            );
            std::panic::resume_unwind(panic)
        }
    }
}

async fn pump(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    handler: &dyn EndpointHandler,
) -> CloseReason {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Received binary message ({} bytes)", data.len());
                        handler.on_binary(&data);
                    }
                    Some(Ok(Message::Text(text))) => {
                        handler.on_text(&text);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong; flush it
                        if let Err(e) = ws_sender.flush().await {
                            break CloseReason::abnormal(e.to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Peer sent close frame: {:?}", frame);
                        // tungstenite queues the close reply; flush it
                        let _ = ws_sender.flush().await;
                        break frame
                            .map(CloseReason::from)
                            .unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, ""));
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break CloseReason::abnormal(e.to_string());
                    }
                    None => {
                        break CloseReason::abnormal("connection closed without a close frame");
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                let result = match outbound {
                    Some(Outbound::Text(text)) => ws_sender.send(Message::Text(text)).await,
                    Some(Outbound::Binary(data)) => ws_sender.send(Message::Binary(data)).await,
                    Some(Outbound::Close(reason)) => {
                        let _ = ws_sender
                            .send(Message::Close(reason.to_close_frame()))
                            .await;
                        await_close_ack(&mut ws_receiver).await;
                        break reason;
                    }
                    None => {
                        let reason = CloseReason::normal("session dropped");
                        let _ = ws_sender
                            .send(Message::Close(reason.to_close_frame()))
                            .await;
                        break reason;
                    }
                };
                if let Err(e) = result {
                    warn!("Failed to send frame: {}", e);
                    break CloseReason::abnormal(e.to_string());
                }
            }
        }
    };

    let _ = ws_sender.close().await;
    reason
}

async fn await_close_ack(ws_receiver: &mut SplitStream<WsStream>) {
    let drain = async {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    };
    if tokio::time::timeout(CLOSE_ACK_TIMEOUT, drain).await.is_err() {
        debug!("Peer did not acknowledge close within {:?}", CLOSE_ACK_TIMEOUT);
    }
}
