//! Test helpers: a loopback WebSocket server and recording callbacks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::endpoint::WebsocketClient;
use super::session::{CloseReason, Session};
use super::transport::{EndpointHandler, TransportError};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the loopback server does after accepting a connection
#[derive(Debug, Clone)]
pub(crate) enum ServerAction {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    /// Send a close frame with this code and phrase
    Close(u16, &'static str),
    /// Wait for this many text frames from the client
    WaitForText(usize),
    /// Drop the TCP connection without a close handshake
    Drop,
}

/// Loopback server that plays one script per accepted connection
pub(crate) struct TestServer {
    pub url: String,
    protocol_rx: mpsc::UnboundedReceiver<Option<String>>,
    text_rx: mpsc::UnboundedReceiver<String>,
    done_rx: mpsc::UnboundedReceiver<()>,
    pongs: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn spawn(script: Vec<ServerAction>) -> Self {
        Self::spawn_many(vec![script]).await
    }

    /// Accept `scripts.len()` connections in sequence
    pub async fn spawn_many(scripts: Vec<Vec<ServerAction>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (protocol_tx, protocol_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let pongs = Arc::new(AtomicUsize::new(0));
        let server_pongs = Arc::clone(&pongs);

        tokio::spawn(async move {
            for script in scripts {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let protocol_tx = protocol_tx.clone();
                let callback = move |request: &Request, mut response: Response| {
                    let requested = request
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    if requested.as_deref().is_some_and(|p| p.contains("BINARY")) {
                        response
                            .headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("BINARY"));
                    }
                    let _ = protocol_tx.send(requested);
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(ws) = accept_hdr_async(stream, callback).await else {
                    continue;
                };
                play(ws, script, text_tx.clone(), &server_pongs).await;
                let _ = done_tx.send(());
            }
        });

        Self {
            url: format!("ws://{}/stream", addr),
            protocol_rx,
            text_rx,
            done_rx,
            pongs,
        }
    }

    /// Subprotocol header the next connection requested
    pub async fn requested_protocol(&mut self) -> Option<String> {
        tokio::time::timeout(EVENT_TIMEOUT, self.protocol_rx.recv())
            .await
            .expect("Timed out waiting for handshake")
            .flatten()
    }

    /// Next text frame received from the client
    pub async fn next_text(&mut self) -> Option<String> {
        tokio::time::timeout(EVENT_TIMEOUT, self.text_rx.recv())
            .await
            .expect("Timed out waiting for client text")
    }

    /// Text frame already received from the client, if any
    pub fn try_next_text(&mut self) -> Option<String> {
        self.text_rx.try_recv().ok()
    }

    /// Wait until the server is done with the next connection
    pub async fn finished(&mut self) {
        tokio::time::timeout(EVENT_TIMEOUT, self.done_rx.recv())
            .await
            .expect("Timed out waiting for connection to end");
    }

    /// Pong frames received across all connections
    pub fn pongs(&self) -> usize {
        self.pongs.load(Ordering::SeqCst)
    }
}

async fn play(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    script: Vec<ServerAction>,
    text_tx: mpsc::UnboundedSender<String>,
    pongs: &AtomicUsize,
) {
    let (mut tx, mut rx) = ws.split();

    for action in script {
        match action {
            ServerAction::Binary(data) => {
                if tx.send(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
            ServerAction::Text(text) => {
                if tx.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            ServerAction::Ping(data) => {
                if tx.send(Message::Ping(data)).await.is_err() {
                    return;
                }
            }
            ServerAction::Close(code, phrase) => {
                let frame = CloseFrame {
                    code: code.into(),
                    reason: phrase.into(),
                };
                let _ = tx.send(Message::Close(Some(frame))).await;
            }
            ServerAction::WaitForText(count) => {
                let mut seen = 0;
                while seen < count {
                    match rx.next().await {
                        Some(Ok(Message::Text(text))) => {
                            let _ = text_tx.send(text);
                            seen += 1;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pongs.fetch_add(1, Ordering::SeqCst);
                        }
                        Some(Ok(_)) => {}
                        _ => return,
                    }
                }
            }
            ServerAction::Drop => return,
        }
    }

    while let Some(Ok(msg)) = rx.next().await {
        match msg {
            Message::Text(text) => {
                let _ = text_tx.send(text);
            }
            Message::Pong(_) => {
                pongs.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// One recorded callback invocation
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Recorded {
    Open {
        session_id: Uuid,
        thread: Option<String>,
        subprotocol: Option<String>,
    },
    Close {
        session_id: Uuid,
        reason: CloseReason,
    },
    Binary(Vec<u8>),
    Text(String),
    Message(String),
    ConnectError(String),
}

/// Receiving side of a recorder
pub(crate) struct Events {
    rx: mpsc::UnboundedReceiver<Recorded>,
    session: Arc<Mutex<Option<Session>>>,
}

impl Events {
    pub async fn next(&mut self) -> Recorded {
        tokio::time::timeout(EVENT_TIMEOUT, self.rx.recv())
            .await
            .expect("Timed out waiting for callback")
            .expect("Recorder dropped")
    }

    pub fn try_next(&mut self) -> Option<Recorded> {
        self.rx.try_recv().ok()
    }

    /// Session passed to the most recent open callback
    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Recorder {
    tx: mpsc::UnboundedSender<Recorded>,
    session: Arc<Mutex<Option<Session>>>,
}

impl Recorder {
    fn new() -> (Self, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(None));
        (
            Self {
                tx,
                session: Arc::clone(&session),
            },
            Events { rx, session },
        )
    }

    fn open(&self, session: &Session) {
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.tx.send(Recorded::Open {
            session_id: session.id(),
            thread: std::thread::current().name().map(str::to_string),
            subprotocol: session.subprotocol().map(str::to_string),
        });
    }

    fn close(&self, session: &Session, reason: CloseReason) {
        let _ = self.tx.send(Recorded::Close {
            session_id: session.id(),
            reason,
        });
    }

    fn record(&self, event: Recorded) {
        let _ = self.tx.send(event);
    }
}

/// Transport-level handler that records every callback
pub(crate) struct RecordingHandler {
    subprotocols: Vec<&'static str>,
    recorder: Recorder,
}

impl RecordingHandler {
    pub fn new(subprotocols: &[&'static str]) -> (Arc<Self>, Events) {
        let (recorder, events) = Recorder::new();
        let handler = Self {
            subprotocols: subprotocols.to_vec(),
            recorder,
        };
        (Arc::new(handler), events)
    }
}

impl EndpointHandler for RecordingHandler {
    fn subprotocols(&self) -> &[&str] {
        &self.subprotocols
    }

    fn on_open(&self, session: &Session) {
        self.recorder.open(session);
    }

    fn on_close(&self, session: &Session, reason: CloseReason) {
        self.recorder.close(session, reason);
    }

    fn on_binary(&self, payload: &[u8]) {
        self.recorder.record(Recorded::Binary(payload.to_vec()));
    }

    fn on_text(&self, text: &str) {
        self.recorder.record(Recorded::Text(text.to_string()));
    }

    fn on_connect_error(&self, error: &TransportError) {
        self.recorder.record(Recorded::ConnectError(error.to_string()));
    }
}

/// Client-level callbacks that record every invocation
pub(crate) struct RecordingClient {
    recorder: Recorder,
    panic_on_message: bool,
}

impl RecordingClient {
    pub fn new() -> (Arc<Self>, Events) {
        let (recorder, events) = Recorder::new();
        let client = Self {
            recorder,
            panic_on_message: false,
        };
        (Arc::new(client), events)
    }

    /// Records like `new`, then panics after recording each message
    pub fn panicking() -> (Arc<Self>, Events) {
        let (recorder, events) = Recorder::new();
        let client = Self {
            recorder,
            panic_on_message: true,
        };
        (Arc::new(client), events)
    }
}

impl WebsocketClient for RecordingClient {
    fn on_open(&self, session: &Session) {
        self.recorder.open(session);
    }

    fn on_close(&self, session: &Session, reason: &CloseReason) {
        self.recorder.close(session, reason.clone());
    }

    fn on_message(&self, message: &str) {
        self.recorder.record(Recorded::Message(message.to_string()));
        if self.panic_on_message {
            panic!("client rejected message {:?}", message);
        }
    }

    fn on_connect_error(&self, error: &str) {
        self.recorder.record(Recorded::ConnectError(error.to_string()));
    }
}
