//! Market data endpoint
//!
//! Negotiates the `BINARY` subprotocol and decodes each binary frame as
//! UTF-8 text before handing it to the shared endpoint.

use std::sync::Arc;

use crate::websocket::{
    CloseReason, EndpointHandler, EndpointResult, Session, TransportError, WebsocketClient,
    WebsocketClientEndpoint,
};

/// Subprotocol offered during the opening handshake
pub const SUBPROTOCOL: &str = "BINARY";

/// Name of the thread that drives the market data connection
pub const THREAD_NAME: &str = "MarketDataWebsocketThread";

/// Market data websocket client endpoint
pub struct MarketDataEndpoint {
    endpoint: WebsocketClientEndpoint,
}

impl MarketDataEndpoint {
    /// Create an endpoint for `client` targeting `endpoint_uri`
    ///
    /// Performs no I/O; call [`MarketDataEndpoint::connect`] to open the connection.
    pub fn new(client: Arc<dyn WebsocketClient>, endpoint_uri: impl Into<String>) -> Self {
        Self {
            endpoint: WebsocketClientEndpoint::new(client, endpoint_uri, THREAD_NAME),
        }
    }

    /// Open the connection on the market data thread
    pub fn connect(self: &Arc<Self>) -> EndpointResult<()> {
        let handler: Arc<dyn EndpointHandler> = Arc::clone(self) as Arc<dyn EndpointHandler>;
        self.endpoint.connect(handler)
    }

    /// Shared endpoint state
    pub fn endpoint(&self) -> &WebsocketClientEndpoint {
        &self.endpoint
    }
}

impl EndpointHandler for MarketDataEndpoint {
    fn subprotocols(&self) -> &[&str] {
        &[SUBPROTOCOL]
    }

    fn on_open(&self, session: &Session) {
        self.endpoint.on_open(session);
    }

    fn on_close(&self, session: &Session, reason: CloseReason) {
        self.endpoint.on_close(session, &reason);
    }

    fn on_binary(&self, payload: &[u8]) {
        self.endpoint.on_message(&String::from_utf8_lossy(payload));
    }

    fn on_connect_error(&self, error: &TransportError) {
        self.endpoint.on_connect_error(error);
    }
}
