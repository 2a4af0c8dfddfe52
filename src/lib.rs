//! Market data WebSocket stream client
//!
//! Connects to a market data stream that negotiates the `BINARY` subprotocol,
//! decodes each binary frame as UTF-8 text and forwards it to a
//! [`websocket::WebsocketClient`].

pub mod config;
pub mod marketdata;
pub mod websocket;
