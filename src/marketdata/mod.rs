//! Market data streaming module
//!
//! The `BINARY`-subprotocol endpoint, its control messages and the client
//! that drives it.

mod client;
mod endpoint;
mod protocol;

pub use client::*;
pub use endpoint::*;
pub use protocol::*;
