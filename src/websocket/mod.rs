//! WebSocket client module
//!
//! Connection transport, session handles and the shared endpoint that
//! concrete endpoints build on.

mod endpoint;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use endpoint::*;
pub use session::*;
pub use transport::*;
