//! Configuration module
//!
//! Handles loading and saving market data stream configuration.

mod stream;

pub use stream::*;
