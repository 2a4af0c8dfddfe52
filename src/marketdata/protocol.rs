//! Control messages sent to the market data stream
//!
//! The client only writes these; inbound messages are forwarded as raw text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of streams in a single listen/unlisten request
pub const MAX_STREAMS_PER_REQUEST: usize = 1024;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Messages sent from the client to the stream server
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Authenticate the connection
    Authenticate { key_id: String, secret_key: String },

    /// Start receiving the given streams
    Listen { streams: Vec<String> },

    /// Stop receiving the given streams
    Unlisten { streams: Vec<String> },
}

impl ControlMessage {
    pub fn authenticate(key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        ControlMessage::Authenticate {
            key_id: key_id.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn listen<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ControlMessage::Listen {
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }

    pub fn unlisten<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ControlMessage::Unlisten {
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }

    /// Action name as it appears on the wire
    pub fn action(&self) -> &'static str {
        match self {
            ControlMessage::Authenticate { .. } => "authenticate",
            ControlMessage::Listen { .. } => "listen",
            ControlMessage::Unlisten { .. } => "unlisten",
        }
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ControlMessage::Authenticate { key_id, secret_key } => {
                if key_id.is_empty() || secret_key.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "key_id and secret_key cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }
            ControlMessage::Listen { streams } | ControlMessage::Unlisten { streams } => {
                if streams.is_empty() {
                    return Err(ProtocolError::ValidationError(format!(
                        "{} requires at least one stream",
                        self.action()
                    )));
                }
                if streams.len() > MAX_STREAMS_PER_REQUEST {
                    return Err(ProtocolError::ValidationError(format!(
                        "{} exceeds maximum of {} streams",
                        self.action(),
                        MAX_STREAMS_PER_REQUEST
                    )));
                }
                if let Some(bad) = streams.iter().find(|s| s.trim().is_empty()) {
                    return Err(ProtocolError::ValidationError(format!(
                        "invalid stream name {:?}",
                        bad
                    )));
                }
                Ok(())
            }
        }
    }

    /// Validate and serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }
}

// Keeps the secret out of logs
impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Authenticate { key_id, .. } => f
                .debug_struct("Authenticate")
                .field("key_id", key_id)
                .field("secret_key", &"<redacted>")
                .finish(),
            ControlMessage::Listen { streams } => {
                f.debug_struct("Listen").field("streams", streams).finish()
            }
            ControlMessage::Unlisten { streams } => {
                f.debug_struct("Unlisten").field("streams", streams).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_authenticate_wire_format() {
        let msg = ControlMessage::authenticate("AKID", "SECRET");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"action": "authenticate", "data": {"key_id": "AKID", "secret_key": "SECRET"}})
        );
    }

    #[test]
    fn test_listen_wire_format() {
        let msg = ControlMessage::listen(["T.AAPL", "Q.AAPL"]);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"action": "listen", "data": {"streams": ["T.AAPL", "Q.AAPL"]}})
        );
    }

    #[test]
    fn test_unlisten_parses() {
        let json = r#"{"action": "unlisten", "data": {"streams": ["AM.SPY"]}}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ControlMessage::unlisten(["AM.SPY"]));
        assert_eq!(msg.action(), "unlisten");
    }

    #[test]
    fn test_empty_listen_rejected() {
        let msg = ControlMessage::listen(Vec::<String>::new());
        assert!(matches!(msg.to_json(), Err(ProtocolError::ValidationError(_))));
    }

    #[test]
    fn test_blank_stream_rejected() {
        let msg = ControlMessage::listen(["T.AAPL", "  "]);
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_empty_credentials_rejected() {
        let msg = ControlMessage::authenticate("", "secret");
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let msg = ControlMessage::authenticate("AKID", "SECRET");
        let debug = format!("{:?}", msg);
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("SECRET"));
    }
}
