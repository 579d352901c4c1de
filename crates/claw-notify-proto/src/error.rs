//! Error types for the claw-notify-proto crate.

use thiserror::Error;

/// Errors that can occur while speaking the plugin protocol.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A frame exceeded the maximum line length.
    #[error("frame too long (max {max} bytes)")]
    FrameTooLong {
        /// The configured limit.
        max: usize,
    },

    /// The peer closed the channel.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The peer sent a message that is not valid at this point of the exchange.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the receiver was waiting for.
        expected: &'static str,
        /// The message type that arrived.
        got: String,
    },

    /// The handshake environment is missing or inconsistent.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Io(err.into())
        } else {
            Self::Decoding(err.to_string())
        }
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_encoding() {
        let err = ProtoError::Encoding("bad value".to_string());
        assert_eq!(err.to_string(), "encoding error: bad value");
    }

    #[test]
    fn error_display_unexpected_message() {
        let err = ProtoError::UnexpectedMessage {
            expected: "hello",
            got: "ack".to_string(),
        };
        assert_eq!(err.to_string(), "unexpected message: expected hello, got ack");
    }

    #[test]
    fn error_display_frame_too_long() {
        let err = ProtoError::FrameTooLong { max: 16 };
        assert_eq!(err.to_string(), "frame too long (max 16 bytes)");
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let err: ProtoError = json_err.unwrap_err().into();
        assert!(matches!(err, ProtoError::Decoding(_)));
    }
}
