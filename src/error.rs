//! Error types for the uplink channel layer.
//!
//! Two broad categories exist: protocol errors (a message arrived in the
//! wrong state, carried an unexpected type, or failed to decode) and I/O
//! errors from the underlying session. Both can be wrapped with channel
//! context so that failures are attributable to a specific multiplexed
//! stream in shared logs.

use crate::protocol::MessageType;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UplinkError>;

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    /// Unexpected protocol behavior: wrong message type for the current
    /// state, malformed payload, duplicate initialization, or an outgoing
    /// queue that was full when blocking was not allowed. Always
    /// channel-fatal; never retried.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// I/O failure on the underlying session stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error re-wrapped with the identity of the channel it occurred on.
    #[error("channel {channel_id} (session {session_id}), while processing {message_type:?}: {source}")]
    Channel {
        session_id: String,
        channel_id: u64,
        message_type: MessageType,
        #[source]
        source: Box<UplinkError>,
    },
}

impl UplinkError {
    pub fn protocol(message: impl Into<String>) -> Self {
        UplinkError::Protocol(message.into())
    }

    /// Wraps this error with channel-identifying context, so that failures
    /// on one multiplexed stream can be told apart from its siblings.
    pub fn with_channel_context(self, session_id: &str, channel_id: u64, message_type: MessageType) -> Self {
        UplinkError::Channel {
            session_id: session_id.to_string(),
            channel_id,
            message_type,
            source: Box::new(self),
        }
    }

    /// True if this error (or the error it wraps) is a protocol violation.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            UplinkError::Protocol(_) => true,
            UplinkError::Channel { source, .. } => source.is_protocol_error(),
            UplinkError::Io(_) => false,
        }
    }
}
