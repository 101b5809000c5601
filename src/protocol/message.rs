//! Wire-level message blocks.
//!
//! A message block is the atomic typed unit of the protocol: a one-byte
//! type tag plus a length-delimited payload. On the session stream each
//! block is framed as:
//!
//! ```text
//! channel_id:u64 | payload_len:u32 | type:u8 | payload
//! ```
//!
//! All multi-byte integers are big-endian.

use crate::error::{Result, UplinkError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size (8MB) - prevents OOM from malicious/corrupted frames
pub const MAX_MESSAGE_SIZE: u32 = 8 * 1024 * 1024;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Control
    Heartbeat = 0x01,
    HeartbeatResponse = 0x02,
    ChannelClose = 0x03,
    // Tool execution
    ToolExecutionRequest = 0x10,
    ToolExecutionRequestResponse = 0x11,
    ToolExecutionEvents = 0x12,
    ToolExecutionFinished = 0x13,
    ToolCancellationRequest = 0x14,
    // File transfer
    FileTransferSectionStart = 0x20,
    FileTransferSectionEnd = 0x21,
    FileHeader = 0x22,
    FileContent = 0x23,
    // Documentation
    ToolDocumentationRequest = 0x30,
    ToolDocumentationResponse = 0x31,
    ToolDocumentationContent = 0x32,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Heartbeat),
            0x02 => Some(Self::HeartbeatResponse),
            0x03 => Some(Self::ChannelClose),
            0x10 => Some(Self::ToolExecutionRequest),
            0x11 => Some(Self::ToolExecutionRequestResponse),
            0x12 => Some(Self::ToolExecutionEvents),
            0x13 => Some(Self::ToolExecutionFinished),
            0x14 => Some(Self::ToolCancellationRequest),
            0x20 => Some(Self::FileTransferSectionStart),
            0x21 => Some(Self::FileTransferSectionEnd),
            0x22 => Some(Self::FileHeader),
            0x23 => Some(Self::FileContent),
            0x30 => Some(Self::ToolDocumentationRequest),
            0x31 => Some(Self::ToolDocumentationResponse),
            0x32 => Some(Self::ToolDocumentationContent),
            _ => None,
        }
    }
}

// =============================================================================
// Message Block
// =============================================================================

/// A typed, length-delimited payload. Immutable once constructed; owned by
/// whichever component currently holds it (queue or processing endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    message_type: MessageType,
    data: Bytes,
}

impl MessageBlock {
    pub fn new(message_type: MessageType, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_MESSAGE_SIZE as usize {
            return Err(UplinkError::protocol(format!(
                "message payload of {} bytes exceeds the maximum of {}",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(Self { message_type, data })
    }

    /// A block with an empty payload; used by pure signal messages such as
    /// heartbeats and cancellation requests.
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            data: Bytes::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single framed message block from the stream.
/// Returns the channel id it is addressed to and the block itself.
pub async fn read_message_block<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u64, MessageBlock)> {
    let channel_id = r.read_u64().await?;
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_MESSAGE_SIZE {
        return Err(UplinkError::protocol(format!(
            "incoming message of {} bytes exceeds the maximum of {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let type_code = r.read_u8().await?;
    let message_type = MessageType::from_code(type_code)
        .ok_or_else(|| UplinkError::protocol(format!("unknown message type code 0x{type_code:02x}")))?;

    let mut payload = BytesMut::zeroed(len as usize);
    r.read_exact(&mut payload).await?;

    Ok((channel_id, MessageBlock::new(message_type, payload.freeze())?))
}

/// Write a single framed message block to the stream.
pub async fn write_message_block<W: AsyncWrite + Unpin>(
    w: &mut W,
    channel_id: u64,
    block: &MessageBlock,
) -> Result<()> {
    w.write_u64(channel_id).await?;
    w.write_u32(block.data().len() as u32).await?;
    w.write_u8(block.message_type().code()).await?;
    w.write_all(block.data()).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_code() {
        assert_eq!(MessageType::from_code(0x01), Some(MessageType::Heartbeat));
        assert_eq!(MessageType::from_code(0x23), Some(MessageType::FileContent));
        assert_eq!(
            MessageType::from_code(0x32),
            Some(MessageType::ToolDocumentationContent)
        );
        assert_eq!(MessageType::from_code(0xFF), None);
    }

    #[test]
    fn test_code_round_trip_for_all_types() {
        let all = [
            MessageType::Heartbeat,
            MessageType::HeartbeatResponse,
            MessageType::ChannelClose,
            MessageType::ToolExecutionRequest,
            MessageType::ToolExecutionRequestResponse,
            MessageType::ToolExecutionEvents,
            MessageType::ToolExecutionFinished,
            MessageType::ToolCancellationRequest,
            MessageType::FileTransferSectionStart,
            MessageType::FileTransferSectionEnd,
            MessageType::FileHeader,
            MessageType::FileContent,
            MessageType::ToolDocumentationRequest,
            MessageType::ToolDocumentationResponse,
            MessageType::ToolDocumentationContent,
        ];
        for t in all {
            assert_eq!(MessageType::from_code(t.code()), Some(t));
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let block = MessageBlock::new(MessageType::FileContent, Bytes::from_static(b"hello")).unwrap();
        write_message_block(&mut client, 7, &block).await.unwrap();

        let (channel_id, received) = read_message_block(&mut server).await.unwrap();
        assert_eq!(channel_id, 7);
        assert_eq!(received.message_type(), MessageType::FileContent);
        assert_eq!(received.data().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Hand-write an invalid header claiming an enormous payload.
        let write = async {
            use tokio::io::AsyncWriteExt;
            client.write_u64(1).await.unwrap();
            client.write_u32(MAX_MESSAGE_SIZE + 1).await.unwrap();
            client.write_u8(MessageType::FileContent.code()).await.unwrap();
        };
        let read = read_message_block(&mut server);
        let (_, result) = tokio::join!(write, read);

        let err = result.unwrap_err();
        assert!(err.is_protocol_error(), "expected protocol error, got {err}");
    }

    #[tokio::test]
    async fn test_unknown_type_code_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let write = async {
            use tokio::io::AsyncWriteExt;
            client.write_u64(1).await.unwrap();
            client.write_u32(0).await.unwrap();
            client.write_u8(0x7F).await.unwrap();
        };
        let read = read_message_block(&mut server);
        let (_, result) = tokio::join!(write, read);

        assert!(result.unwrap_err().is_protocol_error());
    }
}
