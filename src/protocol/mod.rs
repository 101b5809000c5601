//! Wire protocol: message blocks, domain objects, and their conversion.
//!
//! The message type tags and payload encodings defined here are the
//! compatibility surface towards existing peers; see `message.rs` for the
//! frame layout and `codec.rs` for the JSON payload mapping.

pub mod codec;
pub mod entities;
pub mod message;

pub use codec::MessageConverter;
pub use entities::{
    EventTransferObject, FileHeader, FileTransferSectionInfo, ToolDocumentationRequest,
    ToolDocumentationResponse, ToolExecutionRequest, ToolExecutionRequestResponse,
    ToolExecutionResult,
};
pub use message::{
    read_message_block, write_message_block, MessageBlock, MessageType, MAX_MESSAGE_SIZE,
};
