//! Uplink channel protocol layer.
//!
//! Implements the channel level of an uplink session: multiple logical
//! channels multiplexed over one ordered, reliable byte stream, each
//! carrying a tool execution or tool documentation exchange as a sequence
//! of typed message blocks.
//!
//! # Architecture
//!
//! ```text
//! embedder (session transport)
//!     │  routes inbound blocks by channel id
//!     ▼
//! ChannelEndpoint ──► per-endpoint state machine
//!     │                 (initiator / provider, execution / documentation)
//!     ▼
//! SessionMessageSender ──► two-lane outgoing queue ──► byte stream
//! ```
//!
//! The crate does not own the socket. The embedder reads frames with
//! [`protocol::read_message_block`], routes them to the matching
//! [`channel::ChannelEndpoint`], and drains the
//! [`session::OutboundQueue`] into the stream (or lets
//! [`session::OutboundQueue::pump`] do it).

pub mod channel;
pub mod error;
pub mod protocol;
pub mod session;

pub use channel::{ChannelContext, ChannelEndpoint, EventCollector, ToolExecutionChannelState};
pub use error::{Result, UplinkError};
pub use protocol::{MessageBlock, MessageConverter, MessageType};
pub use session::{MessageBlockPriority, OutboundQueue, QueuingMessageSender, SessionMessageSender};
