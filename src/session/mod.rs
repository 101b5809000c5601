//! Session-level collaborators: the shared outbound sender.
//!
//! Session establishment and the inbound dispatch loop live outside this
//! crate; channels only see the send primitive defined here.

pub mod sender;

pub use sender::{
    MessageBlockPriority, OutboundQueue, QueuingMessageSender, SessionMessageSender,
    BLOCKABLE_QUEUE_SIZE, HIGH_PRIORITY_QUEUE_SIZE,
};
