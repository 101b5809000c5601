//! Per-channel state machines multiplexed over one session.
//!
//! Each channel is one endpoint of a request/provide pair: tool execution
//! (initiator/provider) or tool documentation (initiator/provider). All
//! endpoints share the dispatch entry point in [`ChannelEndpoint`], which
//! filters channel-level heartbeats before the per-endpoint state machine
//! sees the message.

pub mod api;
pub mod documentation;
pub mod download;
pub mod events;
pub mod fs;
pub mod initiator;
pub mod provider;
pub mod upload;

use crate::error::{Result, UplinkError};
use crate::protocol::{MessageBlock, MessageConverter, MessageType};
use crate::session::{MessageBlockPriority, SessionMessageSender};
use std::sync::Arc;
use tracing::{debug, warn};

pub use api::{
    DirectoryDownloadReceiver, DirectoryUploadContext, DirectoryUploadProvider, FileDataSource,
    ToolDocumentationReceiver, ToolDocumentationSource, ToolExecutionEventHandler,
    ToolExecutionProvider, ToolExecutionProviderSetup,
};
pub use documentation::{DocumentationChannelInitiator, DocumentationChannelProvider};
pub use download::DirectoryDownloadWrapper;
pub use events::EventCollector;
pub use initiator::ToolExecutionChannelInitiator;
pub use provider::ToolExecutionChannelProvider;
pub use upload::DirectoryUploadWrapper;

// =============================================================================
// Channel context
// =============================================================================

/// Everything an endpoint needs to talk to its session: identity for logs,
/// the outgoing message queue, and the payload converter. Cheap to clone;
/// clones are handed to the background transfer tasks an endpoint spawns.
#[derive(Clone)]
pub struct ChannelContext {
    session_id: Arc<str>,
    channel_id: u64,
    sender: Arc<dyn SessionMessageSender>,
    converter: MessageConverter,
}

impl ChannelContext {
    pub fn new(
        session_id: impl Into<String>,
        channel_id: u64,
        sender: Arc<dyn SessionMessageSender>,
    ) -> Self {
        let session_id: Arc<str> = session_id.into().into();
        let converter = MessageConverter::new(format!("session {session_id}/channel {channel_id}"));
        Self {
            session_id,
            channel_id,
            sender,
            converter,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn converter(&self) -> &MessageConverter {
        &self.converter
    }

    /// Enqueues a message block on this channel. `allow_blocking` must be
    /// false on the inbound dispatch path; a full queue is then reported as
    /// an error instead of stalling dispatch for all sibling channels.
    pub async fn enqueue_message_block(
        &self,
        block: MessageBlock,
        priority: MessageBlockPriority,
        allow_blocking: bool,
    ) -> Result<()> {
        self.sender
            .enqueue(self.channel_id, block, priority, allow_blocking)
            .await
    }

    /// The channel-fatal error for a message that has no meaning in the
    /// endpoint's current state.
    pub fn refuse_unexpected_message_type(
        &self,
        state: &str,
        message_type: MessageType,
    ) -> UplinkError {
        UplinkError::protocol(format!(
            "received unexpected message type {message_type:?} while in state {state}"
        ))
    }
}

// =============================================================================
// Execution channel states
// =============================================================================

/// The phases of a tool execution channel. Both sides step through a
/// subset of these; any message outside the current phase's expectation is
/// a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolExecutionChannelState {
    /// A background task owns the conversation; inbound (non-heartbeat)
    /// messages are not acceptable until it finishes.
    ExpectingNoMessages,
    ExpectingExecutionRequest,
    ExpectingExecutionRequestResponse,
    ExpectingDirectoryDownload,
    ExpectingExecutionEvents,
    Closed,
}

// =============================================================================
// Channel endpoint dispatch
// =============================================================================

/// One end of an open channel. The session layer routes every inbound
/// message block for a channel id through [`ChannelEndpoint::process_message`]
/// and calls [`ChannelEndpoint::dispose`] exactly once at teardown.
pub enum ChannelEndpoint {
    ToolExecutionInitiator(ToolExecutionChannelInitiator),
    ToolExecutionProvider(ToolExecutionChannelProvider),
    DocumentationInitiator(DocumentationChannelInitiator),
    DocumentationProvider(DocumentationChannelProvider),
}

impl ChannelEndpoint {
    fn context(&self) -> &ChannelContext {
        match self {
            ChannelEndpoint::ToolExecutionInitiator(e) => e.context(),
            ChannelEndpoint::ToolExecutionProvider(e) => e.context(),
            ChannelEndpoint::DocumentationInitiator(e) => e.context(),
            ChannelEndpoint::DocumentationProvider(e) => e.context(),
        }
    }

    /// Handles one inbound message block. Heartbeats are answered here and
    /// never reach the endpoint state machines, so they keep flowing while
    /// a long-running transfer owns the channel.
    ///
    /// Returns `Ok(true)` while the exchange is still in progress and
    /// `Ok(false)` once it has logically ended (rejection, completion, or a
    /// remote close); the caller must then call [`ChannelEndpoint::dispose`]
    /// to release the channel. An `Err` is channel-fatal and calls for the
    /// same teardown.
    pub async fn process_message(&mut self, block: MessageBlock) -> Result<bool> {
        match block.message_type() {
            MessageType::Heartbeat => {
                self.answer_heartbeat().await;
                Ok(true)
            }
            MessageType::HeartbeatResponse => {
                // Liveness checks happen at session level; an echo on an
                // individual channel carries no information.
                warn!(
                    channel_id = self.context().channel_id(),
                    "Ignoring unsolicited heartbeat response on channel"
                );
                Ok(true)
            }
            _ => {
                let (session_id, channel_id) = {
                    let ctx = self.context();
                    (ctx.session_id().to_string(), ctx.channel_id())
                };
                let message_type = block.message_type();
                self.dispatch(block)
                    .await
                    .map_err(|e| e.with_channel_context(&session_id, channel_id, message_type))
            }
        }
    }

    async fn dispatch(&mut self, block: MessageBlock) -> Result<bool> {
        match self {
            ChannelEndpoint::ToolExecutionInitiator(e) => e.process_message(block).await,
            ChannelEndpoint::ToolExecutionProvider(e) => e.process_message(block).await,
            ChannelEndpoint::DocumentationInitiator(e) => e.process_message(block).await,
            ChannelEndpoint::DocumentationProvider(e) => e.process_message(block).await,
        }
    }

    /// Best effort: a response that cannot be queued right now is simply
    /// skipped, the peer will ask again. Heartbeats never fail a channel.
    async fn answer_heartbeat(&self) {
        let response = MessageBlock::empty(MessageType::HeartbeatResponse);
        if let Err(error) = self
            .context()
            .enqueue_message_block(response, MessageBlockPriority::High, false)
            .await
        {
            debug!(
                channel_id = self.context().channel_id(),
                "Skipping heartbeat response: {error}"
            );
        }
    }

    /// Releases endpoint resources and fires the terminal lifecycle
    /// callbacks. Idempotent per endpoint; the session layer calls it once.
    pub async fn dispose(&mut self) {
        match self {
            ChannelEndpoint::ToolExecutionInitiator(e) => e.dispose().await,
            ChannelEndpoint::ToolExecutionProvider(e) => e.dispose().await,
            ChannelEndpoint::DocumentationInitiator(e) => e.dispose().await,
            ChannelEndpoint::DocumentationProvider(e) => e.dispose().await,
        }
    }
}
