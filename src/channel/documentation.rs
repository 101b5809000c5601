//! Tool documentation channels.
//!
//! A short-lived request/response exchange: the initiator asks for the
//! documentation behind an opaque reference id, the provider answers with
//! availability and size, then streams the content in chunks. The
//! initiator reassembles the content and closes the channel.

use crate::channel::api::{ToolDocumentationReceiver, ToolDocumentationSource};
use crate::channel::ChannelContext;
use crate::error::{Result, UplinkError};
use crate::protocol::{
    MessageBlock, MessageType, ToolDocumentationRequest, ToolDocumentationResponse,
};
use crate::session::MessageBlockPriority;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Content bytes per TOOL_DOCUMENTATION_CONTENT block.
const DOCUMENTATION_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Initiating side
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorState {
    ExpectingNoMessages,
    ExpectingResponse,
    ExpectingContent,
    Closed,
}

pub struct DocumentationChannelInitiator {
    context: ChannelContext,
    receiver: Arc<dyn ToolDocumentationReceiver>,
    state: InitiatorState,
    expected_size: u64,
    content: BytesMut,
}

impl DocumentationChannelInitiator {
    pub fn new(context: ChannelContext, receiver: Arc<dyn ToolDocumentationReceiver>) -> Self {
        Self {
            context,
            receiver,
            state: InitiatorState::ExpectingNoMessages,
            expected_size: 0,
            content: BytesMut::new(),
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Sends the documentation request that opens the exchange.
    pub async fn request_documentation(&mut self, reference_id: impl Into<String>) -> Result<()> {
        if self.state != InitiatorState::ExpectingNoMessages {
            return Err(UplinkError::protocol(
                "documentation already requested on this channel",
            ));
        }
        let block = self
            .context
            .converter()
            .encode_documentation_request(&ToolDocumentationRequest {
                reference_id: reference_id.into(),
            })?;
        self.context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
            .await?;
        self.state = InitiatorState::ExpectingResponse;
        Ok(())
    }

    /// Returns `Ok(false)` once the exchange has ended and the channel
    /// should be disposed.
    pub async fn process_message(&mut self, block: MessageBlock) -> Result<bool> {
        match (self.state, block.message_type()) {
            (_, MessageType::ChannelClose) => {
                self.state = InitiatorState::Closed;
                Ok(false)
            }
            (InitiatorState::ExpectingResponse, MessageType::ToolDocumentationResponse) => {
                let response = self.context.converter().decode_documentation_response(&block)?;
                self.handle_response(response).await
            }
            (InitiatorState::ExpectingContent, MessageType::ToolDocumentationContent) => {
                self.handle_content(block.into_data()).await
            }
            (state, message_type) => Err(self
                .context
                .refuse_unexpected_message_type(&format!("{state:?}"), message_type)),
        }
    }

    async fn handle_response(&mut self, response: ToolDocumentationResponse) -> Result<bool> {
        if !response.available {
            debug!(
                channel_id = self.context.channel_id(),
                "Requested documentation is not available"
            );
            self.receiver.on_documentation_unavailable().await;
            return self.complete().await;
        }
        if response.size == 0 {
            self.receiver.receive_documentation(Bytes::new()).await;
            return self.complete().await;
        }
        self.expected_size = response.size;
        self.content = BytesMut::with_capacity(response.size.min(1 << 20) as usize);
        self.state = InitiatorState::ExpectingContent;
        Ok(true)
    }

    async fn handle_content(&mut self, data: Bytes) -> Result<bool> {
        if self.content.len() as u64 + data.len() as u64 > self.expected_size {
            return Err(UplinkError::protocol(format!(
                "documentation content overflow: got more than the announced {} bytes",
                self.expected_size
            )));
        }
        self.content.extend_from_slice(&data);
        if self.content.len() as u64 == self.expected_size {
            let content = std::mem::take(&mut self.content).freeze();
            self.receiver.receive_documentation(content).await;
            return self.complete().await;
        }
        Ok(true)
    }

    async fn complete(&mut self) -> Result<bool> {
        self.state = InitiatorState::Closed;
        self.context
            .enqueue_message_block(
                MessageBlock::empty(MessageType::ChannelClose),
                MessageBlockPriority::High,
                false,
            )
            .await?;
        Ok(false)
    }

    pub async fn dispose(&mut self) {
        self.state = InitiatorState::Closed;
    }
}

// =============================================================================
// Providing side
// =============================================================================

pub struct DocumentationChannelProvider {
    context: ChannelContext,
    source: Arc<dyn ToolDocumentationSource>,
    request_served: bool,
    content_task: Option<JoinHandle<()>>,
}

impl DocumentationChannelProvider {
    pub fn new(context: ChannelContext, source: Arc<dyn ToolDocumentationSource>) -> Self {
        Self {
            context,
            source,
            request_served: false,
            content_task: None,
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Returns `Ok(false)` once the initiator has closed the channel.
    pub async fn process_message(&mut self, block: MessageBlock) -> Result<bool> {
        match block.message_type() {
            MessageType::ChannelClose => Ok(false),
            MessageType::ToolDocumentationRequest if !self.request_served => {
                self.request_served = true;
                let request = self.context.converter().decode_documentation_request(&block)?;
                self.handle_request(&request.reference_id).await?;
                Ok(true)
            }
            other => Err(self
                .context
                .refuse_unexpected_message_type("documentation provider", other)),
        }
    }

    async fn handle_request(&mut self, reference_id: &str) -> Result<()> {
        let content = self.source.load_documentation(reference_id).await?;
        debug!(
            channel_id = self.context.channel_id(),
            reference_id,
            available = content.is_some(),
            "Serving documentation request"
        );
        let response = ToolDocumentationResponse {
            available: content.is_some(),
            size: content.as_ref().map_or(0, |c| c.len() as u64),
        };
        let block = self.context.converter().encode_documentation_response(&response)?;
        self.context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, false)
            .await?;

        if let Some(content) = content.filter(|c| !c.is_empty()) {
            // Content can be large; stream it from a task so the dispatch
            // path is free to keep answering heartbeats.
            let context = self.context.clone();
            self.content_task = Some(tokio::spawn(async move {
                if let Err(error) = send_documentation_content(&context, content).await {
                    warn!(
                        channel_id = context.channel_id(),
                        "Failed to stream documentation content: {error:#}"
                    );
                }
            }));
        }
        Ok(())
    }

    pub async fn dispose(&mut self) {
        if let Some(task) = self.content_task.take() {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

async fn send_documentation_content(context: &ChannelContext, mut content: Bytes) -> Result<()> {
    while !content.is_empty() {
        let chunk = content.split_to(content.len().min(DOCUMENTATION_CHUNK_SIZE));
        let block = MessageBlock::new(MessageType::ToolDocumentationContent, chunk)?;
        context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::QueuingMessageSender;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDocReceiver {
        unavailable: Mutex<bool>,
        content: Mutex<Option<Bytes>>,
    }

    #[async_trait]
    impl ToolDocumentationReceiver for RecordingDocReceiver {
        async fn on_documentation_unavailable(&self) {
            *self.unavailable.lock().unwrap() = true;
        }

        async fn receive_documentation(&self, content: Bytes) {
            *self.content.lock().unwrap() = Some(content);
        }
    }

    struct StaticDocSource(Option<&'static [u8]>);

    #[async_trait]
    impl ToolDocumentationSource for StaticDocSource {
        async fn load_documentation(&self, _reference_id: &str) -> Result<Option<Bytes>> {
            Ok(self.0.map(Bytes::from_static))
        }
    }

    async fn run_exchange(
        source: StaticDocSource,
    ) -> (Arc<RecordingDocReceiver>, Vec<MessageType>) {
        let (initiator_sender, mut to_provider) = QueuingMessageSender::new();
        let (provider_sender, mut to_initiator) = QueuingMessageSender::new();
        let receiver = Arc::new(RecordingDocReceiver::default());

        let mut initiator = DocumentationChannelInitiator::new(
            ChannelContext::new("s", 1, initiator_sender),
            Arc::clone(&receiver) as Arc<_>,
        );
        let mut provider =
            DocumentationChannelProvider::new(ChannelContext::new("s", 1, provider_sender), Arc::new(source));

        initiator.request_documentation("doc-ref-1").await.unwrap();
        let mut initiator_sent = Vec::new();
        // Shuttle messages until both directions go quiet.
        loop {
            let mut progressed = false;
            while let Ok(Some((_, block))) =
                tokio::time::timeout(Duration::from_millis(50), to_provider.next()).await
            {
                progressed = true;
                initiator_sent.push(block.message_type());
                if block.message_type() != MessageType::ChannelClose {
                    provider.process_message(block).await.unwrap();
                }
            }
            while let Ok(Some((_, block))) =
                tokio::time::timeout(Duration::from_millis(50), to_initiator.next()).await
            {
                progressed = true;
                initiator.process_message(block).await.unwrap();
            }
            if !progressed {
                break;
            }
        }
        (receiver, initiator_sent)
    }

    #[tokio::test]
    async fn documentation_is_streamed_and_reassembled() {
        let content: &'static [u8] = Box::leak(vec![0x5au8; 70 * 1024].into_boxed_slice());
        let (receiver, initiator_sent) = run_exchange(StaticDocSource(Some(content))).await;

        let received = receiver.content.lock().unwrap().clone().unwrap();
        assert_eq!(received.len(), 70 * 1024);
        assert!(received.iter().all(|b| *b == 0x5a));
        // The initiator closes the channel once the content is complete.
        assert_eq!(
            initiator_sent,
            vec![MessageType::ToolDocumentationRequest, MessageType::ChannelClose]
        );
    }

    #[tokio::test]
    async fn unavailable_documentation_is_reported() {
        let (receiver, initiator_sent) = run_exchange(StaticDocSource(None)).await;

        assert!(*receiver.unavailable.lock().unwrap());
        assert!(receiver.content.lock().unwrap().is_none());
        assert_eq!(
            initiator_sent,
            vec![MessageType::ToolDocumentationRequest, MessageType::ChannelClose]
        );
    }

    #[tokio::test]
    async fn content_overflow_is_refused() {
        let (sender, _queue) = QueuingMessageSender::new();
        let receiver = Arc::new(RecordingDocReceiver::default());
        let mut initiator = DocumentationChannelInitiator::new(
            ChannelContext::new("s", 1, sender),
            Arc::clone(&receiver) as Arc<_>,
        );
        initiator.state = InitiatorState::ExpectingResponse;

        let converter = crate::protocol::MessageConverter::new("test");
        let response = converter
            .encode_documentation_response(&ToolDocumentationResponse {
                available: true,
                size: 2,
            })
            .unwrap();
        initiator.process_message(response).await.unwrap();

        let oversized =
            MessageBlock::new(MessageType::ToolDocumentationContent, Bytes::from_static(b"abc"))
                .unwrap();
        let err = initiator.process_message(oversized).await.unwrap_err();
        assert!(err.is_protocol_error());
    }
}
