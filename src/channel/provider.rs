//! Providing side of a tool execution channel.
//!
//! Accepts (or refuses) an incoming execution request, downloads the input
//! directory, runs the tool through a [`ToolExecutionProvider`] while
//! forwarding its progress events, then sends the result and uploads the
//! output directory.

use crate::channel::api::{ToolExecutionProvider, ToolExecutionProviderSetup};
use crate::channel::download::DirectoryDownloadWrapper;
use crate::channel::events::{EventBatchConsumer, EventCollector};
use crate::channel::upload::DirectoryUploadWrapper;
use crate::channel::{ChannelContext, ToolExecutionChannelState};
use crate::error::{Result, UplinkError};
use crate::protocol::{
    MessageBlock, MessageType, ToolExecutionRequestResponse, ToolExecutionResult,
};
use crate::session::MessageBlockPriority;
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ToolExecutionChannelProvider {
    context: ChannelContext,
    setup: Arc<dyn ToolExecutionProviderSetup>,
    provider: Option<Arc<dyn ToolExecutionProvider>>,
    state: ToolExecutionChannelState,
    input_download: Option<DirectoryDownloadWrapper>,
    execution_task: Option<JoinHandle<()>>,
    disposed: bool,
}

impl ToolExecutionChannelProvider {
    pub fn new(context: ChannelContext, setup: Arc<dyn ToolExecutionProviderSetup>) -> Self {
        Self {
            context,
            setup,
            provider: None,
            state: ToolExecutionChannelState::ExpectingExecutionRequest,
            input_download: None,
            execution_task: None,
            disposed: false,
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Returns `Ok(false)` once the exchange has ended and the channel
    /// should be disposed.
    pub async fn process_message(&mut self, block: MessageBlock) -> Result<bool> {
        let result = self.dispatch(block).await;
        if result.is_err() {
            self.state = ToolExecutionChannelState::Closed;
        }
        result
    }

    async fn dispatch(&mut self, block: MessageBlock) -> Result<bool> {
        // Cancellation and close cut across the phase the channel is in.
        match block.message_type() {
            MessageType::ToolCancellationRequest => {
                return self.handle_cancellation_request().await;
            }
            MessageType::ChannelClose => {
                return self.handle_remote_close().await;
            }
            _ => {}
        }
        match self.state {
            ToolExecutionChannelState::ExpectingExecutionRequest => {
                self.handle_execution_request(&block).await
            }
            ToolExecutionChannelState::ExpectingDirectoryDownload => {
                self.handle_download_message(block).await
            }
            state => Err(self
                .context
                .refuse_unexpected_message_type(&format!("{state:?}"), block.message_type())),
        }
    }

    async fn handle_execution_request(&mut self, block: &MessageBlock) -> Result<bool> {
        if block.message_type() != MessageType::ToolExecutionRequest {
            return Err(self.context.refuse_unexpected_message_type(
                "ExpectingExecutionRequest",
                block.message_type(),
            ));
        }
        let request = self.context.converter().decode_tool_execution_request(block)?;
        debug!(
            channel_id = self.context.channel_id(),
            tool_id = request.tool_id,
            tool_version = request.tool_version,
            "Received tool execution request"
        );

        match self.setup.set_up_provider(request).await {
            Some(provider) => {
                self.send_request_response(true).await?;
                self.input_download = Some(DirectoryDownloadWrapper::new(
                    self.context.clone(),
                    provider.input_directory_receiver(),
                ));
                self.provider = Some(provider);
                self.state = ToolExecutionChannelState::ExpectingDirectoryDownload;
                Ok(true)
            }
            None => {
                debug!(
                    channel_id = self.context.channel_id(),
                    "Refusing tool execution request"
                );
                self.send_request_response(false).await?;
                self.state = ToolExecutionChannelState::Closed;
                Ok(false)
            }
        }
    }

    async fn handle_download_message(&mut self, block: MessageBlock) -> Result<bool> {
        let download = self.input_download.as_mut().ok_or_else(|| {
            UplinkError::protocol("download phase entered without a download in progress")
        })?;
        download.process_message_block(block).await?;
        if download.is_finished() {
            self.input_download = None;
            self.start_execution()?;
        }
        Ok(true)
    }

    /// Spawns the execution task; the channel accepts only cancellation
    /// requests and heartbeats until it reports back.
    fn start_execution(&mut self) -> Result<()> {
        let provider = Arc::clone(self.provider.as_ref().ok_or_else(|| {
            UplinkError::protocol("input download finished without an execution provider")
        })?);
        self.state = ToolExecutionChannelState::ExpectingNoMessages;

        let context = self.context.clone();
        self.execution_task = Some(tokio::spawn(async move {
            let collector = EventCollector::new(event_batch_consumer(context.clone()));
            let result = provider.execute(collector.clone()).await;
            // All buffered events must be on the wire before the finished
            // message, so the initiator sees them in order.
            collector.shutdown_and_await_completion().await;

            let result = match result {
                Ok(result) => result,
                Err(error) => {
                    warn!(
                        channel_id = context.channel_id(),
                        "Tool execution failed: {error:#}"
                    );
                    ToolExecutionResult {
                        successful: false,
                        cancelled: false,
                    }
                }
            };
            if let Err(error) = finish_execution(&context, provider.as_ref(), result).await {
                warn!(
                    channel_id = context.channel_id(),
                    "Failed to report execution result: {error:#}"
                );
            }
        }));
        Ok(())
    }

    async fn handle_cancellation_request(&mut self) -> Result<bool> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            UplinkError::protocol("cancellation request before an execution was set up")
        })?;
        debug!(
            channel_id = self.context.channel_id(),
            "Forwarding cancellation request"
        );
        provider.request_cancel().await;
        Ok(true)
    }

    async fn handle_remote_close(&mut self) -> Result<bool> {
        if self.state != ToolExecutionChannelState::Closed {
            self.state = ToolExecutionChannelState::Closed;
            if let Some(provider) = &self.provider {
                // Give a still-running execution a chance to stop early.
                provider.request_cancel().await;
            }
        }
        Ok(false)
    }

    async fn send_request_response(&self, accepted: bool) -> Result<()> {
        let block = self
            .context
            .converter()
            .encode_tool_execution_request_response(&ToolExecutionRequestResponse { accepted })?;
        self.context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, false)
            .await
    }

    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.state = ToolExecutionChannelState::Closed;
        if let Some(task) = self.execution_task.take() {
            if !task.is_finished() {
                task.abort();
            }
        }
        if let Some(provider) = self.provider.take() {
            provider.on_context_closing().await;
        }
    }
}

/// Encodes each event batch and puts it on the blockable lane; a congested
/// session therefore stalls the batcher, which in turn blocks submitters
/// once the in-flight cap fills up.
fn event_batch_consumer(context: ChannelContext) -> EventBatchConsumer {
    Box::new(move |batch| {
        let context = context.clone();
        async move {
            let block = context.converter().encode_tool_execution_events(&batch)?;
            context
                .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
                .await
        }
        .boxed()
    })
}

/// Sends the finished message, then uploads the output directory. Runs on
/// both the success and the failure path; a failed execution still uploads
/// whatever output exists so the initiator can complete the exchange.
async fn finish_execution(
    context: &ChannelContext,
    provider: &dyn ToolExecutionProvider,
    result: ToolExecutionResult,
) -> Result<()> {
    let block = context.converter().encode_tool_execution_result(&result)?;
    context
        .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
        .await?;

    let upload = DirectoryUploadWrapper::new(context.clone());
    let output_provider = provider.output_directory_provider();
    upload.upload_directory(output_provider.as_ref()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::QueuingMessageSender;
    use async_trait::async_trait;

    struct RefusingSetup;

    #[async_trait]
    impl ToolExecutionProviderSetup for RefusingSetup {
        async fn set_up_provider(
            &self,
            _request: crate::protocol::ToolExecutionRequest,
        ) -> Option<Arc<dyn ToolExecutionProvider>> {
            None
        }
    }

    #[tokio::test]
    async fn cancellation_before_setup_is_a_protocol_error() {
        let (sender, _queue) = QueuingMessageSender::new();
        let mut provider = ToolExecutionChannelProvider::new(
            ChannelContext::new("s", 2, sender),
            Arc::new(RefusingSetup),
        );

        let err = provider
            .process_message(MessageBlock::empty(MessageType::ToolCancellationRequest))
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }
}
