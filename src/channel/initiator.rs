//! Initiating side of a tool execution channel.
//!
//! Drives one complete execution exchange: sends the execution request,
//! uploads the input directory once accepted, forwards progress events and
//! the final result to the [`ToolExecutionEventHandler`], downloads the
//! output directory and closes the channel.

use crate::channel::api::ToolExecutionEventHandler;
use crate::channel::download::DirectoryDownloadWrapper;
use crate::channel::upload::DirectoryUploadWrapper;
use crate::channel::{ChannelContext, ToolExecutionChannelState};
use crate::error::{Result, UplinkError};
use crate::protocol::{MessageBlock, MessageType, ToolExecutionRequest};
use crate::session::MessageBlockPriority;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ToolExecutionChannelInitiator {
    context: ChannelContext,
    event_handler: Arc<dyn ToolExecutionEventHandler>,
    state: ToolExecutionChannelState,
    output_download: Option<DirectoryDownloadWrapper>,
    input_upload_task: Option<JoinHandle<()>>,
    disposed: bool,
}

impl ToolExecutionChannelInitiator {
    pub fn new(context: ChannelContext, event_handler: Arc<dyn ToolExecutionEventHandler>) -> Self {
        Self {
            context,
            event_handler,
            state: ToolExecutionChannelState::ExpectingNoMessages,
            output_download: None,
            input_upload_task: None,
            disposed: false,
        }
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Sends the execution request that opens the exchange. Must be called
    /// exactly once, before any inbound message is processed.
    pub async fn initiate_execution(&mut self, request: &ToolExecutionRequest) -> Result<()> {
        if self.state != ToolExecutionChannelState::ExpectingNoMessages {
            return Err(UplinkError::protocol(
                "execution already initiated on this channel",
            ));
        }
        let block = self.context.converter().encode_tool_execution_request(request)?;
        self.context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
            .await?;
        self.state = ToolExecutionChannelState::ExpectingExecutionRequestResponse;
        Ok(())
    }

    /// Asks the remote side to cancel the running execution. Best effort;
    /// the exchange still completes normally, with a result marked as
    /// cancelled if the tool honored the request in time. A request that
    /// cannot be queued is logged and forgotten, never retried.
    pub async fn request_cancellation(&self) {
        if let Err(error) = self
            .context
            .enqueue_message_block(
                self.context.converter().create_tool_cancellation_request(),
                MessageBlockPriority::BlockableChannelOperation,
                false,
            )
            .await
        {
            warn!(
                channel_id = self.context.channel_id(),
                "Could not send cancellation request: {error}"
            );
        }
    }

    /// Returns `Ok(false)` once the exchange has ended and the channel
    /// should be disposed.
    pub async fn process_message(&mut self, block: MessageBlock) -> Result<bool> {
        let result = self.dispatch(block).await;
        if let Err(error) = &result {
            self.state = ToolExecutionChannelState::Closed;
            self.event_handler.on_error(&error.to_string()).await;
        }
        result
    }

    async fn dispatch(&mut self, block: MessageBlock) -> Result<bool> {
        if block.message_type() == MessageType::ChannelClose {
            return self.handle_remote_close().await;
        }
        match self.state {
            ToolExecutionChannelState::ExpectingExecutionRequestResponse => {
                self.handle_request_response(&block).await
            }
            ToolExecutionChannelState::ExpectingExecutionEvents => {
                self.handle_execution_phase_message(block).await
            }
            ToolExecutionChannelState::ExpectingDirectoryDownload => {
                self.handle_download_message(block).await
            }
            state => Err(self
                .context
                .refuse_unexpected_message_type(&format!("{state:?}"), block.message_type())),
        }
    }

    async fn handle_request_response(&mut self, block: &MessageBlock) -> Result<bool> {
        if block.message_type() != MessageType::ToolExecutionRequestResponse {
            return Err(self.context.refuse_unexpected_message_type(
                "ExpectingExecutionRequestResponse",
                block.message_type(),
            ));
        }
        let response = self
            .context
            .converter()
            .decode_tool_execution_request_response(block)?;
        if !response.accepted {
            debug!(
                channel_id = self.context.channel_id(),
                "Execution request was rejected by the remote side"
            );
            self.event_handler
                .on_error("tool execution request was rejected by the remote side")
                .await;
            self.state = ToolExecutionChannelState::Closed;
            self.send_channel_close().await?;
            return Ok(false);
        }

        self.event_handler.on_input_uploads_starting().await;
        // Events may start arriving while the upload is still running, so
        // the state moves forward before the upload task is spawned.
        self.state = ToolExecutionChannelState::ExpectingExecutionEvents;
        let context = self.context.clone();
        let handler = Arc::clone(&self.event_handler);
        self.input_upload_task = Some(tokio::spawn(async move {
            let upload = DirectoryUploadWrapper::new(context.clone());
            let provider = handler.input_directory_provider();
            match upload.upload_directory(provider.as_ref()).await {
                Ok(()) => {
                    handler.on_input_uploads_finished().await;
                    handler.on_execution_starting().await;
                }
                Err(error) => {
                    warn!(
                        channel_id = context.channel_id(),
                        "Input directory upload failed: {error:#}"
                    );
                    handler
                        .on_error(&format!("input directory upload failed: {error}"))
                        .await;
                }
            }
        }));
        Ok(true)
    }

    async fn handle_execution_phase_message(&mut self, block: MessageBlock) -> Result<bool> {
        match block.message_type() {
            MessageType::ToolExecutionEvents => {
                let batch = self.context.converter().decode_tool_execution_events(&block)?;
                for event in batch {
                    self.event_handler
                        .process_tool_execution_event(&event.event_type, &event.data)
                        .await;
                }
                Ok(true)
            }
            MessageType::ToolExecutionFinished => {
                let result = self.context.converter().decode_tool_execution_result(&block)?;
                self.event_handler.on_execution_finished(&result).await;
                self.event_handler.on_output_downloads_starting().await;
                self.output_download = Some(DirectoryDownloadWrapper::new(
                    self.context.clone(),
                    self.event_handler.output_directory_receiver(),
                ));
                self.state = ToolExecutionChannelState::ExpectingDirectoryDownload;
                Ok(true)
            }
            other => Err(self
                .context
                .refuse_unexpected_message_type("ExpectingExecutionEvents", other)),
        }
    }

    async fn handle_download_message(&mut self, block: MessageBlock) -> Result<bool> {
        let download = self.output_download.as_mut().ok_or_else(|| {
            UplinkError::protocol("download phase entered without a download in progress")
        })?;
        download.process_message_block(block).await?;
        if download.is_finished() {
            self.output_download = None;
            self.event_handler.on_output_downloads_finished().await;
            self.state = ToolExecutionChannelState::Closed;
            self.send_channel_close().await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn handle_remote_close(&mut self) -> Result<bool> {
        if self.state != ToolExecutionChannelState::Closed {
            // A close before the exchange completed aborts it.
            self.state = ToolExecutionChannelState::Closed;
            self.event_handler
                .on_error("channel was closed by the remote side before the execution completed")
                .await;
        }
        Ok(false)
    }

    async fn send_channel_close(&self) -> Result<()> {
        self.context
            .enqueue_message_block(
                MessageBlock::empty(MessageType::ChannelClose),
                MessageBlockPriority::High,
                false,
            )
            .await
    }

    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.state = ToolExecutionChannelState::Closed;
        if let Some(task) = self.input_upload_task.take() {
            if !task.is_finished() {
                task.abort();
            }
        }
        self.event_handler.on_context_closing().await;
    }
}
