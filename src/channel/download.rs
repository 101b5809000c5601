//! Incoming directory transfer over a channel.
//!
//! The counterpart of [`DirectoryUploadWrapper`](crate::channel::upload::DirectoryUploadWrapper):
//! consumes the FILE_TRANSFER_SECTION_START / FILE_HEADER / FILE_CONTENT /
//! FILE_TRANSFER_SECTION_END sequence and feeds each announced file to a
//! [`DirectoryDownloadReceiver`] as a streaming [`FileDataSource`].
//!
//! Each file is bridged through an in-memory duplex pipe: the dispatch
//! path writes content chunks into one end while the receiver consumes the
//! other end from its own task. When the pipe fills up, writing blocks,
//! which stalls inbound dispatch and thereby pushes backpressure onto the
//! transport. The receiver task's completion is awaited before the next
//! file header is accepted, so receiver errors are never lost.

use crate::channel::api::{DirectoryDownloadReceiver, FileDataSource};
use crate::channel::ChannelContext;
use crate::error::{Result, UplinkError};
use crate::protocol::{MessageBlock, MessageType};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tracing::debug;

/// Buffer size of the per-file pipe; holds one full content chunk.
const FILE_PIPE_BUFFER_SIZE: usize = 64 * 1024;

struct FileInProgress {
    writer: DuplexStream,
    remaining: u64,
}

pub struct DirectoryDownloadWrapper {
    context: ChannelContext,
    receiver: Arc<dyn DirectoryDownloadReceiver>,
    section_started: bool,
    finished: bool,
    current_file: Option<FileInProgress>,
    /// Receive task of the most recently announced file; awaited before
    /// the next file starts and before the section completes.
    pending_receive: Option<JoinHandle<Result<()>>>,
}

impl DirectoryDownloadWrapper {
    pub fn new(context: ChannelContext, receiver: Arc<dyn DirectoryDownloadReceiver>) -> Self {
        Self {
            context,
            receiver,
            section_started: false,
            finished: false,
            current_file: None,
            pending_receive: None,
        }
    }

    /// True once FILE_TRANSFER_SECTION_END has been processed and the last
    /// file's receive task has completed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consumes one message block of the transfer. An `Err` is
    /// channel-fatal; the caller must not feed further blocks after one.
    pub async fn process_message_block(&mut self, block: MessageBlock) -> Result<()> {
        match block.message_type() {
            MessageType::FileTransferSectionStart => self.handle_section_start(&block).await,
            MessageType::FileHeader => self.handle_file_header(&block).await,
            MessageType::FileContent => self.handle_file_content(block).await,
            MessageType::FileTransferSectionEnd => self.handle_section_end().await,
            other => Err(self
                .context
                .refuse_unexpected_message_type("directory download", other)),
        }
    }

    async fn handle_section_start(&mut self, block: &MessageBlock) -> Result<()> {
        if self.section_started {
            return Err(UplinkError::protocol(
                "duplicate FILE_TRANSFER_SECTION_START within one transfer",
            ));
        }
        let info = self
            .context
            .converter()
            .decode_file_transfer_section_start(block)?;
        if let Some(listing) = info.listing {
            self.receiver.receive_directory_listing(listing).await?;
        }
        self.section_started = true;
        Ok(())
    }

    async fn handle_file_header(&mut self, block: &MessageBlock) -> Result<()> {
        if !self.section_started || self.finished {
            return Err(UplinkError::protocol(
                "FILE_HEADER outside of an open file transfer section",
            ));
        }
        if let Some(in_progress) = &self.current_file {
            return Err(UplinkError::protocol(format!(
                "FILE_HEADER while previous file still expects {} content bytes",
                in_progress.remaining
            )));
        }
        self.await_pending_receive().await?;

        let header = self.context.converter().decode_file_header(block)?;
        debug!(
            channel_id = self.context.channel_id(),
            path = header.path,
            size = header.size,
            "Receiving file"
        );
        let (writer, reader) = tokio::io::duplex(FILE_PIPE_BUFFER_SIZE);
        let source = FileDataSource::new(header.path, header.size, Box::new(reader));
        let receiver = Arc::clone(&self.receiver);
        self.pending_receive = Some(tokio::spawn(async move {
            receiver.receive_file(source).await
        }));
        if header.size == 0 {
            // Nothing follows; closing the pipe lets the receive task see
            // an immediate end of file.
            drop(writer);
        } else {
            self.current_file = Some(FileInProgress {
                writer,
                remaining: header.size,
            });
        }
        Ok(())
    }

    async fn handle_file_content(&mut self, block: MessageBlock) -> Result<()> {
        let in_progress = self.current_file.as_mut().ok_or_else(|| {
            UplinkError::protocol("FILE_CONTENT without a preceding FILE_HEADER")
        })?;
        let data = block.into_data();
        if data.len() as u64 > in_progress.remaining {
            return Err(UplinkError::protocol(format!(
                "FILE_CONTENT overflow: {} bytes received, {} expected",
                data.len(),
                in_progress.remaining
            )));
        }
        in_progress.writer.write_all(&data).await?;
        in_progress.remaining -= data.len() as u64;
        if in_progress.remaining == 0 {
            // Dropping the writer closes the pipe and completes the
            // receiver's read side.
            self.current_file = None;
        }
        Ok(())
    }

    async fn handle_section_end(&mut self) -> Result<()> {
        if !self.section_started || self.finished {
            return Err(UplinkError::protocol(
                "FILE_TRANSFER_SECTION_END outside of an open file transfer section",
            ));
        }
        if let Some(in_progress) = &self.current_file {
            return Err(UplinkError::protocol(format!(
                "FILE_TRANSFER_SECTION_END while last file still expects {} content bytes",
                in_progress.remaining
            )));
        }
        self.await_pending_receive().await?;
        self.finished = true;
        Ok(())
    }

    async fn await_pending_receive(&mut self) -> Result<()> {
        if let Some(handle) = self.pending_receive.take() {
            handle.await.map_err(|e| {
                UplinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("file receive task failed: {e}"),
                ))
            })??;
        }
        Ok(())
    }
}
