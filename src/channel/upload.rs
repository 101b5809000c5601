//! Outgoing directory transfer over a channel.
//!
//! Wraps a [`DirectoryUploadProvider`] and turns its directory into the
//! wire sequence FILE_TRANSFER_SECTION_START, then per file a FILE_HEADER
//! followed by FILE_CONTENT chunks, then FILE_TRANSFER_SECTION_END. All
//! blocks go out on the blockable lane with blocking allowed, so a slow
//! peer throttles the upload instead of overflowing the queue.

use crate::channel::api::{DirectoryUploadContext, DirectoryUploadProvider, FileDataSource};
use crate::channel::ChannelContext;
use crate::error::Result;
use crate::protocol::{FileHeader, FileTransferSectionInfo, MessageBlock, MessageType};
use crate::session::MessageBlockPriority;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Content bytes per FILE_CONTENT block. Small enough that heartbeats and
/// cancellation requests interleave promptly on the high-priority lane.
pub const FILE_CONTENT_CHUNK_SIZE: u64 = 64 * 1024;

pub struct DirectoryUploadWrapper {
    context: ChannelContext,
}

impl DirectoryUploadWrapper {
    pub fn new(context: ChannelContext) -> Self {
        Self { context }
    }

    /// Runs one complete directory upload: section start with the
    /// provider's listing, every file the provider hands over, section end.
    pub async fn upload_directory(&self, provider: &dyn DirectoryUploadProvider) -> Result<()> {
        let listing = provider.provide_directory_listing().await?;
        let start = self
            .context
            .converter()
            .encode_file_transfer_section_start(&FileTransferSectionInfo { listing })?;
        self.enqueue(start).await?;

        provider.provide_files(self).await?;

        let end = self.context.converter().create_file_transfer_section_end();
        self.enqueue(end).await?;
        Ok(())
    }

    async fn enqueue(&self, block: MessageBlock) -> Result<()> {
        self.context
            .enqueue_message_block(block, MessageBlockPriority::BlockableChannelOperation, true)
            .await
    }
}

#[async_trait]
impl DirectoryUploadContext for DirectoryUploadWrapper {
    async fn provide_file(&self, mut file: FileDataSource) -> Result<()> {
        let header = FileHeader {
            path: file.relative_path().to_string(),
            size: file.size(),
        };
        debug!(
            channel_id = self.context.channel_id(),
            path = header.path,
            size = header.size,
            "Uploading file"
        );
        let block = self.context.converter().encode_file_header(&header)?;
        self.enqueue(block).await?;

        // The announced size is a contract: exactly that many content bytes
        // follow. A shorter reader surfaces as an unexpected-EOF I/O error.
        let mut remaining = header.size;
        while remaining > 0 {
            let chunk_len = remaining.min(FILE_CONTENT_CHUNK_SIZE) as usize;
            let mut chunk = vec![0u8; chunk_len];
            file.read_exact(&mut chunk).await?;
            remaining -= chunk_len as u64;
            let block = MessageBlock::new(MessageType::FileContent, Bytes::from(chunk))?;
            self.enqueue(block).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::QueuingMessageSender;

    struct SingleFileProvider {
        listing: Option<Vec<String>>,
        path: &'static str,
        content: &'static [u8],
    }

    #[async_trait]
    impl DirectoryUploadProvider for SingleFileProvider {
        async fn provide_directory_listing(&self) -> Result<Option<Vec<String>>> {
            Ok(self.listing.clone())
        }

        async fn provide_files(&self, context: &dyn DirectoryUploadContext) -> Result<()> {
            context
                .provide_file(FileDataSource::new(
                    self.path,
                    self.content.len() as u64,
                    Box::new(self.content),
                ))
                .await
        }
    }

    async fn collect_upload(provider: &dyn DirectoryUploadProvider) -> Vec<MessageBlock> {
        let (sender, mut queue) = QueuingMessageSender::new();
        let context = ChannelContext::new("test-session", 7, sender);
        DirectoryUploadWrapper::new(context)
            .upload_directory(provider)
            .await
            .unwrap();

        let mut blocks = Vec::new();
        while let Ok(Some((channel_id, block))) =
            tokio::time::timeout(std::time::Duration::from_millis(100), queue.next()).await
        {
            assert_eq!(channel_id, 7);
            blocks.push(block);
        }
        blocks
    }

    #[tokio::test]
    async fn upload_emits_section_header_content_end() {
        let provider = SingleFileProvider {
            listing: Some(vec!["sub".to_string()]),
            path: "sub/data.txt",
            content: b"hello uplink",
        };
        let blocks = collect_upload(&provider).await;

        let types: Vec<MessageType> = blocks.iter().map(|b| b.message_type()).collect();
        assert_eq!(
            types,
            vec![
                MessageType::FileTransferSectionStart,
                MessageType::FileHeader,
                MessageType::FileContent,
                MessageType::FileTransferSectionEnd,
            ]
        );
        assert_eq!(blocks[2].data().as_ref(), b"hello uplink");
    }

    #[tokio::test]
    async fn large_file_is_chunked() {
        let content: &'static [u8] = Box::leak(vec![0xabu8; 64 * 1024 + 10].into_boxed_slice());
        let provider = SingleFileProvider {
            listing: None,
            path: "big.bin",
            content,
        };
        let blocks = collect_upload(&provider).await;

        let content_blocks: Vec<&MessageBlock> = blocks
            .iter()
            .filter(|b| b.message_type() == MessageType::FileContent)
            .collect();
        assert_eq!(content_blocks.len(), 2);
        assert_eq!(content_blocks[0].data().len(), 64 * 1024);
        assert_eq!(content_blocks[1].data().len(), 10);
    }

    #[tokio::test]
    async fn zero_byte_file_sends_header_only() {
        let provider = SingleFileProvider {
            listing: None,
            path: "empty.txt",
            content: b"",
        };
        let blocks = collect_upload(&provider).await;

        let types: Vec<MessageType> = blocks.iter().map(|b| b.message_type()).collect();
        assert_eq!(
            types,
            vec![
                MessageType::FileTransferSectionStart,
                MessageType::FileHeader,
                MessageType::FileTransferSectionEnd,
            ]
        );
    }
}
