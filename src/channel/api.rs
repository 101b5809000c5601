//! Collaborator interfaces consumed and exposed by channel endpoints.
//!
//! Implementations live outside this crate (the tool integration layer on
//! the providing side, the workflow component on the initiating side);
//! `fs.rs` ships filesystem-backed defaults for the transfer traits.

use crate::channel::events::EventCollector;
use crate::error::Result;
use crate::protocol::{ToolExecutionRequest, ToolExecutionResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

// =============================================================================
// File data source
// =============================================================================

/// A single file in transit: its relative path, its exact size, and a
/// reader over its content. Used on both sides of a transfer - as the data
/// handed to [`DirectoryUploadContext::provide_file`] and as the data
/// delivered to [`DirectoryDownloadReceiver::receive_file`].
pub struct FileDataSource {
    relative_path: String,
    size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileDataSource {
    pub fn new(
        relative_path: impl Into<String>,
        size: u64,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            reader,
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsyncRead for FileDataSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for FileDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDataSource")
            .field("relative_path", &self.relative_path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Directory transfer
// =============================================================================

/// Send side of a directory transfer: supplies the listing and the files.
#[async_trait]
pub trait DirectoryUploadProvider: Send + Sync {
    /// The relative paths of all (sub)directories to recreate on the
    /// receiving side; `None` if the provider declines to list.
    async fn provide_directory_listing(&self) -> Result<Option<Vec<String>>>;

    /// Hands every file to the given context, in the order they should be
    /// transferred.
    async fn provide_files(&self, context: &dyn DirectoryUploadContext) -> Result<()>;
}

/// The sink offered to [`DirectoryUploadProvider::provide_files`]; each call
/// transfers one file completely.
#[async_trait]
pub trait DirectoryUploadContext: Send + Sync {
    async fn provide_file(&self, file: FileDataSource) -> Result<()>;
}

/// Receive side of a directory transfer.
#[async_trait]
pub trait DirectoryDownloadReceiver: Send + Sync {
    async fn receive_directory_listing(&self, relative_paths: Vec<String>) -> Result<()>;

    /// Consumes one received file. May block on its own I/O; it is always
    /// invoked from a dedicated task, never from the inbound dispatch path.
    async fn receive_file(&self, file: FileDataSource) -> Result<()>;
}

// =============================================================================
// Tool execution
// =============================================================================

/// The local execution backend on the providing side of a channel.
#[async_trait]
pub trait ToolExecutionProvider: Send + Sync {
    /// Receives the input directory before execution starts.
    fn input_directory_receiver(&self) -> Arc<dyn DirectoryDownloadReceiver>;

    /// Runs the tool; progress is published through the given collector.
    async fn execute(&self, events: EventCollector) -> Result<ToolExecutionResult>;

    /// Cooperative cancellation hook; best effort.
    async fn request_cancel(&self);

    /// Supplies the output directory after execution finished.
    fn output_directory_provider(&self) -> Arc<dyn DirectoryUploadProvider>;

    /// Terminal lifecycle callback; invoked exactly once, even on abnormal
    /// channel teardown.
    async fn on_context_closing(&self);
}

/// Creates (or refuses) an execution provider for an incoming request.
#[async_trait]
pub trait ToolExecutionProviderSetup: Send + Sync {
    /// `None` rejects the request.
    async fn set_up_provider(
        &self,
        request: ToolExecutionRequest,
    ) -> Option<Arc<dyn ToolExecutionProvider>>;
}

/// Observer of an execution exchange on the initiating side. Receives the
/// full lifecycle on both success and failure paths; `on_context_closing`
/// is the single terminal callback.
#[async_trait]
pub trait ToolExecutionEventHandler: Send + Sync {
    fn input_directory_provider(&self) -> Arc<dyn DirectoryUploadProvider>;

    fn output_directory_receiver(&self) -> Arc<dyn DirectoryDownloadReceiver>;

    async fn on_input_uploads_starting(&self);

    async fn on_input_uploads_finished(&self);

    async fn on_execution_starting(&self);

    /// One execution progress event; called once per event, in order.
    async fn process_tool_execution_event(&self, event_type: &str, data: &str);

    async fn on_execution_finished(&self, result: &ToolExecutionResult);

    async fn on_output_downloads_starting(&self);

    async fn on_output_downloads_finished(&self);

    /// A channel-fatal error, reported before the context closes.
    async fn on_error(&self, message: &str);

    async fn on_context_closing(&self);
}

// =============================================================================
// Documentation
// =============================================================================

/// Resolves documentation requests on the providing side.
#[async_trait]
pub trait ToolDocumentationSource: Send + Sync {
    /// `None` if no documentation exists for the given reference.
    async fn load_documentation(&self, reference_id: &str) -> Result<Option<Bytes>>;
}

/// Receives the outcome of a documentation request on the initiating side.
#[async_trait]
pub trait ToolDocumentationReceiver: Send + Sync {
    async fn on_documentation_unavailable(&self);

    async fn receive_documentation(&self, content: Bytes);
}
