//! Domain objects carried inside message blocks.
//!
//! All of these are encoded as JSON payloads by the message converter.
//! Field names are part of the wire compatibility surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request to execute a tool on the remote providing side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRequest {
    pub tool_id: String,
    pub tool_version: String,
    /// Opaque routing id selecting the destination behind the session.
    pub destination_id: String,
    /// Tool configuration key/value properties.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Dynamic endpoint definitions, passed through uninterpreted.
    #[serde(default)]
    pub dynamic_inputs: Vec<serde_json::Value>,
    #[serde(default)]
    pub dynamic_outputs: Vec<serde_json::Value>,
    /// Names of inputs that may be left unconnected.
    #[serde(default)]
    pub non_required_inputs: Vec<String>,
}

/// The accept/reject answer to a [`ToolExecutionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionRequestResponse {
    pub accepted: bool,
}

/// The final outcome of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub successful: bool,
    pub cancelled: bool,
}

/// Announces a single file within a file transfer section: its relative
/// path and the exact number of content bytes that will follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub path: String,
    pub size: u64,
}

/// Carried by FILE_TRANSFER_SECTION_START. The listing contains the
/// relative paths of all (sub)directories to create on the receiving side;
/// it may be absent if the providing side declined to list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferSectionInfo {
    pub listing: Option<Vec<String>>,
}

/// A single execution progress event: an opaque type tag plus its payload.
/// Immutable; the unit forwarded by the event collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTransferObject {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: String,
}

impl EventTransferObject {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }
}

/// A request for a tool's documentation, identified by an opaque reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDocumentationRequest {
    pub reference_id: String,
}

/// The answer to a documentation request. If `available`, exactly `size`
/// content bytes follow as TOOL_DOCUMENTATION_CONTENT blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDocumentationResponse {
    pub available: bool,
    pub size: u64,
}
