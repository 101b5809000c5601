//! Conversion between domain objects and their message block representation.
//!
//! Pure transformation, no state beyond a log identity. Every decode
//! validates the block's type tag first; mismatches and malformed payloads
//! surface as protocol errors.

use crate::error::{Result, UplinkError};
use crate::protocol::entities::{
    EventTransferObject, FileHeader, FileTransferSectionInfo, ToolDocumentationRequest,
    ToolDocumentationResponse, ToolExecutionRequest, ToolExecutionRequestResponse,
    ToolExecutionResult,
};
use crate::protocol::message::{MessageBlock, MessageType};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes/decodes domain objects to/from message blocks.
#[derive(Debug, Clone)]
pub struct MessageConverter {
    /// Identifies the owning session or endpoint in trace output.
    log_identity: String,
}

impl MessageConverter {
    pub fn new(log_identity: impl Into<String>) -> Self {
        Self {
            log_identity: log_identity.into(),
        }
    }

    // -- tool execution ------------------------------------------------------

    pub fn encode_tool_execution_request(&self, request: &ToolExecutionRequest) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolExecutionRequest, request)
    }

    pub fn decode_tool_execution_request(&self, block: &MessageBlock) -> Result<ToolExecutionRequest> {
        self.decode_json(MessageType::ToolExecutionRequest, block)
    }

    pub fn encode_tool_execution_request_response(
        &self,
        response: &ToolExecutionRequestResponse,
    ) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolExecutionRequestResponse, response)
    }

    pub fn decode_tool_execution_request_response(
        &self,
        block: &MessageBlock,
    ) -> Result<ToolExecutionRequestResponse> {
        self.decode_json(MessageType::ToolExecutionRequestResponse, block)
    }

    pub fn encode_tool_execution_events(&self, batch: &[EventTransferObject]) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolExecutionEvents, &batch)
    }

    pub fn decode_tool_execution_events(&self, block: &MessageBlock) -> Result<Vec<EventTransferObject>> {
        self.decode_json(MessageType::ToolExecutionEvents, block)
    }

    pub fn encode_tool_execution_result(&self, result: &ToolExecutionResult) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolExecutionFinished, result)
    }

    pub fn decode_tool_execution_result(&self, block: &MessageBlock) -> Result<ToolExecutionResult> {
        self.decode_json(MessageType::ToolExecutionFinished, block)
    }

    /// A cancellation request is a pure signal with no payload.
    pub fn create_tool_cancellation_request(&self) -> MessageBlock {
        MessageBlock::empty(MessageType::ToolCancellationRequest)
    }

    // -- file transfer -------------------------------------------------------

    pub fn encode_file_transfer_section_start(
        &self,
        info: &FileTransferSectionInfo,
    ) -> Result<MessageBlock> {
        self.encode_json(MessageType::FileTransferSectionStart, info)
    }

    /// Decodes a FILE_TRANSFER_SECTION_START. An empty payload is tolerated
    /// and decoded to the surrogate "no listing" value.
    pub fn decode_file_transfer_section_start(&self, block: &MessageBlock) -> Result<FileTransferSectionInfo> {
        self.validate_message_type(MessageType::FileTransferSectionStart, block)?;
        if block.data().is_empty() {
            return Ok(FileTransferSectionInfo::default());
        }
        self.decode_json(MessageType::FileTransferSectionStart, block)
    }

    pub fn create_file_transfer_section_end(&self) -> MessageBlock {
        MessageBlock::empty(MessageType::FileTransferSectionEnd)
    }

    pub fn encode_file_header(&self, header: &FileHeader) -> Result<MessageBlock> {
        self.encode_json(MessageType::FileHeader, header)
    }

    pub fn decode_file_header(&self, block: &MessageBlock) -> Result<FileHeader> {
        self.decode_json(MessageType::FileHeader, block)
    }

    // -- documentation -------------------------------------------------------

    pub fn encode_documentation_request(&self, request: &ToolDocumentationRequest) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolDocumentationRequest, request)
    }

    pub fn decode_documentation_request(&self, block: &MessageBlock) -> Result<ToolDocumentationRequest> {
        self.decode_json(MessageType::ToolDocumentationRequest, block)
    }

    pub fn encode_documentation_response(&self, response: &ToolDocumentationResponse) -> Result<MessageBlock> {
        self.encode_json(MessageType::ToolDocumentationResponse, response)
    }

    pub fn decode_documentation_response(&self, block: &MessageBlock) -> Result<ToolDocumentationResponse> {
        self.decode_json(MessageType::ToolDocumentationResponse, block)
    }

    // -- generic JSON helpers ------------------------------------------------

    fn encode_json<T: Serialize>(&self, message_type: MessageType, value: &T) -> Result<MessageBlock> {
        let json = serde_json::to_vec(value).map_err(|e| {
            UplinkError::protocol(format!(
                "[{}] failed to encode JSON message of type {:?}: {}",
                self.log_identity, message_type, e
            ))
        })?;
        MessageBlock::new(message_type, json)
    }

    fn decode_json<T: DeserializeOwned>(&self, expected: MessageType, block: &MessageBlock) -> Result<T> {
        self.validate_message_type(expected, block)?;
        serde_json::from_slice(block.data()).map_err(|e| {
            UplinkError::protocol(format!(
                "[{}] failed to decode JSON message of expected type {:?}: {}",
                self.log_identity, expected, e
            ))
        })
    }

    fn validate_message_type(&self, expected: MessageType, block: &MessageBlock) -> Result<()> {
        if block.message_type() != expected {
            return Err(UplinkError::protocol(format!(
                "[{}] actual message type {:?} does not match the expected type {:?}",
                self.log_identity,
                block.message_type(),
                expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn converter() -> MessageConverter {
        MessageConverter::new("test")
    }

    #[test]
    fn test_tool_execution_request_round_trip() {
        let mut properties = HashMap::new();
        properties.insert("timeout".to_string(), "600".to_string());
        let request = ToolExecutionRequest {
            tool_id: "de.example.tool".to_string(),
            tool_version: "1.2".to_string(),
            destination_id: "node-7".to_string(),
            properties,
            dynamic_inputs: vec![serde_json::json!({"name": "x", "dataType": "Float"})],
            dynamic_outputs: vec![],
            non_required_inputs: vec!["x".to_string()],
        };

        let block = converter().encode_tool_execution_request(&request).unwrap();
        assert_eq!(block.message_type(), MessageType::ToolExecutionRequest);
        let decoded = converter().decode_tool_execution_request(&block).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_file_header_round_trip() {
        let header = FileHeader {
            path: "output/result.csv".to_string(),
            size: 4096,
        };
        let block = converter().encode_file_header(&header).unwrap();
        let decoded = converter().decode_file_header(&block).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_execution_result_round_trip() {
        let result = ToolExecutionResult {
            successful: false,
            cancelled: true,
        };
        let block = converter().encode_tool_execution_result(&result).unwrap();
        let decoded = converter().decode_tool_execution_result(&block).unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn test_event_batch_round_trip() {
        let batch = vec![
            EventTransferObject::new("TOOL_OUT", "step 1 done"),
            EventTransferObject::new("TOOL_ERROR", "warning: deprecated flag"),
        ];
        let block = converter().encode_tool_execution_events(&batch).unwrap();
        let decoded = converter().decode_tool_execution_events(&block).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_section_start_without_listing() {
        let info = FileTransferSectionInfo { listing: None };
        let block = converter().encode_file_transfer_section_start(&info).unwrap();
        let decoded = converter().decode_file_transfer_section_start(&block).unwrap();
        assert_eq!(decoded.listing, None);
    }

    #[test]
    fn test_decode_rejects_wrong_message_type() {
        let header = FileHeader {
            path: "a".to_string(),
            size: 1,
        };
        let block = converter().encode_file_header(&header).unwrap();
        let err = converter().decode_tool_execution_request(&block).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let block = MessageBlock::new(MessageType::FileHeader, &b"not json"[..]).unwrap();
        let err = converter().decode_file_header(&block).unwrap_err();
        assert!(err.is_protocol_error());
    }
}
