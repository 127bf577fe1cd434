//! JSON text codec for control messages

use serde_json::Value;
use thiserror::Error;

use crate::messages::{ControlMessage, MESSAGE_TYPES};

#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, not an object, or missing a string `type`
    #[error("Invalid message format")]
    Malformed,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known `type` whose payload does not match the message shape
    #[error("Invalid {message_type} message: {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stateless encoder/decoder for text frames
pub struct ControlCodec;

impl ControlCodec {
    pub fn encode(message: &ControlMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }

    pub fn decode(text: &str) -> Result<ControlMessage, CodecError> {
        let value: Value = serde_json::from_str(text).map_err(|_| CodecError::Malformed)?;

        let message_type = value
            .as_object()
            .and_then(|obj| obj.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(CodecError::Malformed)?;

        if !MESSAGE_TYPES.contains(&message_type.as_str()) {
            return Err(CodecError::UnknownType(message_type));
        }

        serde_json::from_value(value).map_err(|e| CodecError::InvalidPayload {
            message_type,
            reason: e.to_string(),
        })
    }
}
