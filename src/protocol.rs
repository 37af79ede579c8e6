use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROCESS_IMAGE: &str = "PROCESS_IMAGE";
pub const IMAGE_RESULT: &str = "IMAGE_RESULT";

/// Outer wrapper of every message crossing the channel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImageRequest {
    pub image_id: String,
    /// Base64 image bytes, optionally behind a `data:<mime>;base64,` prefix.
    pub image_data: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    pub image_id: String,
    pub should_hide: bool,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ProcessImage(ProcessImageRequest),
    /// A well formed envelope whose type we do not handle. Its payload is never parsed.
    Unrecognized(String),
}

/// Errors raised while decoding or encoding envelopes.
#[derive(Debug)]
pub enum ProtocolError {
    Envelope(serde_json::Error),
    Payload {
        kind: String,
        source: serde_json::Error,
    },
    Encode(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Envelope(err) => write!(f, "malformed envelope: {err}"),
            ProtocolError::Payload { kind, source } => {
                write!(f, "malformed {kind} payload: {source}")
            }
            ProtocolError::Encode(err) => write!(f, "failed to encode envelope: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Envelope(err) | ProtocolError::Encode(err) => Some(err),
            ProtocolError::Payload { source, .. } => Some(source),
        }
    }
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    serde_json::from_slice(bytes).map_err(ProtocolError::Envelope)
}

pub fn encode_envelope(kind: &str, payload: Value) -> Result<Vec<u8>, ProtocolError> {
    let envelope = Envelope {
        kind: kind.to_string(),
        payload,
    };
    serde_json::to_vec(&envelope).map_err(ProtocolError::Encode)
}

/// Decodes a frame into the message it carries.
pub fn decode(bytes: &[u8]) -> Result<Inbound, ProtocolError> {
    let envelope = decode_envelope(bytes)?;
    match envelope.kind.as_str() {
        PROCESS_IMAGE => serde_json::from_value(envelope.payload)
            .map(Inbound::ProcessImage)
            .map_err(|source| ProtocolError::Payload {
                kind: envelope.kind,
                source,
            }),
        _ => Ok(Inbound::Unrecognized(envelope.kind)),
    }
}

pub fn encode_result(result: &ImageResult) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_value(result).map_err(ProtocolError::Encode)?;
    encode_envelope(IMAGE_RESULT, payload)
}
