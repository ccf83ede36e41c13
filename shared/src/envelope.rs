//! Wire framing: `{"c":"<tag>","m":"<base64 payload>"}`
//!
//! The payload is base64 encoded inside a JSON envelope. The envelope is
//! serialized structurally, but the inner encoding is kept so frames stay
//! compatible with peers that build the envelope by string interpolation.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One framed message on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "c")]
    pub channel: char,
    #[serde(rename = "m")]
    pub message: String,
}

/// A decoded inbound frame
///
/// `channel` is `None` when the peer sent a bare base64 payload without an
/// envelope around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub channel: Option<char>,
    pub text: String,
}

impl InboundFrame {
    /// Whether this frame should be delivered to a receiver listening on `channel`
    pub fn is_for(&self, channel: char) -> bool {
        self.channel.map_or(true, |c| c == channel)
    }
}

impl Envelope {
    /// Encodes `plain_text` and tags it with `channel`
    pub fn wrap(channel: char, plain_text: &str) -> Self {
        Self {
            channel,
            message: encode_payload(plain_text),
        }
    }

    pub fn to_wire(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    pub fn from_wire(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }

    /// Decodes the payload back to the text originally passed to `wrap`
    pub fn open(&self) -> Result<String, ProtocolError> {
        decode_payload(&self.message)
    }
}

/// Frames `plain_text` on `channel` and serializes it in one step
pub fn encode_frame(channel: char, plain_text: &str) -> Result<String, ProtocolError> {
    Envelope::wrap(channel, plain_text).to_wire()
}

/// Decodes one inbound text frame
///
/// Frames that start with `{` must be envelopes. Anything else is treated as
/// a bare base64 payload.
pub fn decode_frame(raw: &str) -> Result<InboundFrame, ProtocolError> {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        let envelope = Envelope::from_wire(trimmed)?;
        let text = envelope.open()?;
        return Ok(InboundFrame {
            channel: Some(envelope.channel),
            text,
        });
    }

    Ok(InboundFrame {
        channel: None,
        text: decode_payload(trimmed)?,
    })
}

pub fn encode_payload(plain_text: &str) -> String {
    STANDARD.encode(plain_text.as_bytes())
}

pub fn decode_payload(encoded: &str) -> Result<String, ProtocolError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ProtocolError::DecodeFailure(e.to_string()))?;

    String::from_utf8(bytes).map_err(|e| ProtocolError::DecodeFailure(e.to_string()))
}
