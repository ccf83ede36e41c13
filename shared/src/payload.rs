//! Application payloads carried inside envelopes
//!
//! Three shapes are understood:
//! - ready signal `{"t":"r"}`
//! - position update `{"id":N,"x":X,"y":Y}`
//! - leave `{"t":"l","id":N}`
//!
//! Any other JSON object is not an error; `Payload::parse` returns `None` so
//! receivers can skip message kinds they do not know about.

use crate::error::ProtocolError;
use crate::EntityId;
use serde::{Deserialize, Serialize};

const KIND_READY: &str = "r";
const KIND_LEAVE: &str = "l";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Ready,
    Position(PositionUpdate),
    Leave { id: EntityId },
}

#[derive(Debug, Serialize)]
struct TaggedPayload {
    t: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<EntityId>,
}

/// Loosely-typed view used to classify incoming JSON
#[derive(Debug, Deserialize)]
struct RawPayload {
    t: Option<String>,
    id: Option<EntityId>,
    x: Option<f32>,
    y: Option<f32>,
}

impl Payload {
    pub fn position(id: EntityId, x: f32, y: f32) -> Self {
        Payload::Position(PositionUpdate { id, x, y })
    }

    /// Classifies a decoded payload
    ///
    /// Anything carrying an identity and both coordinates is a position
    /// update, whatever its kind tag, unless the tag is ready or leave.
    /// Returns `Ok(None)` for objects without an identity, and for unknown
    /// kinds that lack coordinates. Returns an error only when the text is
    /// not a JSON object or an untagged update is missing a coordinate.
    pub fn parse(text: &str) -> Result<Option<Payload>, ProtocolError> {
        let raw: RawPayload = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

        match raw.t.as_deref() {
            Some(KIND_READY) => Ok(Some(Payload::Ready)),
            Some(KIND_LEAVE) => Ok(raw.id.map(|id| Payload::Leave { id })),
            Some(_) => match (raw.id, raw.x, raw.y) {
                (Some(id), Some(x), Some(y)) => Ok(Some(Payload::position(id, x, y))),
                _ => Ok(None),
            },
            None => {
                let Some(id) = raw.id else {
                    return Ok(None);
                };

                match (raw.x, raw.y) {
                    (Some(x), Some(y)) => Ok(Some(Payload::position(id, x, y))),
                    _ => Err(ProtocolError::MalformedPayload(format!(
                        "position update for {} is missing a coordinate",
                        id
                    ))),
                }
            }
        }
    }

    /// Identity the payload refers to, if any
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            Payload::Ready => None,
            Payload::Position(update) => Some(update.id),
            Payload::Leave { id } => Some(*id),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        let text = match self {
            Payload::Ready => serde_json::to_string(&TaggedPayload {
                t: KIND_READY,
                id: None,
            }),
            Payload::Position(update) => serde_json::to_string(update),
            Payload::Leave { id } => serde_json::to_string(&TaggedPayload {
                t: KIND_LEAVE,
                id: Some(*id),
            }),
        };

        text.map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}
