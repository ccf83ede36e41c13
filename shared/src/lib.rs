//! Protocol pieces shared by the client and the relay server
//!
//! Every message on the wire is a text frame holding an [`Envelope`]: a
//! single-character channel tag plus a base64 encoded application payload.
//! The payload itself is a small JSON object, see [`Payload`].

pub mod envelope;
pub mod error;
pub mod payload;

pub use envelope::{decode_frame, encode_frame, Envelope, InboundFrame};
pub use error::ProtocolError;
pub use payload::{Payload, PositionUpdate};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identity of a participant, stable for the lifetime of one client session
pub type EntityId = u64;

pub const DEFAULT_CHANNEL: char = 'd';
pub const DEFAULT_PORT: u16 = 3024;

/// Local movement speed in units per second
pub const PLAYER_SPEED: f32 = 200.0;
/// Idle spin of the local sprite in radians per second
pub const SPIN_SPEED: f32 = std::f32::consts::PI;

pub const WORLD_WIDTH: f32 = 1920.0;
pub const WORLD_HEIGHT: f32 = 1080.0;

/// Derives a session identity from the wall clock in microseconds
///
/// Collisions are not checked; two clients starting in the same microsecond
/// would share an identity.
pub fn generate_entity_id() -> EntityId {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_micros() as EntityId
}

/// Spawn point at the centre of a `width` x `height` area
pub fn spawn_point(width: f32, height: f32) -> (f32, f32) {
    (width / 2.0, height / 2.0)
}
