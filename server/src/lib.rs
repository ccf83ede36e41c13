//! # Position Relay Server Library
//!
//! Relay for the position-sync clients. The relay holds no authority over
//! positions: it accepts WebSocket connections, decodes each channel-tagged
//! frame, and forwards the payload to every other connected peer.
//!
//! ## Core Responsibilities
//!
//! ### Fan-out
//! Every frame received on the relay channel is re-framed and queued for all
//! peers except the sender. Payloads the relay does not understand are still
//! forwarded verbatim so clients can extend the protocol.
//!
//! ### Late-join Snapshot
//! The relay remembers the last position announced for each identity. When a
//! peer sends the ready signal it receives one position update per identity
//! owned by the other peers, so it does not have to wait for them to move.
//!
//! ### Departure
//! When a connection ends, a leave message is broadcast for every identity
//! that connection announced. Explicit leave messages are forwarded as-is.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! Each WebSocket is driven by its own task, but all peer state lives in the
//! `relay::Server::run` loop. Connection tasks talk to it through
//! `relay::ServerMessage` values and receive outbound frames on a private
//! queue, so the roster is never shared behind a lock.
//!
//! ### Trust Boundary
//! Identities are chosen by clients and are not verified. A peer can announce
//! any identity and the relay forwards it.
//!
//! ## Module Organization
//!
//! ### Peer Manager Module (`peer_manager`)
//! - Capacity-limited roster of connected peers
//! - Outbound queue per peer
//! - Last known position per announced identity
//!
//! ### Relay Module (`relay`)
//! - TCP accept loop and WebSocket handshake
//! - Frame decoding, channel filtering, and payload routing
//! - Snapshot and leave generation

pub mod peer_manager;
pub mod relay;

pub use peer_manager::{PeerId, PeerManager};
pub use relay::{Server, ServerHandle, ServerMessage};
