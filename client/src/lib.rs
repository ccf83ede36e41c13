//! # Position Sync Client Library
//!
//! Client side of a minimal real-time position-sync layer. The client moves
//! one locally controlled sprite, publishes its position over a persistent
//! WebSocket connection, and mirrors the positions of every remote peer the
//! relay server forwards to it.
//!
//! ## Architecture Overview
//!
//! Two components, composed in strict dependency order:
//!
//! ### Transport Channel (`transport`)
//! Owns one connection to one endpoint:
//! - Background connect with bounded, exponentially backed-off retries
//! - Event-driven "connection is open" notification with timeout and cancel
//! - Channel-tagged, base64 framed sends that fail with `NotConnected`
//!   until the connection is open
//! - Inbound decode; malformed frames are logged and dropped
//!
//! ### Reconciliation Engine (`engine`)
//! Owns all entity state:
//! - The local entity, moved by directional input each frame
//! - A map from identity to remote entity, created on first sighting and
//!   overwritten on every later update
//! - A one-shot handshake (ready signal, then initial position) when the
//!   connection first opens
//! - Removal of peers on leave messages and of all peers on connection loss
//!
//! The engine only sees the network through the [`transport::Transport`]
//! trait and only sees the screen through the [`engine::RenderSink`] trait,
//! so it runs in tests without sockets or a window.
//!
//! ## Threading
//!
//! Socket I/O runs on a tokio runtime. Entity state lives on the frame loop's
//! thread and is only touched there; the two sides exchange plain text over
//! channels.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::engine::Engine;
//! use client::input::InputIntent;
//! use client::rendering::Renderer;
//! use client::transport::{ConnectOptions, Connection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let connection = Connection::open(
//!     "ws://127.0.0.1:3024",
//!     ConnectOptions::default(),
//!     runtime.handle(),
//! );
//!
//! let id = shared::generate_entity_id();
//! let mut engine = Engine::new(connection, Renderer::new(), id, (960.0, 540.0), 200.0);
//!
//! loop {
//!     engine.poll_connection()?;
//!     engine.process_inbound();
//!     engine.handle_frame(1.0 / 60.0, InputIntent::default())?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod input;
pub mod rendering;
pub mod transport;

pub use engine::{Engine, EngineEvent, Reconciled, RenderSink, VisualHandle};
pub use error::TransportError;
pub use input::{InputIntent, InputSource};
pub use transport::{ConnectOptions, Connection, ConnectionState, Transport};
