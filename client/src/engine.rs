//! Reconciliation engine: local movement out, remote positions in
//!
//! The engine owns the local entity and a map of every remote entity it has
//! heard about. It is driven from the frame loop and never blocks:
//!
//! 1. [`Engine::poll_connection`] runs the one-shot handshake when the
//!    transport first reports open, and clears remote state when it closes.
//! 2. [`Engine::process_inbound`] drains decoded payloads and folds each one
//!    into the remote map with [`Engine::handle_inbound`].
//! 3. [`Engine::handle_frame`] spins the local sprite and, when a direction
//!    is held, moves it and sends one position update.
//!
//! Remote updates overwrite position outright; there is no smoothing.

use crate::error::TransportError;
use crate::input::InputIntent;
use crate::transport::{ConnectionState, Transport};
use log::{debug, info, warn};
use shared::{EntityId, Payload, PositionUpdate, ProtocolError, SPIN_SPEED};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::f32::consts::TAU;

/// Opaque handle to a visual owned by a [`RenderSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VisualHandle(pub u32);

/// Where the engine reports visual changes
pub trait RenderSink {
    fn create_visual(&mut self, id: EntityId) -> VisualHandle;

    fn set_position(&mut self, handle: VisualHandle, x: f32, y: f32);

    fn remove_visual(&mut self, handle: VisualHandle);

    fn set_rotation(&mut self, _handle: VisualHandle, _radians: f32) {}
}

#[derive(Debug, Clone)]
pub struct LocalEntity {
    pub id: EntityId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    handle: VisualHandle,
}

impl LocalEntity {
    pub fn handle(&self) -> VisualHandle {
        self.handle
    }
}

#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub x: f32,
    pub y: f32,
    handle: VisualHandle,
}

impl RemoteEntity {
    pub fn handle(&self) -> VisualHandle {
        self.handle
    }
}

/// What a single inbound payload did to the remote map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created(EntityId),
    Updated(EntityId),
    Removed(EntityId),
    Ignored,
}

/// Connection lifecycle changes observed by [`Engine::poll_connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Handshake sent: ready signal followed by the initial position
    Opened,
    /// Transport closed; `dropped` remote entities were removed
    ConnectionLost { dropped: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    AwaitingOpen,
    Live,
    Lost,
}

pub struct Engine<T: Transport, R: RenderSink> {
    transport: T,
    sink: R,
    local: LocalEntity,
    remotes: HashMap<EntityId, RemoteEntity>,
    speed: f32,
    link: Link,
}

impl<T: Transport, R: RenderSink> Engine<T, R> {
    /// Creates the engine and the local entity's visual at `spawn`
    pub fn new(transport: T, mut sink: R, local_id: EntityId, spawn: (f32, f32), speed: f32) -> Self {
        let handle = sink.create_visual(local_id);
        sink.set_position(handle, spawn.0, spawn.1);

        Self {
            transport,
            sink,
            local: LocalEntity {
                id: local_id,
                x: spawn.0,
                y: spawn.1,
                rotation: 0.0,
                handle,
            },
            remotes: HashMap::new(),
            speed,
            link: Link::AwaitingOpen,
        }
    }

    /// Reacts to transport state changes; call once per frame
    pub fn poll_connection(&mut self) -> Result<Option<EngineEvent>, TransportError> {
        match (self.link, self.transport.state()) {
            (Link::AwaitingOpen, ConnectionState::Open) => {
                self.link = Link::Live;
                self.announce()?;
                Ok(Some(EngineEvent::Opened))
            }
            (Link::AwaitingOpen | Link::Live, ConnectionState::Closed) => {
                self.link = Link::Lost;
                let dropped = self.clear_remotes();
                warn!("Connection lost, removed {} remote entities", dropped);
                Ok(Some(EngineEvent::ConnectionLost { dropped }))
            }
            _ => Ok(None),
        }
    }

    fn announce(&mut self) -> Result<(), TransportError> {
        self.transport.send(&Payload::Ready.to_text()?)?;
        self.send_local_position()?;
        info!(
            "Announced entity {} at ({}, {})",
            self.local.id, self.local.x, self.local.y
        );
        Ok(())
    }

    fn send_local_position(&mut self) -> Result<(), TransportError> {
        let text = Payload::position(self.local.id, self.local.x, self.local.y).to_text()?;
        self.transport.send(&text)
    }

    /// Advances the local entity by one frame
    ///
    /// Returns `true` when a position update was sent. Nothing is sent while
    /// no direction is held, or before the handshake has gone out.
    pub fn handle_frame(&mut self, dt: f32, intent: InputIntent) -> Result<bool, TransportError> {
        self.local.rotation = (self.local.rotation + SPIN_SPEED * dt) % TAU;
        self.sink.set_rotation(self.local.handle, self.local.rotation);

        if !intent.is_moving() {
            return Ok(false);
        }

        let (dx, dy) = intent.displacement(self.speed, dt);
        self.local.x += dx;
        self.local.y += dy;
        self.sink
            .set_position(self.local.handle, self.local.x, self.local.y);

        if self.link != Link::Live {
            debug!("Not connected, holding position update");
            return Ok(false);
        }

        self.send_local_position()?;
        Ok(true)
    }

    /// Folds one decoded payload into the remote map
    ///
    /// Payloads without an identity, ready signals, and echoes of the local
    /// identity are ignored without error.
    pub fn handle_inbound(&mut self, text: &str) -> Result<Reconciled, ProtocolError> {
        let outcome = match Payload::parse(text)? {
            None | Some(Payload::Ready) => Reconciled::Ignored,
            Some(Payload::Position(update)) => self.apply_position(update),
            Some(Payload::Leave { id }) => self.remove_remote(id),
        };

        Ok(outcome)
    }

    /// Drains every waiting inbound payload; returns how many changed state
    ///
    /// After the connection is lost, whatever is still queued is discarded so
    /// cleared peers do not reappear.
    pub fn process_inbound(&mut self) -> usize {
        if self.link == Link::Lost {
            let stale = std::iter::from_fn(|| self.transport.try_recv()).count();
            if stale > 0 {
                debug!("Discarded {} messages queued before the connection was lost", stale);
            }
            return 0;
        }

        let mut applied = 0;

        while let Some(text) = self.transport.try_recv() {
            match self.handle_inbound(&text) {
                Ok(Reconciled::Ignored) => {}
                Ok(_) => applied += 1,
                Err(e) => warn!("Dropping inbound message: {}", e),
            }
        }

        applied
    }

    fn apply_position(&mut self, update: PositionUpdate) -> Reconciled {
        if update.id == self.local.id {
            return Reconciled::Ignored;
        }

        match self.remotes.entry(update.id) {
            Entry::Occupied(mut entry) => {
                let remote = entry.get_mut();
                remote.x = update.x;
                remote.y = update.y;
                self.sink.set_position(remote.handle, update.x, update.y);
                Reconciled::Updated(update.id)
            }
            Entry::Vacant(entry) => {
                let handle = self.sink.create_visual(update.id);
                self.sink.set_position(handle, update.x, update.y);
                entry.insert(RemoteEntity {
                    x: update.x,
                    y: update.y,
                    handle,
                });
                info!("Peer {} appeared at ({}, {})", update.id, update.x, update.y);
                Reconciled::Created(update.id)
            }
        }
    }

    fn remove_remote(&mut self, id: EntityId) -> Reconciled {
        match self.remotes.remove(&id) {
            Some(remote) => {
                self.sink.remove_visual(remote.handle);
                info!("Peer {} left", id);
                Reconciled::Removed(id)
            }
            None => Reconciled::Ignored,
        }
    }

    fn clear_remotes(&mut self) -> usize {
        let dropped = self.remotes.len();
        for (_, remote) in self.remotes.drain() {
            self.sink.remove_visual(remote.handle);
        }
        dropped
    }

    pub fn local(&self) -> &LocalEntity {
        &self.local
    }

    pub fn remote(&self, id: EntityId) -> Option<&RemoteEntity> {
        self.remotes.get(&id)
    }

    pub fn remotes(&self) -> impl Iterator<Item = (&EntityId, &RemoteEntity)> {
        self.remotes.iter()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_live(&self) -> bool {
        self.link == Link::Live
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &R {
        &self.sink
    }
}
