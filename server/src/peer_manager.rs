//! Connected peer bookkeeping for the relay
//!
//! This module tracks every live WebSocket connection, including:
//! - Peer lifecycle (connect, disconnect) and capacity limits
//! - The outbound queue used to reach each peer
//! - The identities each peer has announced and their last known position
//!
//! Positions are kept only so late joiners can be sent a snapshot and so a
//! leave can be broadcast for every identity when a peer drops. The relay
//! does not validate who owns an identity.

use log::{debug, info};
use shared::{EntityId, PositionUpdate};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type PeerId = u32;

/// One connected client
#[derive(Debug)]
pub struct Peer {
    /// Relay-assigned connection identifier
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Last position per identity announced over this connection
    pub positions: HashMap<EntityId, PositionUpdate>,
    sender: mpsc::UnboundedSender<String>,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            addr,
            positions: HashMap::new(),
            sender,
        }
    }

    /// Queues one wire frame; false if the connection task is gone
    pub fn send(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// Manages all connected peers
pub struct PeerManager {
    peers: HashMap<PeerId, Peer>,
    next_peer_id: PeerId,
    max_peers: usize,
}

impl PeerManager {
    /// Creates an empty roster. Peer ids start from 1.
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
        }
    }

    /// Returns `None` when the relay is at capacity
    pub fn add_peer(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<String>,
    ) -> Option<PeerId> {
        if self.peers.len() >= self.max_peers {
            return None;
        }

        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        info!("Peer {} connected from {}", peer_id, addr);
        self.peers.insert(peer_id, Peer::new(peer_id, addr, sender));

        Some(peer_id)
    }

    /// Removes a peer and hands it back so its identities can be retired
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<Peer> {
        let peer = self.peers.remove(peer_id)?;
        info!(
            "Peer {} disconnected ({} identities)",
            peer.id,
            peer.positions.len()
        );
        Some(peer)
    }

    /// Remembers the latest position `peer_id` announced for `update.id`
    pub fn record_position(&mut self, peer_id: PeerId, update: PositionUpdate) -> bool {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                if peer.positions.insert(update.id, update).is_none() {
                    debug!("Peer {} announced identity {}", peer_id, update.id);
                }
                true
            }
            None => false,
        }
    }

    pub fn forget_entity(&mut self, peer_id: PeerId, id: EntityId) -> bool {
        self.peers
            .get_mut(&peer_id)
            .map_or(false, |peer| peer.positions.remove(&id).is_some())
    }

    /// Last known position of every identity announced by other peers
    pub fn snapshot_excluding(&self, peer_id: PeerId) -> Vec<PositionUpdate> {
        self.peers
            .values()
            .filter(|peer| peer.id != peer_id)
            .flat_map(|peer| peer.positions.values().copied())
            .collect()
    }

    pub fn send_to(&self, peer_id: PeerId, frame: String) -> bool {
        self.peers
            .get(&peer_id)
            .map_or(false, |peer| peer.send(frame))
    }

    /// Queues `frame` for every peer except `exclude`; returns how many accepted it
    pub fn broadcast(&self, frame: &str, exclude: Option<PeerId>) -> usize {
        self.peers
            .values()
            .filter(|peer| Some(peer.id) != exclude)
            .filter(|peer| peer.send(frame.to_string()))
            .count()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    /// Returns the number of currently connected peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
