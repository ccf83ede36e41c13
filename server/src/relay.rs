//! WebSocket relay coordinating peer connections and fan-out

use crate::peer_manager::{PeerId, PeerManager};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode_frame, encode_frame, Payload};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Messages sent from connection tasks to the relay loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<Option<PeerId>>,
    },
    FrameReceived {
        peer_id: PeerId,
        raw: String,
    },
    Disconnected {
        peer_id: PeerId,
    },
    Shutdown,
}

/// Cloneable handle for stopping a running relay
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServerMessage::Shutdown);
    }
}

/// Relay server. Every frame a peer sends on the relay channel is forwarded
/// to all other peers; peer state is owned by the single `run` loop.
pub struct Server {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    peers: PeerManager,
    channel: char,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        channel: char,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on {}", local_addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener: Some(listener),
            local_addr,
            peers: PeerManager::new(max_clients),
            channel,
            server_tx,
            server_rx,
        })
    }

    /// Bound address, useful when binding to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Spawns task that accepts TCP connections and hands each to its own task
    fn spawn_acceptor(&mut self) -> Option<JoinHandle<()>> {
        let listener = self.listener.take()?;
        let server_tx = self.server_tx.clone();

        Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("Accepted TCP connection from {}", addr);
                        tokio::spawn(handle_connection(stream, addr, server_tx.clone()));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }))
    }

    /// Runs until a shutdown message arrives
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let acceptor = self
            .spawn_acceptor()
            .ok_or("relay is already running")?;
        info!("Relay started on channel '{}'", self.channel);

        while let Some(message) = self.server_rx.recv().await {
            if !self.process_message(message) {
                break;
            }
        }

        acceptor.abort();
        Ok(())
    }

    /// Applies one message to relay state; false means stop
    fn process_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Connected {
                addr,
                sender,
                reply,
            } => {
                let peer_id = self.peers.add_peer(addr, sender);
                if peer_id.is_none() {
                    warn!("Rejecting {}: server full", addr);
                }
                let _ = reply.send(peer_id);
            }
            ServerMessage::FrameReceived { peer_id, raw } => {
                self.handle_frame(peer_id, &raw);
            }
            ServerMessage::Disconnected { peer_id } => {
                self.handle_disconnect(peer_id);
            }
            ServerMessage::Shutdown => {
                info!("Relay shutting down with {} peers", self.peers.len());
                return false;
            }
        }
        true
    }

    fn handle_frame(&mut self, peer_id: PeerId, raw: &str) {
        let frame = match decode_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame from peer {}: {}", peer_id, e);
                return;
            }
        };

        if !frame.is_for(self.channel) {
            debug!(
                "Ignoring frame from peer {} on channel {:?}",
                peer_id, frame.channel
            );
            return;
        }

        match Payload::parse(&frame.text) {
            Ok(Some(Payload::Ready)) => self.send_snapshot(peer_id),
            Ok(Some(Payload::Position(update))) => {
                self.peers.record_position(peer_id, update);
                self.forward(peer_id, &frame.text);
            }
            Ok(Some(Payload::Leave { id })) => {
                self.peers.forget_entity(peer_id, id);
                self.forward(peer_id, &frame.text);
            }
            Ok(None) => self.forward(peer_id, &frame.text),
            Err(e) => warn!("Dropping payload from peer {}: {}", peer_id, e),
        }
    }

    /// Re-frames `text` on the relay channel for every other peer
    fn forward(&self, from: PeerId, text: &str) {
        match encode_frame(self.channel, text) {
            Ok(frame) => {
                let delivered = self.peers.broadcast(&frame, Some(from));
                debug!("Forwarded frame from peer {} to {} peers", from, delivered);
            }
            Err(e) => error!("Failed to encode frame: {}", e),
        }
    }

    /// Sends the last known position of every other identity to a joining peer
    fn send_snapshot(&self, peer_id: PeerId) {
        let snapshot = self.peers.snapshot_excluding(peer_id);
        debug!("Sending {} positions to peer {}", snapshot.len(), peer_id);

        for update in snapshot {
            let frame = Payload::Position(update)
                .to_text()
                .and_then(|text| encode_frame(self.channel, &text));
            match frame {
                Ok(frame) => {
                    self.peers.send_to(peer_id, frame);
                }
                Err(e) => error!("Failed to encode snapshot entry: {}", e),
            }
        }
    }

    fn handle_disconnect(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.remove_peer(&peer_id) else {
            return;
        };

        for id in peer.positions.keys() {
            let leave = Payload::Leave { id: *id }.to_text();
            match leave.and_then(|text| encode_frame(self.channel, &text)) {
                Ok(frame) => {
                    self.peers.broadcast(&frame, None);
                }
                Err(e) => error!("Failed to encode leave for {}: {}", id, e),
            }
        }
    }
}

/// Owns one WebSocket for its whole life
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let (reply_tx, reply_rx) = oneshot::channel();
    let connected = ServerMessage::Connected {
        addr,
        sender: frame_tx,
        reply: reply_tx,
    };
    if server_tx.send(connected).is_err() {
        return;
    }

    let peer_id = match reply_rx.await {
        Ok(Some(peer_id)) => peer_id,
        _ => {
            let close = CloseFrame {
                code: CloseCode::Again,
                reason: "Server full".into(),
            };
            let _ = write.send(Message::Close(Some(close))).await;
            return;
        }
    };

    loop {
        tokio::select! {
            outbound = frame_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        debug!("Write to peer {} failed: {}", peer_id, e);
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(raw))) => {
                    if server_tx.send(ServerMessage::FrameReceived { peer_id, raw }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(raw) => {
                        if server_tx.send(ServerMessage::FrameReceived { peer_id, raw }).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary frame from peer {}", peer_id),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read from peer {} failed: {}", peer_id, e);
                    break;
                }
            },
        }
    }

    let _ = server_tx.send(ServerMessage::Disconnected { peer_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{decode_frame, PositionUpdate};

    async fn test_server(max_clients: usize) -> Server {
        Server::new("127.0.0.1:0", max_clients, 'd').await.unwrap()
    }

    fn connect(server: &mut Server, port: u16) -> (PeerId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        server.process_message(ServerMessage::Connected {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            sender: tx,
            reply: reply_tx,
        });
        let peer_id = reply_rx.try_recv().unwrap().unwrap();
        (peer_id, rx)
    }

    fn frame(server: &mut Server, peer_id: PeerId, text: &str) {
        server.process_message(ServerMessage::FrameReceived {
            peer_id,
            raw: encode_frame('d', text).unwrap(),
        });
    }

    fn payloads(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let frame = decode_frame(&raw).unwrap();
            assert_eq!(frame.channel, Some('d'));
            out.push(Payload::parse(&frame.text).unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = test_server(4).await;
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_position_forwarded_to_others_only() {
        let mut server = test_server(4).await;
        let (a, mut rx_a) = connect(&mut server, 1);
        let (_b, mut rx_b) = connect(&mut server, 2);

        frame(&mut server, a, r#"{"id":7,"x":10,"y":20}"#);

        assert!(payloads(&mut rx_a).is_empty());
        assert_eq!(
            payloads(&mut rx_b),
            vec![Payload::Position(PositionUpdate { id: 7, x: 10.0, y: 20.0 })]
        );
    }

    #[tokio::test]
    async fn test_ready_receives_snapshot() {
        let mut server = test_server(4).await;
        let (a, _rx_a) = connect(&mut server, 1);
        frame(&mut server, a, r#"{"id":7,"x":1,"y":1}"#);
        frame(&mut server, a, r#"{"id":7,"x":5,"y":6}"#);

        let (b, mut rx_b) = connect(&mut server, 2);
        frame(&mut server, b, r#"{"t":"r"}"#);

        assert_eq!(
            payloads(&mut rx_b),
            vec![Payload::Position(PositionUpdate { id: 7, x: 5.0, y: 6.0 })]
        );
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_leave() {
        let mut server = test_server(4).await;
        let (a, _rx_a) = connect(&mut server, 1);
        let (_b, mut rx_b) = connect(&mut server, 2);

        frame(&mut server, a, r#"{"id":7,"x":1,"y":1}"#);
        payloads(&mut rx_b);

        server.process_message(ServerMessage::Disconnected { peer_id: a });
        assert_eq!(payloads(&mut rx_b), vec![Payload::Leave { id: 7 }]);
        assert_eq!(server.peer_count(), 1);

        // A second disconnect for the same peer is a no-op
        server.process_message(ServerMessage::Disconnected { peer_id: a });
        assert!(payloads(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_explicit_leave_is_not_repeated_on_disconnect() {
        let mut server = test_server(4).await;
        let (a, _rx_a) = connect(&mut server, 1);
        let (_b, mut rx_b) = connect(&mut server, 2);

        frame(&mut server, a, r#"{"id":7,"x":1,"y":1}"#);
        frame(&mut server, a, r#"{"t":"l","id":7}"#);
        assert_eq!(payloads(&mut rx_b).len(), 2);

        server.process_message(ServerMessage::Disconnected { peer_id: a });
        assert!(payloads(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let mut server = test_server(4).await;
        let (a, _rx_a) = connect(&mut server, 1);
        let (_b, mut rx_b) = connect(&mut server, 2);

        server.process_message(ServerMessage::FrameReceived {
            peer_id: a,
            raw: "{not json".to_string(),
        });
        frame(&mut server, a, r#"{"id":7,"x":1}"#);
        server.process_message(ServerMessage::FrameReceived {
            peer_id: a,
            raw: encode_frame('z', r#"{"id":7,"x":1,"y":1}"#).unwrap(),
        });

        assert!(rx_b.try_recv().is_err());
        assert_eq!(server.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_payload_forwarded_verbatim() {
        let mut server = test_server(4).await;
        let (a, _rx_a) = connect(&mut server, 1);
        let (_b, mut rx_b) = connect(&mut server, 2);

        frame(&mut server, a, r#"{"t":"chat","msg":"hi"}"#);

        let raw = rx_b.try_recv().unwrap();
        let forwarded = decode_frame(&raw).unwrap();
        assert_eq!(forwarded.text, r#"{"t":"chat","msg":"hi"}"#);
    }

    #[tokio::test]
    async fn test_capacity_rejects_extra_peer() {
        let mut server = test_server(1).await;
        connect(&mut server, 1);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        server.process_message(ServerMessage::Connected {
            addr: SocketAddr::from(([127, 0, 0, 1], 2)),
            sender: tx,
            reply: reply_tx,
        });

        assert_eq!(reply_rx.try_recv().unwrap(), None);
        assert_eq!(server.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let mut server = test_server(1).await;
        let handle = server.handle();
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), server.run()).await;
        let run = tokio_test::assert_ok!(result);
        assert!(run.is_ok());
    }
}
