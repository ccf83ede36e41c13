//! Transport channel: one WebSocket connection with channel-tagged framing
//!
//! [`Connection::open`] spawns an I/O task on a tokio runtime and returns
//! immediately. The task owns the socket. The rest of the client talks to it
//! through channels only:
//! - outbound frames go through an unbounded mpsc queue, so sends from one
//!   frame are written in call order
//! - decoded inbound payloads come back through a second mpsc queue, in the
//!   order the socket received them
//! - the connection state is published on a watch channel
//!
//! This keeps all entity state on the caller's thread; nothing here needs a
//! lock.

use crate::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{decode_frame, encode_frame, DEFAULT_CHANNEL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// The seam between the reconciliation engine and the network
pub trait Transport {
    fn state(&self) -> ConnectionState;

    /// Frames and transmits `plain_text`; fails with `NotConnected` unless open
    fn send(&mut self, plain_text: &str) -> Result<(), TransportError>;

    /// Next decoded inbound payload, if one is waiting
    fn try_recv(&mut self) -> Option<String>;
}

/// Tuning for how a connection is established
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub channel: char,
    /// Connection attempts before giving up, at least one is always made
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Handle returned by [`Connection::await_open`]
pub struct ReadyHandle {
    task: JoinHandle<()>,
}

impl ReadyHandle {
    /// Drops the pending callback. Has no effect once it has fired.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Client side of one persistent connection to a relay
pub struct Connection {
    endpoint: String,
    channel: char,
    runtime: Handle,
    state_rx: watch::Receiver<ConnectionState>,
    opened: Arc<AtomicBool>,
    outbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Starts connecting to `endpoint` in the background
    ///
    /// Bare `host:port` endpoints are treated as `ws://host:port`.
    pub fn open(endpoint: &str, options: ConnectOptions, runtime: &Handle) -> Self {
        let endpoint = normalize_endpoint(endpoint);
        let channel = options.channel;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        runtime.spawn(run_connection(
            endpoint.clone(),
            options,
            state_tx,
            Arc::clone(&opened),
            outbound_rx,
            inbound_tx,
            Arc::clone(&shutdown),
        ));

        Connection {
            endpoint,
            channel,
            runtime: runtime.clone(),
            state_rx,
            opened,
            outbound_tx,
            inbound_rx,
            shutdown,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn channel(&self) -> char {
        self.channel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Waits until the connection is open, or fails if it closes or `timeout` elapses
    pub async fn wait_open(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let mut state_rx = self.state_rx.clone();
        wait_for_open(
            &mut state_rx,
            &self.opened,
            &self.endpoint,
            timeout,
        )
        .await
    }

    /// Registers `on_ready` to run once, the first time the connection is open
    ///
    /// The callback never runs if the connection closes first, if `timeout`
    /// elapses, or if the returned handle is cancelled. It runs on the tokio
    /// runtime, not on the caller's thread.
    pub fn await_open<F>(&self, timeout: Option<Duration>, on_ready: F) -> ReadyHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state_rx = self.state_rx.clone();
        let opened = Arc::clone(&self.opened);
        let endpoint = self.endpoint.clone();

        let task = self.runtime.spawn(async move {
            match wait_for_open(&mut state_rx, &opened, &endpoint, timeout).await {
                Ok(()) => on_ready(),
                Err(e) => debug!("Ready callback for {} not run: {}", endpoint, e),
            }
        });

        ReadyHandle { task }
    }

    pub fn send(&self, plain_text: &str) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }

        let frame = encode_frame(self.channel, plain_text)?;
        self.outbound_tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost)
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.inbound_rx.try_recv().ok()
    }

    /// Waits for the next inbound payload; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound_rx.recv().await
    }

    /// Sends a close frame and stops the I/O task
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

impl Transport for Connection {
    fn state(&self) -> ConnectionState {
        Connection::state(self)
    }

    fn send(&mut self, plain_text: &str) -> Result<(), TransportError> {
        Connection::send(self, plain_text)
    }

    fn try_recv(&mut self) -> Option<String> {
        Connection::try_recv(self)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        format!("ws://{}", endpoint)
    }
}

async fn wait_for_open(
    state_rx: &mut watch::Receiver<ConnectionState>,
    opened: &AtomicBool,
    endpoint: &str,
    timeout: Option<Duration>,
) -> Result<(), TransportError> {
    let settled = state_rx.wait_for(|state| *state != ConnectionState::Connecting);

    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, settled)
            .await
            .map_err(|_| TransportError::Timeout)?,
        None => settled.await,
    };

    let state = outcome
        .map(|state| *state)
        .map_err(|_| TransportError::ConnectionLost)?;

    match state {
        ConnectionState::Open => Ok(()),
        _ if opened.load(Ordering::Acquire) => Err(TransportError::ConnectionLost),
        _ => Err(TransportError::ConnectFailed(endpoint.to_string())),
    }
}

/// Tries to connect up to `max_attempts` times with exponential backoff
async fn connect_with_backoff(endpoint: &str, options: &ConnectOptions) -> Option<WsStream> {
    let max_attempts = options.max_attempts.max(1);
    let mut backoff = options.initial_backoff;

    for attempt in 1..=max_attempts {
        match connect_async(endpoint).await {
            Ok((ws_stream, _)) => return Some(ws_stream),
            Err(e) => {
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt, max_attempts, endpoint, e
                );
                if attempt < max_attempts {
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(options.max_backoff);
                }
            }
        }
    }

    error!("Giving up on {} after {} attempts", endpoint, max_attempts);
    None
}

async fn run_connection(
    endpoint: String,
    options: ConnectOptions,
    state_tx: watch::Sender<ConnectionState>,
    opened: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<String>,
    shutdown: Arc<Notify>,
) {
    let ws_stream = tokio::select! {
        _ = shutdown.notified() => None,
        ws_stream = connect_with_backoff(&endpoint, &options) => ws_stream,
    };

    let Some(ws_stream) = ws_stream else {
        state_tx.send_replace(ConnectionState::Closed);
        return;
    };

    info!("Connected to {}", endpoint);
    opened.store(true, Ordering::Release);
    state_tx.send_replace(ConnectionState::Open);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            },

            outbound = outbound_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        warn!("Error sending frame to {}: {}", endpoint, e);
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },

            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(raw))) => dispatch_inbound(&raw, options.channel, &inbound_tx),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(raw) => dispatch_inbound(&raw, options.channel, &inbound_tx),
                    Err(e) => warn!("Dropping non-UTF-8 binary frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Server closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Connection to {} failed: {}", endpoint, e);
                    break;
                }
                None => break,
            },
        }
    }

    info!("Disconnected from {}", endpoint);
    state_tx.send_replace(ConnectionState::Closed);
}

/// Decodes one raw frame and forwards its payload; malformed frames are dropped
fn dispatch_inbound(raw: &str, channel: char, inbound_tx: &mpsc::UnboundedSender<String>) {
    match decode_frame(raw) {
        Ok(frame) if frame.is_for(channel) => {
            debug!("received data={}", frame.text);
            let _ = inbound_tx.send(frame.text);
        }
        Ok(frame) => debug!("Ignoring frame on channel {:?}", frame.channel),
        Err(e) => warn!("Dropping malformed frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn quick_options() -> ConnectOptions {
        ConnectOptions {
            max_attempts: 1,
            ..ConnectOptions::default()
        }
    }

    /// Accepts one WebSocket client, writes `greeting` frames, then echoes
    async fn spawn_echo_server(greeting: Vec<String>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            for frame in greeting {
                ws.send(Message::Text(frame)).await.unwrap();
            }

            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        addr
    }

    async fn wait_for_state(connection: &Connection, wanted: ConnectionState) {
        for _ in 0..200 {
            if connection.state() == wanted {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("connection never reached {:?}", wanted);
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("127.0.0.1:3024"), "ws://127.0.0.1:3024");
        assert_eq!(normalize_endpoint("ws://host:1"), "ws://host:1");
        assert_eq!(normalize_endpoint("wss://host:1"), "wss://host:1");
    }

    #[test]
    fn test_default_options() {
        let options = ConnectOptions::default();
        assert_eq!(options.channel, 'd');
        assert!(options.max_attempts >= 1);
        assert!(options.initial_backoff <= options.max_backoff);
    }

    #[tokio::test]
    async fn test_send_before_open_is_not_connected() {
        let connection = Connection::open("ws://127.0.0.1:1", quick_options(), &Handle::current());

        assert_ne!(connection.state(), ConnectionState::Open);
        assert_eq!(
            connection.send(r#"{"t":"r"}"#),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_to_open() {
        let connection = Connection::open("127.0.0.1:1", quick_options(), &Handle::current());

        let result = connection.wait_open(Some(Duration::from_secs(5))).await;
        assert_eq!(
            result,
            Err(TransportError::ConnectFailed("ws://127.0.0.1:1".to_string()))
        );
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.send("late"), Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_await_open_fires_exactly_once() {
        let addr = spawn_echo_server(Vec::new()).await;
        let connection = Connection::open(&addr.to_string(), quick_options(), &Handle::current());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let state_seen = Arc::new(AtomicBool::new(false));
        let open_seen = Arc::clone(&state_seen);
        let state_rx = connection.state_rx.clone();

        let handle = connection.await_open(Some(Duration::from_secs(5)), move || {
            open_seen.store(*state_rx.borrow() == ConnectionState::Open, Ordering::SeqCst);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        connection.wait_open(Some(Duration::from_secs(5))).await.unwrap();

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        // Further state polling must not re-run the callback
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(state_seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_ready_callback_never_fires() {
        // Accepts TCP but never answers the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            sleep(Duration::from_secs(10)).await;
        });

        let connection = Connection::open(&addr.to_string(), quick_options(), &Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let handle = connection.await_open(None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_open_times_out_while_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            sleep(Duration::from_secs(10)).await;
        });

        let connection = Connection::open(&addr.to_string(), quick_options(), &Handle::current());
        let result = connection.wait_open(Some(Duration::from_millis(50))).await;
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_send_roundtrip_through_echo() {
        let addr = spawn_echo_server(Vec::new()).await;
        let mut connection =
            Connection::open(&addr.to_string(), quick_options(), &Handle::current());
        tokio_test::assert_ok!(connection.wait_open(Some(Duration::from_secs(5))).await);

        let payloads = [r#"{"id":1,"x":2,"y":3}"#, "quote \" and {brace}", "ctrl \u{1}\n"];
        for payload in payloads {
            tokio_test::assert_ok!(connection.send(payload));
        }

        for payload in payloads {
            let received = tokio::time::timeout(Duration::from_secs(5), connection.recv())
                .await
                .unwrap();
            assert_eq!(received.as_deref(), Some(payload));
        }
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_frames_are_dropped() {
        let greeting = vec![
            "garbage{".to_string(),
            r#"{"c":"d","m":"!!!"}"#.to_string(),
            encode_frame('x', "other channel").unwrap(),
            encode_frame('d', "kept").unwrap(),
        ];
        let addr = spawn_echo_server(greeting).await;
        let mut connection =
            Connection::open(&addr.to_string(), quick_options(), &Handle::current());
        connection.wait_open(Some(Duration::from_secs(5))).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), connection.recv())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some("kept"));
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_server_close_moves_to_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let connection = Connection::open(&addr.to_string(), quick_options(), &Handle::current());
        wait_for_state(&connection, ConnectionState::Closed).await;

        assert_eq!(connection.send("after close"), Err(TransportError::NotConnected));
        assert_eq!(
            connection.wait_open(Some(Duration::from_secs(1))).await,
            Err(TransportError::ConnectionLost)
        );
    }
}
