use clap::Parser;
use client::engine::{Engine, EngineEvent};
use client::input::{InputSource, KeyboardInput};
use client::rendering::{HudConfig, Renderer};
use client::transport::{ConnectOptions, Connection};
use log::{error, info, warn};
use macroquad::prelude::*;
use shared::{generate_entity_id, spawn_point, DEFAULT_CHANNEL, PLAYER_SPEED};
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay server endpoint (ws:// or wss://, bare host:port means ws://)
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:3024")]
    server: String,

    /// Channel tag used to frame messages
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHANNEL)]
    channel: char,

    /// Movement speed in units per second
    #[arg(long, default_value_t = PLAYER_SPEED)]
    speed: f32,

    /// Window width
    #[arg(short = 'w', long, default_value = "1920")]
    width: i32,

    /// Window height (no short flag to avoid conflict with --help)
    #[arg(long, default_value = "1080")]
    height: i32,

    /// Connection attempts before giving up
    #[arg(long, default_value = "5")]
    connect_attempts: u32,

    /// Give up waiting for the connection to open after this many milliseconds
    #[arg(long)]
    open_timeout_ms: Option<u64>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

/// Command line, parsed once and shared by window setup and the client loop
fn args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

fn window_conf() -> Conf {
    let args = args();
    Conf {
        window_title: "peersync".to_owned(),
        window_width: args.width,
        window_height: args.height,
        window_resizable: true,
        ..Default::default()
    }
}

#[macroquad::main(window_conf)]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    if let Err(e) = run(args()).await {
        error!("Client stopped: {}", e);
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;

    let local_id = generate_entity_id();
    info!("Starting client as entity {}", local_id);
    info!("Connecting to: {}", args.server);
    info!("Controls: arrow keys or WASD to move, Escape to quit");

    let options = ConnectOptions {
        channel: args.channel,
        max_attempts: args.connect_attempts,
        ..ConnectOptions::default()
    };
    let connection = Connection::open(&args.server, options, runtime.handle());

    let endpoint = connection.endpoint().to_string();
    let _ready = connection.await_open(
        args.open_timeout_ms.map(Duration::from_millis),
        move || info!("Connection to {} is open", endpoint),
    );

    let spawn = spawn_point(args.width as f32, args.height as f32);
    let mut engine = Engine::new(connection, Renderer::new(), local_id, spawn, args.speed);
    let keyboard = KeyboardInput::new();

    loop {
        if keyboard.quit_requested() {
            break;
        }

        match engine.poll_connection() {
            Ok(Some(EngineEvent::Opened)) => info!("Handshake sent"),
            Ok(Some(EngineEvent::ConnectionLost { dropped })) => {
                warn!("Connection closed, cleared {} peers", dropped)
            }
            Ok(None) => {}
            Err(e) => warn!("Handshake failed: {}", e),
        }

        engine.process_inbound();

        if let Err(e) = engine.handle_frame(get_frame_time(), keyboard.intent()) {
            warn!("Error sending position: {}", e);
        }

        engine.sink().render(HudConfig {
            local: engine.local().handle(),
            state: engine.transport().state(),
            peer_count: engine.remote_count(),
        });

        next_frame().await;
    }

    engine.transport().close();
    Ok(())
}
