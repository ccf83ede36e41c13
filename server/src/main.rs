use clap::Parser;
use log::{error, info};
use server::Server;
use shared::{DEFAULT_CHANNEL, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of concurrent peers
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Channel tag the relay accepts and forwards
    #[arg(short, long, default_value_t = DEFAULT_CHANNEL)]
    channel: char,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting relay on {}", address);
    info!("Max clients: {}", args.max_clients);

    let mut server = Server::new(&address, args.max_clients, args.channel).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
