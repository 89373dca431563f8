use clap::Parser;
use glove_bridge::bridge;
use glove_bridge::config::{Config, load_dotenv};
use log::{error, info};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal;

/// Relay glove IMU readings from UDP to WebSocket clients.
///
/// Every flag falls back to its environment variable, then to the built-in
/// default.
#[derive(Parser)]
#[command(name = "glove-bridge")]
struct Cli {
    /// Address to receive glove datagrams on
    #[arg(long, env = "GLOVE_UDP_BIND")]
    udp_bind: Option<IpAddr>,

    /// UDP port the glove sends to
    #[arg(long, env = "GLOVE_UDP_PORT")]
    udp_port: Option<u16>,

    /// Address for the WebSocket server
    #[arg(long, env = "GLOVE_WS_BIND")]
    ws_bind: Option<IpAddr>,

    /// WebSocket port browsers connect to
    #[arg(long, env = "GLOVE_WS_PORT")]
    ws_port: Option<u16>,

    /// Interval between pushes to each client, in milliseconds
    #[arg(long, env = "GLOVE_PUSH_INTERVAL_MS")]
    push_interval_ms: Option<u64>,

    /// CSV file written while recording
    #[arg(long, env = "GLOVE_RECORD_PATH")]
    record_path: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.udp_bind {
            config.ingest.bind = bind;
        }
        if let Some(port) = self.udp_port {
            config.ingest.port = port;
        }
        if let Some(bind) = self.ws_bind {
            config.clients.bind = bind;
        }
        if let Some(port) = self.ws_port {
            config.clients.port = port;
        }
        if let Some(ms) = self.push_interval_ms {
            config.clients.push_interval_ms = ms;
        }
        if let Some(path) = self.record_path {
            config.recording.path = path;
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Load .env file before the runtime spawns its worker threads
    load_dotenv();
    init_logger();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run());
}

async fn run() {
    info!("Starting Glove Bridge");

    let mut config = Config::from_env();
    Cli::parse().apply(&mut config);
    info!("Configuration loaded:");
    info!("  UDP ingest: {}", config.ingest.socket_addr());
    info!("  WebSocket: {}", config.clients.socket_addr());
    info!("  Push interval: {:?}", config.clients.push_interval());
    info!("  Recording file: {}", config.recording.path.display());

    let running = match bridge::start(&config).await {
        Ok(running) => running,
        Err(e) => {
            error!("Failed to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    info!("Glove Bridge is running");
    info!("  - Press Ctrl+C to exit");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    if let Err(e) = running.shutdown().await {
        error!("Error during shutdown: {}", e);
    }

    info!("Glove Bridge stopped");
}
