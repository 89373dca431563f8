//! Development tool for exercising a running glove bridge without the glove
//! or the web app.
//!
//! Usage:
//!   cargo run --bin bridge-cli -- watch
//!   cargo run --bin bridge-cli -- record --seconds 10
//!   cargo run --bin bridge-cli -- simulate --rate-hz 50

use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use glove_bridge::config::{DEFAULT_UDP_PORT, DEFAULT_WS_PORT};
use glove_bridge::session::{ControlCommand, ServerFrame};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Development tool for the glove bridge")]
struct Cli {
    /// Bridge WebSocket URL
    #[arg(long, env = "GLOVE_BRIDGE_URL", default_value_t = format!("ws://localhost:{DEFAULT_WS_PORT}"))]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print frames pushed by the bridge
    Watch {
        /// Stop after this many reading frames (0 = forever)
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
    /// Record for a fixed time: send START_REC, wait, send STOP_REC
    Record {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Send synthetic glove datagrams to the bridge's UDP port
    Simulate {
        /// Bridge UDP address
        #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_UDP_PORT}"))]
        target: String,

        #[arg(long, default_value_t = 50)]
        rate_hz: u32,

        /// Stop after this many datagrams (0 = forever)
        #[arg(long, default_value_t = 0)]
        count: u64,
    },
}

/// A plausible reading: both hands at rest with a slow wobble on the gyros.
fn synthetic_line(step: u64) -> String {
    let t = step as f64 * 0.05;
    let (s, c) = (t.sin(), t.cos());
    format!(
        "{:.3},{:.3},{:.3},{:.2},{:.2},{:.2},{:.3},{:.3},{:.3},{:.2},{:.2},{:.2}",
        0.02 * s,
        0.01 * c,
        9.81,
        5.0 * s,
        3.0 * c,
        1.0 * s,
        0.01 * c,
        0.02 * s,
        9.79,
        2.0 * c,
        4.0 * s,
        6.0 * c,
    )
}

fn command_message(command: ControlCommand) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(&command)?.into()))
}

async fn simulate(
    target: &str,
    rate_hz: u32,
    count: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
    let mut interval = tokio::time::interval(period);

    println!("Sending synthetic readings to {} at {} Hz", target, rate_hz);
    let mut step = 0u64;
    while count == 0 || step < count {
        interval.tick().await;
        socket.send_to(synthetic_line(step).as_bytes(), target).await?;
        step += 1;
        if step % u64::from(rate_hz.max(1)) == 0 {
            println!("Sent {} datagrams", step);
        }
    }
    Ok(())
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &str) -> Result<WsStream, Box<dyn std::error::Error>> {
    println!("Connecting to bridge at {}...", server);

    let (ws_stream, _) = connect_async(server).await.map_err(|e| {
        eprintln!("Failed to connect to {}", server);
        eprintln!("Make sure glove-bridge is running and accessible.");
        eprintln!("Error: {}", e);
        e
    })?;

    println!("Connected!");
    Ok(ws_stream)
}

async fn watch(ws_stream: WsStream, count: u64) {
    let (_write, mut read) = ws_stream.split();
    let mut seen = 0u64;

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let text_str: &str = &text;
                match serde_json::from_str::<ServerFrame>(text_str) {
                    Ok(ServerFrame::Reading { raw }) => {
                        println!("{}", raw);
                        seen += 1;
                        if count != 0 && seen >= count {
                            break;
                        }
                    }
                    Ok(other) => println!("Bridge: {:?}", other),
                    Err(_) => println!("Received: {}", text),
                }
            }
            Ok(Message::Close(_)) => {
                println!("Bridge closed connection");
                break;
            }
            Err(e) => {
                eprintln!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }
}

async fn record(ws_stream: WsStream, seconds: u64) -> Result<(), Box<dyn std::error::Error>> {
    let (mut write, mut read) = ws_stream.split();

    write
        .send(command_message(ControlCommand::StartRecording)?)
        .await?;
    println!("Recording for {} seconds...", seconds);

    // Keep draining pushes so the bridge never blocks on us
    let drained = tokio::time::timeout(Duration::from_secs(seconds), async {
        let mut readings = 0u64;
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                let text_str: &str = &text;
                match serde_json::from_str::<ServerFrame>(text_str) {
                    Ok(ServerFrame::Reading { .. }) => readings += 1,
                    Ok(ServerFrame::Error { error }) => {
                        eprintln!("Bridge rejected command: {}", error);
                        return Err(error);
                    }
                    Ok(other) => println!("Bridge: {:?}", other),
                    Err(_) => {}
                }
            }
        }
        Ok(readings)
    })
    .await;

    match drained {
        Ok(Err(error)) => return Err(error.into()),
        Ok(Ok(readings)) => {
            println!("Connection ended early after {} pushes", readings);
            return Ok(());
        }
        Err(_) => {}
    }

    write
        .send(command_message(ControlCommand::StopRecording)?)
        .await?;
    println!("Stopped recording");
    let _ = write.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { count } => watch(connect(&cli.server).await?, count).await,
        Commands::Record { seconds } => record(connect(&cli.server).await?, seconds).await?,
        Commands::Simulate {
            target,
            rate_hz,
            count,
        } => simulate(&target, rate_hz, count).await?,
    }

    Ok(())
}
