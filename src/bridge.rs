//! Bridge orchestrator.
//!
//! Binds both sockets, spawns the ingest loop and the client accept loop, and
//! tears everything down on shutdown, closing any recording still open.

use crate::config::Config;
use crate::error::Result;
use crate::ingest::IngestListener;
use crate::session::ClientServer;
use crate::sink::{CsvFileSinkFactory, SinkFactory};
use crate::state::BridgeState;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A bridge whose sockets are bound and whose tasks are running.
pub struct RunningBridge {
    state: Arc<BridgeState>,
    udp_addr: SocketAddr,
    ws_addr: SocketAddr,
    shutdown: CancellationToken,
    ingest_task: JoinHandle<()>,
    client_task: JoinHandle<()>,
}

/// Start the bridge with the CSV file sink from `config`.
pub async fn start(config: &Config) -> Result<RunningBridge> {
    let sinks = Arc::new(CsvFileSinkFactory::new(&config.recording.path));
    start_with_sinks(config, sinks).await
}

/// Start the bridge recording through `sinks`.
///
/// Both sockets are bound before any task is spawned, so a bind failure
/// leaves nothing running.
pub async fn start_with_sinks(
    config: &Config,
    sinks: Arc<dyn SinkFactory>,
) -> Result<RunningBridge> {
    let state = Arc::new(BridgeState::new());

    let ingest = IngestListener::bind(&config.ingest, state.clone())?;
    let clients = ClientServer::bind(&config.clients, state.clone(), sinks).await?;
    let udp_addr = ingest.local_addr()?;
    let ws_addr = clients.local_addr()?;

    let shutdown = CancellationToken::new();
    let ingest_task = ingest.start(shutdown.clone());
    let client_task = clients.start(shutdown.clone());

    info!(
        "Bridge started: glove -> udp://{} -> ws://{}",
        udp_addr, ws_addr
    );

    Ok(RunningBridge {
        state,
        udp_addr,
        ws_addr,
        shutdown,
        ingest_task,
        client_task,
    })
}

impl RunningBridge {
    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Address the ingest socket is bound to.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Address the WebSocket server is bound to.
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Stop both loops, wait for every session to end, then close any open
    /// recording.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down bridge");
        self.shutdown.cancel();

        if let Err(e) = self.ingest_task.await {
            warn!("Ingest task ended abnormally: {}", e);
        }
        if let Err(e) = self.client_task.await {
            warn!("Client server task ended abnormally: {}", e);
        }

        self.state.stop_recording()?;

        let stats = self.state.stats();
        info!(
            "Bridge stopped: {} reading(s) accepted, {} rejected, {} recorded",
            stats.accepted, stats.rejected, stats.recorded
        );
        Ok(())
    }
}
