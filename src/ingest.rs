//! UDP ingest listener.
//!
//! Owns the socket the glove sends to. Every datagram holding exactly twelve
//! fields becomes the latest reading and, while a recording is active, a row
//! in the record file. The loop survives every per-packet and transport error
//! and only exits on shutdown.

use crate::config::IngestConfig;
use crate::error::{BridgeError, Result};
use crate::reading::{Reading, ReadingError};
use crate::state::BridgeState;
use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a receive error so a persistent failure cannot spin the loop.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Create the ingest socket with SO_REUSEADDR set.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let setup = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    setup().map_err(|source| BridgeError::Bind {
        what: "UDP",
        addr,
        source,
    })
}

/// What happened to one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Accepted as the latest reading; `recorded` says whether a row was written.
    Accepted { recorded: bool },
    /// Discarded without touching state.
    Discarded(ReadingError),
}

/// Apply one datagram payload to the shared state.
///
/// Malformed payloads are counted and dropped. A failing sink write is logged
/// and does not affect the latest reading.
pub fn ingest_datagram(state: &BridgeState, payload: &[u8]) -> IngestOutcome {
    let reading = match Reading::from_datagram(payload) {
        Ok(reading) => reading,
        Err(e) => {
            state.note_rejected();
            return IngestOutcome::Discarded(e);
        }
    };

    state.set_latest(reading.clone());
    let recorded = match state.record_if_active(&reading) {
        Ok(recorded) => recorded,
        Err(e) => {
            warn!("[REC] {}", e);
            false
        }
    };
    IngestOutcome::Accepted { recorded }
}

pub struct IngestListener {
    socket: UdpSocket,
    state: Arc<BridgeState>,
    max_datagram_len: usize,
}

impl IngestListener {
    /// Bind the ingest socket. Must be called inside a Tokio runtime.
    pub fn bind(config: &IngestConfig, state: Arc<BridgeState>) -> Result<Self> {
        let socket = bind_udp(config.socket_addr())?;
        info!("[UDP] Listening for glove on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            state,
            max_datagram_len: config.max_datagram_len,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut buf = vec![0u8; self.max_datagram_len];
        let mut first_packet = true;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    warn!("[UDP] Receive error: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            if first_packet {
                info!("[UDP] First packet received from glove at {}", from.ip());
                first_packet = false;
            }

            let payload = &buf[..len];
            trace!(
                "[UDP RX] {} bytes from {}: {:?}",
                len,
                from,
                String::from_utf8_lossy(payload)
            );

            if let IngestOutcome::Discarded(reason) = ingest_datagram(&self.state, payload) {
                debug!("[UDP] Discarded datagram from {}: {}", from, reason);
            }
        }

        info!("[UDP] Ingest listener stopped");
    }
}
