//! Glove bridge library.
//!
//! Relays readings from a two-IMU glove, received over UDP, to browser
//! clients over WebSocket, and records them to CSV on client command.

pub mod bridge;
pub mod config;
pub mod error;
pub mod ingest;
pub mod reading;
pub mod session;
pub mod sink;
pub mod state;
