//! Shared bridge state.
//!
//! The single piece of mutable state touched by both the UDP ingest task and
//! every WebSocket session: the most recent reading and the active recording.
//! All access goes through one mutex. Recording is represented by the presence
//! of an open sink, so the flag and the sink cannot disagree.

use crate::error::Result;
use crate::reading::Reading;
use crate::sink::{RecordSink, SinkFactory};
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;

/// Outcome of a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub destination: String,
    pub rows: u64,
}

/// Outcome of a successful start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStarted {
    pub destination: String,
    /// The recording that was closed to make room for this one, if any.
    pub replaced: Option<RecordingSummary>,
}

/// Counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub accepted: u64,
    pub rejected: u64,
    pub recorded: u64,
}

struct ActiveRecording {
    sink: Box<dyn RecordSink>,
    rows: u64,
    last_captured: Option<DateTime<Utc>>,
}

impl ActiveRecording {
    fn close(self) -> Result<RecordingSummary> {
        let summary = RecordingSummary {
            destination: self.sink.describe(),
            rows: self.rows,
        };
        self.sink.close()?;
        Ok(summary)
    }
}

#[derive(Default)]
struct Inner {
    latest: Option<Reading>,
    recording: Option<ActiveRecording>,
    stats: BridgeStats,
}

/// Thread-safe state shared between the ingest listener and client sessions.
#[derive(Default)]
pub struct BridgeState {
    inner: Mutex<Inner>,
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest reading. Intermediate readings are never queued.
    pub fn set_latest(&self, reading: Reading) {
        let mut inner = self.inner.lock();
        inner.latest = Some(reading);
        inner.stats.accepted += 1;
    }

    /// The most recent accepted reading, if any has arrived.
    pub fn get_latest(&self) -> Option<Reading> {
        self.inner.lock().latest.clone()
    }

    /// Count a datagram that was not accepted as a reading.
    pub fn note_rejected(&self) {
        self.inner.lock().stats.rejected += 1;
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().recording.is_some()
    }

    pub fn stats(&self) -> BridgeStats {
        self.inner.lock().stats
    }

    /// Open a fresh sink and start recording.
    ///
    /// An already open sink is closed first, then the new one is opened, all
    /// under the lock. If either step fails, recording is left off and the
    /// error is returned.
    pub fn start_recording(&self, factory: &dyn SinkFactory) -> Result<RecordingStarted> {
        let mut inner = self.inner.lock();

        let replaced = match inner.recording.take() {
            Some(previous) => Some(previous.close()?),
            None => None,
        };

        let sink = factory.open()?;
        let destination = sink.describe();
        inner.recording = Some(ActiveRecording {
            sink,
            rows: 0,
            last_captured: None,
        });

        match &replaced {
            Some(previous) => info!(
                "[REC] Recording restarted -> {} (previous take had {} row(s))",
                destination, previous.rows
            ),
            None => info!("[REC] Recording started -> {}", destination),
        }
        Ok(RecordingStarted {
            destination,
            replaced,
        })
    }

    /// Stop recording and close the sink. A no-op returning `None` when
    /// nothing is being recorded.
    pub fn stop_recording(&self) -> Result<Option<RecordingSummary>> {
        // Closed under the lock so a concurrent start cannot truncate the
        // file before the old sink has flushed.
        let mut inner = self.inner.lock();
        let Some(active) = inner.recording.take() else {
            return Ok(None);
        };

        let summary = active.close()?;
        drop(inner);
        info!(
            "[REC] Recording stopped, {} row(s) written to {}",
            summary.rows, summary.destination
        );
        Ok(Some(summary))
    }

    /// Append the reading to the open sink, if recording.
    ///
    /// Returns whether a row was written. The capture time is taken under the
    /// lock and never goes backwards within one recording.
    pub fn record_if_active(&self, reading: &Reading) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Inner {
            recording, stats, ..
        } = &mut *inner;
        let Some(active) = recording.as_mut() else {
            return Ok(false);
        };

        let now = Utc::now();
        let captured_at = match active.last_captured {
            Some(last) if last > now => last,
            _ => now,
        };
        active.sink.append(reading, &captured_at)?;
        active.last_captured = Some(captured_at);
        active.rows += 1;
        stats.recorded += 1;
        Ok(true)
    }
}
