//! Durable recording sinks.
//!
//! A sink receives every accepted reading while a recording is active. The
//! bridge only knows the [`RecordSink`] trait; [`CsvFileSink`] is the concrete
//! sink used by the binary.

use crate::error::{BridgeError, Result};
use crate::reading::{DELIMITER, RECORD_HEADER, Reading};
use chrono::{DateTime, Utc};
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Format a capture time as Unix seconds with microsecond precision.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

/// An open recording destination with its header already written.
pub trait RecordSink: Send {
    /// Append one reading with its capture time.
    fn append(&mut self, reading: &Reading, captured_at: &DateTime<Utc>) -> Result<()>;

    /// Flush and release the destination.
    fn close(self: Box<Self>) -> Result<()>;

    /// Human-readable name of the destination, for logs and summaries.
    fn describe(&self) -> String;
}

/// Opens a fresh sink for each recording.
pub trait SinkFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn RecordSink>>;
}

impl<F> SinkFactory for F
where
    F: Fn() -> Result<Box<dyn RecordSink>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn RecordSink>> {
        self()
    }
}

/// CSV file sink. The file is truncated on open.
pub struct CsvFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvFileSink {
    /// Create (or truncate) the file and write the header row.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open = || -> std::io::Result<BufWriter<File>> {
            let mut writer = BufWriter::new(File::create(&path)?);
            writeln!(writer, "{}", RECORD_HEADER.join(","))?;
            writer.flush()?;
            Ok(writer)
        };
        let writer = open().map_err(|source| BridgeError::SinkOpen {
            path: path.clone(),
            source,
        })?;

        info!("[REC] Opened {}", path.display());
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for CsvFileSink {
    fn append(&mut self, reading: &Reading, captured_at: &DateTime<Utc>) -> Result<()> {
        writeln!(
            self.writer,
            "{}{}{}",
            reading.raw(),
            DELIMITER,
            format_timestamp(captured_at)
        )
        .map_err(BridgeError::SinkWrite)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| BridgeError::SinkClose(e.into_error()))?;
        file.sync_all().map_err(BridgeError::SinkClose)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Opens a [`CsvFileSink`] at a fixed path.
#[derive(Debug, Clone)]
pub struct CsvFileSinkFactory {
    path: PathBuf,
}

impl CsvFileSinkFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SinkFactory for CsvFileSinkFactory {
    fn open(&self) -> Result<Box<dyn RecordSink>> {
        Ok(Box::new(CsvFileSink::create(&self.path)?))
    }
}
