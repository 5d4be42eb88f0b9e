//! Asynchronous connection access log.
//!
//! Events are queued on a bounded channel and written by one sink task
//! as JSON lines, either to stdout or to a size-rotated file
//! (`path.1..n` suffixes, oldest dropped).

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::AccessLogConfig;
use crate::error::{LbError, Result};

const QUEUE_DEPTH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessEventKind {
    Opened,
    Closed,
}

/// One logged connection event, derived from conntrack observation.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEvent {
    pub timestamp_ns: u64,
    pub event: AccessEventKind,
    pub proxy: Option<String>,
    pub client: String,
    pub orig_dst: String,
    pub backend: String,
    pub protocol: u8,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
    pub packets_fwd: u64,
    pub packets_rev: u64,
}

/// Cheap cloneable handle; dropping every handle ends the sink task.
#[derive(Clone)]
pub struct AccessLog {
    tx: Option<mpsc::Sender<AccessEvent>>,
}

impl AccessLog {
    /// Disabled log: every event is dropped without queueing.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Build the handle and spawn the sink task.
    pub fn start(
        config: &AccessLogConfig,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let sink = match &config.path {
            Some(path) => Sink::File {
                path: PathBuf::from(path),
                max_bytes: config.max_size_mb.saturating_mul(1024 * 1024),
                max_files: config.max_files.max(1),
            },
            None => Sink::Stdout,
        };
        let cancel = cancel.clone();
        tracker.spawn(async move { run_sink(rx, sink, cancel).await });
        Self { tx: Some(tx) }
    }

    /// Queue an event. The caller never blocks; bursts beyond the queue
    /// depth are dropped.
    pub fn log(&self, event: AccessEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.try_send(event).is_err() {
            debug!("access log queue full, dropping event");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

enum Sink {
    Stdout,
    File { path: PathBuf, max_bytes: u64, max_files: usize },
}

async fn run_sink(mut rx: mpsc::Receiver<AccessEvent>, sink: Sink, cancel: CancellationToken) {
    let mut writer = match SinkWriter::open(sink).await {
        Ok(writer) => writer,
        Err(err) => {
            warn!(%err, "access log sink unavailable, events discarded");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush whatever is already queued before stopping.
                while let Ok(event) = rx.try_recv() {
                    if let Err(err) = writer.write(&event).await {
                        warn!(%err, "access log write failed");
                        return;
                    }
                }
                let _ = writer.flush().await;
                return;
            }
            event = rx.recv() => {
                let Some(event) = event else { return };
                if let Err(err) = writer.write(&event).await {
                    warn!(%err, "access log write failed");
                }
            }
        }
    }
}

enum SinkWriter {
    Stdout(tokio::io::Stdout),
    File {
        path: PathBuf,
        max_bytes: u64,
        max_files: usize,
        file: tokio::fs::File,
        written: u64,
    },
}

impl SinkWriter {
    async fn open(sink: Sink) -> Result<Self> {
        match sink {
            Sink::Stdout => Ok(SinkWriter::Stdout(tokio::io::stdout())),
            Sink::File { path, max_bytes, max_files } => {
                let file = open_append(&path).await?;
                let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
                Ok(SinkWriter::File { path, max_bytes, max_files, file, written })
            }
        }
    }

    async fn write(&mut self, event: &AccessEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| LbError::Internal(format!("access event encode failed: {e}")))?;
        line.push(b'\n');
        match self {
            SinkWriter::Stdout(out) => {
                out.write_all(&line).await?;
                Ok(())
            }
            SinkWriter::File { path, max_bytes, max_files, file, written } => {
                if *written + line.len() as u64 > *max_bytes && *written > 0 {
                    file.flush().await?;
                    rotate(path, *max_files)?;
                    *file = open_append(path).await?;
                    *written = 0;
                }
                file.write_all(&line).await?;
                *written += line.len() as u64;
                Ok(())
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            SinkWriter::Stdout(out) => out.flush().await?,
            SinkWriter::File { file, .. } => file.flush().await?,
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| LbError::OperationFailed(format!("open {} failed: {e}", path.display())))
}

/// Shift `path.(n-1)` -> `path.n`, dropping the oldest, then free the
/// base path for a fresh file.
fn rotate(path: &Path, max_files: usize) -> Result<()> {
    let suffixed = |n: usize| PathBuf::from(format!("{}.{n}", path.display()));
    let oldest = suffixed(max_files);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = suffixed(n);
        if from.exists() {
            std::fs::rename(&from, suffixed(n + 1))?;
        }
    }
    std::fs::rename(path, suffixed(1))?;
    Ok(())
}
