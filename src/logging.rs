//! JSON access log
//!
//! Event records (subscriber connect/disconnect, upstream lifecycle) are
//! serialized to JSON, one line per record, prefixed with an RFC3339
//! timestamp:
//!
//! ```text
//! [2006-01-02T15:04:05+07:00] {"module":"subscriber","event":"connect",...}
//! ```
//!
//! The file sink hands records to a worker task over a bounded queue; when
//! the queue is full the record is dropped and counted rather than stalling
//! the serving path. SIGUSR1 makes the worker close and reopen its file,
//! which is all an external log rotator needs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Unwritten records the file sink will hold before dropping
const LOG_QUEUE_LENGTH: usize = 100;

/// Sink for JSON-serializable event records
pub trait AccessLog: Send + Sync {
    /// Queue one record. Never blocks the caller.
    fn log(&self, record: Value);
}

/// Sink that discards every record; a placeholder for tests
#[derive(Debug, Default)]
pub struct NullLog;

impl AccessLog for NullLog {
    fn log(&self, _record: Value) {}
}

/// Sink that prints records to stdout.
///
/// The right choice when the process runs under a supervisor that captures
/// standard streams.
#[derive(Debug, Default)]
pub struct ConsoleLog;

impl AccessLog for ConsoleLog {
    fn log(&self, record: Value) {
        println!("{}", format_line(&record));
    }
}

/// Sink that appends records to a file via a background worker
pub struct FileLog {
    queue: mpsc::Sender<Value>,
    dropped: AtomicU64,
}

impl FileLog {
    /// Open (or create) the log file and start the writer task.
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = open_log(&path).await?;
        let (queue, records) = mpsc::channel(LOG_QUEUE_LENGTH);

        tokio::spawn(write_loop(path, file, records));

        Ok(Self {
            queue,
            dropped: AtomicU64::new(0),
        })
    }

    /// Records discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AccessLog for FileLog {
    fn log(&self, record: Value) {
        if self.queue.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("access log queue full, record dropped");
        }
    }
}

fn format_line(record: &Value) -> String {
    format!(
        "[{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        record
    )
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn write_loop(path: PathBuf, mut file: File, mut records: mpsc::Receiver<Value>) {
    let mut reopen = reopen_signal();

    loop {
        tokio::select! {
            record = records.recv() => match record {
                Some(record) => {
                    let line = format_line(&record) + "\n";
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(error = %err, "access log write failed");
                    } else if let Err(err) = file.flush().await {
                        tracing::warn!(error = %err, "access log flush failed");
                    }
                }
                None => break,
            },
            _ = wait_reopen(&mut reopen) => {
                tracing::info!(path = %path.display(), "reopening access log");
                match open_log(&path).await {
                    Ok(reopened) => file = reopened,
                    Err(err) => {
                        tracing::error!(error = %err, "could not reopen access log");
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn reopen_signal() -> Option<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()).ok()
}

#[cfg(unix)]
async fn wait_reopen(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            signal.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
fn reopen_signal() -> Option<()> {
    None
}

#[cfg(not(unix))]
async fn wait_reopen(_signal: &mut Option<()>) {
    std::future::pending::<()>().await
}
