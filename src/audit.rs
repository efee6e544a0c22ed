//! Structured audit trail: one line-oriented JSON record per terminal
//! pipeline decision, written asynchronously with bounded backpressure.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain_types::{ClientId, SchemaId, TopicName};
use crate::quarantine::QuarantineReason;

/// The terminal outcome an audit record reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The message was forwarded to the upstream broker.
    Forwarded,
    /// The message was quarantined.
    Quarantined,
    /// The message was dropped due to an internal error.
    Dropped,
}

/// One structured audit record, serialized as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// When the decision was made.
    pub ts: DateTime<Utc>,
    /// The terminal decision.
    pub decision: Decision,
    /// The message's topic.
    pub topic: TopicName,
    /// The originating client id.
    pub client_id: ClientId,
    /// The schema consulted, if any.
    pub schema_id: Option<SchemaId>,
    /// The quarantine reason, if the decision was `Quarantined`.
    pub reason: Option<QuarantineReason>,
    /// Additional diagnostic detail.
    pub detail: Option<String>,
    /// Total processing duration for the message, in microseconds.
    pub duration_us: u64,
}

/// File rotation policy for the `File` destination.
#[derive(Debug, Clone)]
pub enum Rotation {
    /// Roll over once per hour (via `tracing-appender`).
    Hourly,
    /// Roll over once per day (via `tracing-appender`).
    Daily,
    /// Never roll over automatically.
    Never,
    /// Roll over once the current file exceeds this many bytes.
    SizeBytes(u64),
}

/// Where audit records are written.
pub enum AuditDestination {
    /// A rotated file under `directory` with the given `file_name_prefix`.
    File {
        /// Directory holding the active and rotated files.
        directory: PathBuf,
        /// Prefix for file names, e.g. `audit.log`.
        file_name_prefix: String,
        /// Rotation policy.
        rotation: Rotation,
    },
    /// Standard output.
    Stdout,
    /// A syslog daemon reached over UDP, RFC 3164 framing.
    Syslog {
        /// `host:port` of the syslog listener.
        address: String,
    },
}

enum Writer {
    Rolling(tracing_appender::rolling::RollingFileAppender),
    SizeRolling {
        directory: PathBuf,
        file_name_prefix: String,
        max_bytes: u64,
        current: std::fs::File,
        current_size: u64,
    },
    Stdout,
    Syslog(std::net::UdpSocket, std::net::SocketAddr),
}

impl Writer {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Writer::Rolling(appender) => {
                writeln!(appender, "{line}")
            }
            Writer::SizeRolling {
                directory,
                file_name_prefix,
                max_bytes,
                current,
                current_size,
            } => {
                if *current_size >= *max_bytes {
                    let rotated = directory.join(format!(
                        "{file_name_prefix}.{}",
                        Utc::now().format("%Y%m%dT%H%M%S")
                    ));
                    let active = directory.join(file_name_prefix.clone());
                    std::fs::rename(&active, rotated)?;
                    *current = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&active)?;
                    *current_size = 0;
                }
                writeln!(current, "{line}")?;
                *current_size += line.len() as u64 + 1;
                Ok(())
            }
            Writer::Stdout => {
                let mut stdout = std::io::stdout();
                writeln!(stdout, "{line}")
            }
            Writer::Syslog(socket, addr) => {
                let framed = format!("<14>{line}");
                socket.send_to(framed.as_bytes(), *addr).map(|_| ())
            }
        }
    }
}

/// Counters describing the audit sink's own health.
#[derive(Debug, Default)]
pub struct AuditSinkMetrics {
    /// Records dropped because the bounded buffer was full.
    pub dropped: AtomicU64,
}

/// Asynchronous, bounded-buffer audit record writer.
pub struct AuditSink {
    sender: mpsc::Sender<AuditRecord>,
    metrics: Arc<AuditSinkMetrics>,
}

impl AuditSink {
    /// Spawns the writer task for `destination`, buffering up to
    /// `buffer_capacity` records; on overflow the oldest unwritten record is
    /// dropped (by rejecting the newest write) and a counter incremented.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot be opened (e.g. the audit
    /// log directory doesn't exist and can't be created, or the syslog
    /// address can't be resolved).
    pub fn spawn(
        destination: AuditDestination,
        buffer_capacity: usize,
    ) -> std::io::Result<Self> {
        let mut writer = match destination {
            AuditDestination::File {
                directory,
                file_name_prefix,
                rotation,
            } => {
                std::fs::create_dir_all(&directory)?;
                match rotation {
                    Rotation::Hourly => Writer::Rolling(tracing_appender::rolling::hourly(
                        &directory,
                        &file_name_prefix,
                    )),
                    Rotation::Daily => Writer::Rolling(tracing_appender::rolling::daily(
                        &directory,
                        &file_name_prefix,
                    )),
                    Rotation::Never => Writer::Rolling(tracing_appender::rolling::never(
                        &directory,
                        &file_name_prefix,
                    )),
                    Rotation::SizeBytes(max_bytes) => {
                        let active = directory.join(&file_name_prefix);
                        let current = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&active)?;
                        let current_size = current.metadata()?.len();
                        Writer::SizeRolling {
                            directory,
                            file_name_prefix,
                            max_bytes,
                            current,
                            current_size,
                        }
                    }
                }
            }
            AuditDestination::Stdout => Writer::Stdout,
            AuditDestination::Syslog { address } => {
                let addr: std::net::SocketAddr = address
                    .parse()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
                Writer::Syslog(socket, addr)
            }
        };

        let (sender, mut receiver) = mpsc::channel::<AuditRecord>(buffer_capacity);
        let metrics = Arc::new(AuditSinkMetrics::default());

        tokio::task::spawn_blocking(move || {
            while let Some(record) = receiver.blocking_recv() {
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        if let Err(e) = writer.write_line(&line) {
                            warn!(error = %e, "failed to write audit record");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize audit record"),
                }
            }
        });

        Ok(Self { sender, metrics })
    }

    /// Enqueues `record` for writing. If the buffer is full the record is
    /// dropped immediately (never blocks the caller) and the drop counter
    /// is incremented.
    pub fn emit(&self, record: AuditRecord) {
        if self.sender.try_send(record).is_err() {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The number of records dropped due to buffer overflow so far.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.metrics.dropped.load(Ordering::Relaxed)
    }
}
