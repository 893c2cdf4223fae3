use std::{env, path::PathBuf};

use anyhow::{Context, Result};
use data_model::Container;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub mod driver;
pub mod record;

use driver::{
    file::FileJournal,
    rocksdb::RocksDbJournal,
    JournalEntry,
    JournalMedium,
};
use metrics::Timer;
use record::ContainerStateRecord;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JournalError {
    #[error("record truncated at field {field}, {needed} more bytes needed")]
    Truncated { field: &'static str, needed: usize },

    #[error("unknown container state ordinal {0}")]
    UnknownState(i32),

    #[error("invalid container id {0}")]
    InvalidContainerId(i32),

    #[error("invalid buffer server port {0}")]
    InvalidPort(i32),

    #[error("invalid presence marker {marker:#04x} for field {field}")]
    InvalidMarker { marker: u8, field: &'static str },

    #[error("field {field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{0} unexpected bytes after the last field")]
    TrailingBytes(usize),

    #[error("frame length {expected} does not match body length {found}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("checksum mismatch, expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("frame starts with {0:#010x} instead of the journal magic")]
    BadMagic(u32),

    #[error("frame header checksum mismatch, expected {expected:#010x}, found {found:#010x}")]
    HeaderChecksumMismatch { expected: u32, found: u32 },

    #[error("journal key of {0} bytes is not a sequence number")]
    InvalidKey(usize),

    #[error("column family {0} is missing")]
    MissingColumnFamily(&'static str),

    #[error("journal lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    RocksDb(#[from] rocksdb::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JournalBackend {
    #[default]
    File,
    RocksDb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub backend: JournalBackend,
    pub path: PathBuf,
    pub sync_on_append: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        let path = env::current_dir()
            .unwrap_or_default()
            .join("streamgrid_storage/journal");
        JournalConfig {
            backend: JournalBackend::File,
            path,
            sync_on_append: true,
        }
    }
}

/// Outcome of one recovery pass over the journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub applied: usize,
    pub unmatched: usize,
    pub corrupt: usize,
    pub torn_tail: usize,
}

impl ReplaySummary {
    pub fn skipped(&self) -> usize {
        self.unmatched + self.corrupt + self.torn_tail
    }
}

/// Recoverable log of container state transitions.
pub struct ContainerJournal {
    medium: Box<dyn JournalMedium>,
    metrics: metrics::journal::Metrics,
}

impl ContainerJournal {
    pub fn new(medium: Box<dyn JournalMedium>) -> Self {
        Self {
            medium,
            metrics: metrics::journal::Metrics::new(),
        }
    }

    pub fn open(config: &JournalConfig) -> Result<Self> {
        let medium: Box<dyn JournalMedium> = match config.backend {
            JournalBackend::File => Box::new(
                FileJournal::open(&config.path, config.sync_on_append)
                    .with_context(|| format!("opening journal file in {:?}", config.path))?,
            ),
            JournalBackend::RocksDb => Box::new(
                RocksDbJournal::open(&config.path, config.sync_on_append)
                    .with_context(|| format!("opening rocksdb journal at {:?}", config.path))?,
            ),
        };
        info!(medium = medium.name(), "container journal ready");
        Ok(Self::new(medium))
    }

    pub fn medium_name(&self) -> &'static str {
        self.medium.name()
    }

    /// Appends a snapshot of `container`. A failure here means the journal
    /// medium is unusable and must be surfaced to the operator.
    pub fn write(&self, container: &Container) -> Result<()> {
        self.write_record(&ContainerStateRecord::from(container))
    }

    pub fn write_record(&self, record: &ContainerStateRecord) -> Result<()> {
        let labels = [KeyValue::new("medium", self.medium.name())];
        let _timer = Timer::start_with_labels(&self.metrics.writes, &labels);
        self.medium
            .append(&record.encode())
            .with_context(|| format!("appending journal record for container {}", record.container_id))?;
        self.metrics.records_written.add(1, &labels);
        debug!(
            container_id = record.container_id.get(),
            state = %record.state,
            "journaled container state"
        );
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        self.medium.entries().context("reading journal entries")
    }

    /// Replays every readable record in append order.
    ///
    /// `apply` locates the container with the record's id and restores it,
    /// returning false when no such container exists. Unmatched, corrupt and
    /// torn entries are reported and skipped; only a failure to read the medium
    /// itself is returned as an error.
    pub fn replay<F>(&self, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(&ContainerStateRecord) -> bool,
    {
        let mut summary = ReplaySummary::default();
        for entry in self.entries()? {
            match entry {
                JournalEntry::Record { position, body } => {
                    match ContainerStateRecord::decode(&body) {
                        Ok(record) => {
                            if apply(&record) {
                                summary.applied += 1;
                            } else {
                                debug!(
                                    position,
                                    container_id = record.container_id.get(),
                                    "skipping journal record for unknown container"
                                );
                                summary.unmatched += 1;
                            }
                        }
                        Err(err) => {
                            error!(position, "skipping undecodable journal record: {}", err);
                            summary.corrupt += 1;
                        }
                    }
                }
                JournalEntry::Corrupt { position, error } => {
                    error!(position, "skipping corrupt journal record: {}", error);
                    summary.corrupt += 1;
                }
                JournalEntry::TornTail { position, len } => {
                    warn!(position, len, "discarding incomplete trailing journal record");
                    summary.torn_tail += 1;
                }
            }
        }

        let labels = [KeyValue::new("medium", self.medium.name())];
        self.metrics
            .records_replayed
            .add(summary.applied as u64, &labels);
        self.metrics
            .records_skipped
            .add(summary.skipped() as u64, &labels);
        info!(
            applied = summary.applied,
            unmatched = summary.unmatched,
            corrupt = summary.corrupt,
            torn_tail = summary.torn_tail,
            "replayed container journal"
        );
        Ok(summary)
    }
}
