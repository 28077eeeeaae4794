//! Write-only interface to the external history store.
//!
//! The manager archives every raw log line and a handful of typed rows. It
//! never reads them back, so the trait has no query side. Store failures are
//! logged by the implementation and never reach the log pipeline.

use crate::utils::get_timestamp;
use log::{debug, warn};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatKind {
    Public,
    Team,
    Tell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionKind {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Record {
    Log {
        line: String,
    },
    Chat {
        player: String,
        kind: ChatKind,
        message: String,
    },
    Frag {
        fragger: String,
        fragged: String,
        weapon: String,
    },
    Connection {
        player: String,
        player_id: String,
        ip: String,
        kind: ConnectionKind,
    },
    PlayerInfo {
        player: String,
        player_id: String,
        class_id: u32,
        class_name: String,
        model: String,
    },
}

/// One stored row: record plus instance name and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub added: u64,
    pub instance: String,
    #[serde(flatten)]
    pub record: Record,
}

pub trait EventStore: Send + Sync {
    fn insert(&self, row: Row);

    fn archive_line(&self, instance: &str, line: &str) {
        self.record(instance, Record::Log {
            line: line.trim().to_string(),
        });
    }

    fn record(&self, instance: &str, record: Record) {
        self.insert(Row {
            added: get_timestamp(),
            instance: instance.to_string(),
            record,
        });
    }
}

/// Keeps rows in memory. Used by tests and by instances without a store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<Row>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Row> {
        match self.rows.lock() {
            Ok(rows) => rows.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records without the archived raw lines
    pub fn records(&self) -> Vec<Record> {
        self.rows()
            .into_iter()
            .map(|row| row.record)
            .filter(|record| !matches!(record, Record::Log { .. }))
            .collect()
    }

    pub fn archived_lines(&self) -> Vec<String> {
        self.rows()
            .into_iter()
            .filter_map(|row| match row.record {
                Record::Log { line } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl EventStore for MemoryStore {
    fn insert(&self, row: Row) {
        match self.rows.lock() {
            Ok(mut rows) => rows.push(row),
            Err(poisoned) => poisoned.into_inner().push(row),
        }
    }
}

/// Appends rows as JSON lines to a file.
pub struct JsonLinesStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStore {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Recording history to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventStore for JsonLinesStore {
    fn insert(&self, row: Row) {
        let line = match serde_json::to_string(&row) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize history row: {}", e);
                return;
            }
        };

        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Failed to write history row to {}: {}", self.path.display(), e);
        }
    }
}
