//! Dead-letter queue writer.
//!
//! Records whose forwarding exhausted all retries (or hit an open circuit)
//! land here as one JSON entry per line in `dlq-{YYYY-MM-DD}.ndjson`,
//! rotated and permissioned exactly like the record store.

use crate::storage::day_store::{DayStore, StoreError};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One failed-forward entry, serialised as a single JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// RFC3339 UTC time the entry was written.
    pub timestamp: String,
    /// Correlation id of the originating connection or batch flush.
    pub conn_id: String,
    /// Why forwarding failed.
    pub error: String,
    /// The record body (or joined batch payload) as a string.
    pub data: String,
}

/// Append-only, day-rotated writer for [`DlqEntry`] lines.
///
/// Shared by reference from a listener into its forwarder; writes
/// serialise on the underlying store mutex.
pub struct DlqWriter {
    store: DayStore,
}

impl DlqWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Ok(DlqWriter {
            store: DayStore::new(dir, "dlq")?,
        })
    }

    /// Write one entry for a failed forward.
    pub fn write(&self, conn_id: &str, error: &str, data: &[u8]) -> Result<(), StoreError> {
        let entry = DlqEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            conn_id: conn_id.to_owned(),
            error: error.to_owned(),
            data: String::from_utf8_lossy(data).into_owned(),
        };
        // DlqEntry has no non-string fields; serialisation cannot fail.
        let line = serde_json::to_vec(&entry).map_err(|e| {
            StoreError::Write {
                path: self.store.base_dir().to_path_buf(),
                source: std::io::Error::other(e),
            }
        })?;
        self.store.append(&line)
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.store.close()
    }

    /// Path of the currently open DLQ file, if any.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.store.current_file()
    }

    pub fn file_for_day(&self, day: &str) -> PathBuf {
        self.store.file_for_day(day)
    }
}
