//! Append-only, day-rotated record store.
//!
//! One file per UTC day, named `{prefix}-{YYYY-MM-DD}.ndjson`, opened with
//! O_CREATE|O_APPEND|O_WRONLY mode 0600 inside a 0750 directory. Rotation
//! is checked on every append rather than by a background timer, so a
//! rotation is always a consequence of traffic and a silent day has no
//! open handle.
//!
//! # Concurrency
//! `append` and `close` serialise on an internal mutex; at most one file
//! handle is open at any time.

use chrono::Utc;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o750;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("creating directory '{dir}': {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("opening '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("closing store file: {0}")]
    Close(#[source] std::io::Error),
}

struct OpenFile {
    day: String,
    path: PathBuf,
    file: File,
}

/// Day-rotated append-only NDJSON writer.
pub struct DayStore {
    base_dir: PathBuf,
    file_prefix: String,
    current: Mutex<Option<OpenFile>>,
}

impl DayStore {
    /// Create the store, creating `base_dir` (mode 0750) if absent.
    ///
    /// No file is opened until the first append.
    pub fn new(base_dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        if !base_dir.is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(&base_dir)
                .map_err(|e| StoreError::CreateDir {
                    dir: base_dir.clone(),
                    source: e,
                })?;
        }
        Ok(DayStore {
            base_dir,
            file_prefix: file_prefix.into(),
            current: Mutex::new(None),
        })
    }

    /// Append one record, rotating to today's file first if the UTC date
    /// changed since the last append.
    ///
    /// The record is written as `record || '\n'` in a single write call.
    pub fn append(&self, record: &[u8]) -> Result<(), StoreError> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        self.append_for_day(&day, record)
    }

    /// Close any open handle. Subsequent appends reopen.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut current = self.lock();
        if let Some(open) = current.take() {
            open.file.sync_all().map_err(StoreError::Close)?;
        }
        Ok(())
    }

    /// Path of the currently open file, if any.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|open| open.path.clone())
    }

    /// Path a given day's file would have.
    pub fn file_for_day(&self, day: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}-{}.ndjson", self.file_prefix, day))
    }

    fn append_for_day(&self, day: &str, record: &[u8]) -> Result<(), StoreError> {
        let mut current = self.lock();

        let needs_rotate = match current.as_ref() {
            Some(open) => open.day != day,
            None => true,
        };
        if needs_rotate {
            let path = self.file_for_day(day);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(FILE_MODE)
                .open(&path)
                .map_err(|e| StoreError::Open {
                    path: path.clone(),
                    source: e,
                })?;
            // The previous handle (if any) is replaced only after the new
            // one opened; its close error is ignored at that point.
            *current = Some(OpenFile {
                day: day.to_owned(),
                path,
                file,
            });
        }

        let open = current.as_mut().ok_or_else(|| StoreError::Close(
            std::io::Error::other("store handle missing after rotation"),
        ))?;

        let mut buf = Vec::with_capacity(record.len() + 1);
        buf.extend_from_slice(record);
        buf.push(b'\n');
        open.file.write_all(&buf).map_err(|e| StoreError::Write {
            path: open.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<OpenFile>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn append_creates_todays_file_with_record_and_newline() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path().join("out"), "zpa-user-activity").unwrap();
        store.append(b"{\"SessionID\":\"A\"}").unwrap();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let path = store.file_for_day(&day);
        assert_eq!(store.current_file(), Some(path.clone()));
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"{\"SessionID\":\"A\"}\n");
    }

    #[test]
    fn appends_accumulate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path(), "p").unwrap();
        for rec in [&b"one"[..], b"two", b"three"] {
            store.append(rec).unwrap();
        }
        let contents = std::fs::read(store.current_file().unwrap()).unwrap();
        assert_eq!(contents, b"one\ntwo\nthree\n");
    }

    #[test]
    fn file_and_dir_modes_are_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("store");
        let store = DayStore::new(&out, "p").unwrap();
        store.append(b"x").unwrap();

        let dir_mode = std::fs::metadata(&out).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o750);
        let file_mode = std::fs::metadata(store.current_file().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn date_change_rotates_to_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path(), "p").unwrap();
        store.append_for_day("2026-07-31", b"old-day").unwrap();
        let first = store.current_file().unwrap();
        store.append_for_day("2026-08-01", b"new-day").unwrap();
        let second = store.current_file().unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"old-day\n");
        assert_eq!(std::fs::read(&second).unwrap(), b"new-day\n");
    }

    #[test]
    fn same_day_does_not_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path(), "p").unwrap();
        store.append_for_day("2026-08-01", b"a").unwrap();
        let first = store.current_file().unwrap();
        store.append_for_day("2026-08-01", b"b").unwrap();
        assert_eq!(store.current_file().unwrap(), first);
        assert_eq!(std::fs::read(&first).unwrap(), b"a\nb\n");
    }

    #[test]
    fn close_then_append_reopens_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path(), "p").unwrap();
        store.append(b"before").unwrap();
        store.close().unwrap();
        assert_eq!(store.current_file(), None);
        store.append(b"after").unwrap();
        let contents = std::fs::read(store.current_file().unwrap()).unwrap();
        assert_eq!(contents, b"before\nafter\n");
    }

    #[test]
    fn close_without_open_handle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = DayStore::new(dir.path(), "p").unwrap();
        store.close().unwrap();
    }

    #[test]
    fn nested_output_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = DayStore::new(&nested, "p").unwrap();
        store.append(b"x").unwrap();
        assert!(nested.is_dir());
    }
}
