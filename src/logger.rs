//! Buffered JSON Lines event log.
//!
//! Entries are appended to a `.jsonl` file in batches. When created with
//! `final_format_json`, the file is rewritten as a pretty JSON array on
//! [`EventLogger::finalize_as_json`] or on drop.

use log::{error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsStr;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::ScopeError;

#[derive(Debug)]
pub struct EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
    finalized: bool,
}

impl<T> EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn add(&mut self, entry: T) -> Result<(), ScopeError> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append buffered entries as JSON lines.
    ///
    /// Transient write failures keep the entries buffered and are retried on
    /// the next flush; only repeated failures are returned as errors.
    pub fn flush(&mut self) -> Result<(), ScopeError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_lines() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn write_lines(&self) -> Result<(), ScopeError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| ScopeError::Io {
                source,
                context: format!("Could not open event log {:?}", self.file_path),
            })?;
        let mut writer = BufWriter::new(file);
        for entry in &self.buffer {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn record_failure(&mut self, e: ScopeError) -> Result<(), ScopeError> {
        self.flush_failures += 1;
        error!(
            "Event log flush failure {}/{}: {}",
            self.flush_failures, self.max_flush_failures, e
        );
        if self.flush_failures % 3 == 0 {
            warn!("Event log at {:?} keeps failing to flush", self.file_path);
        }
        if self.flush_failures >= self.max_flush_failures {
            return Err(ScopeError::Io {
                source: std::io::Error::other(e.to_string()),
                context: format!(
                    "Too many consecutive flush failures ({}) for {:?}",
                    self.max_flush_failures, self.file_path
                ),
            });
        }
        Ok(())
    }

    /// Rewrite the JSONL file as a JSON array
    pub fn finalize_as_json(&mut self) -> Result<(), ScopeError> {
        if !self.final_format_json || self.finalized {
            return Ok(());
        }
        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| ScopeError::Io {
            source,
            context: format!("Could not read event log {:?}", self.file_path),
        })?;
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<T>)
            .collect::<Result<Vec<_>, _>>()?;

        std::fs::write(&self.file_path, serde_json::to_string_pretty(&entries)?).map_err(|source| {
            ScopeError::Io {
                source,
                context: format!("Could not write event log {:?}", self.file_path),
            }
        })?;

        self.finalized = true;
        info!("Wrote {} events to {:?}", entries.len(), self.file_path);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for EventLogger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        index: u32,
        label: String,
    }

    fn entry(index: u32) -> Entry {
        Entry { index, label: format!("point {index}") }
    }

    #[test]
    fn test_flushes_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = EventLogger::new(dir.path().join("events"), 2, false);
        assert_eq!(logger.path().extension(), Some(OsStr::new("jsonl")));

        logger.add(entry(0)).unwrap();
        assert_eq!(logger.len(), 1);
        logger.add(entry(1)).unwrap();
        assert!(logger.is_empty());
        logger.add(entry(2)).unwrap();
        logger.flush().unwrap();

        let content = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<Entry> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![entry(0), entry(1), entry(2)]);
    }

    #[test]
    fn test_finalize_writes_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut logger = EventLogger::new(dir.path().join("run.log"), 10, true);
            logger.add(entry(7)).unwrap();
            logger.add(entry(8)).unwrap();
            logger.path().to_path_buf()
        };
        assert_eq!(path.extension(), Some(OsStr::new("json")));

        let parsed: Vec<Entry> = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, vec![entry(7), entry(8)]);
    }

    #[test]
    fn test_unwritable_path_is_tolerated_until_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger: EventLogger<Entry> =
            EventLogger::new(dir.path().join("missing").join("events"), 1, false);
        for i in 0..9 {
            assert!(logger.add(entry(i)).is_ok());
        }
        assert!(logger.add(entry(9)).is_err());
    }
}
