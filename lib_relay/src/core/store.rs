//! # JSON Stores
//!
//! Append-only JSON array files on local disk. Each store has exactly one
//! writer at a time; an append is read-modify-write through a temporary file
//! and a rename, so readers never observe a half-written array.
//!
//! The array is rewritten as raw JSON values: entries already in the file
//! keep their exact keys and values, whatever wrote them. Only readers that
//! want [`MessageRecord`]s interpret the entries, and they skip the ones that
//! are not records.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use super::record::MessageRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads and parses a JSON document. A missing or blank file yields `None`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    if text.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::json(path, e))
}

/// Pretty JSON with four-space indentation.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

/// # JSON Store
///
/// A JSON array of [`MessageRecord`] at a fixed path.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All persisted records, oldest first. A missing file is an empty store.
    ///
    /// Entries that do not parse as a [`MessageRecord`] are skipped.
    pub async fn load(&self) -> Result<Vec<MessageRecord>, StoreError> {
        let entries = self.load_entries().await?;
        let total = entries.len();

        let records: Vec<MessageRecord> = entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value(entry).ok())
            .collect();
        if records.len() < total {
            log::debug!(
                "Skipped {} non-record entries in {}",
                total - records.len(),
                self.path.display()
            );
        }
        Ok(records)
    }

    /// The raw array entries, oldest first.
    pub async fn load_entries(&self) -> Result<Vec<Value>, StoreError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    /// Appends `batch` and returns the new total entry count.
    ///
    /// Existing entries are written back untouched.
    pub async fn append(&self, batch: &[MessageRecord]) -> Result<usize, StoreError> {
        let _writer = self.writer.lock().await;

        let mut entries = self.load_entries().await?;
        if batch.is_empty() {
            return Ok(entries.len());
        }
        for record in batch {
            let entry =
                serde_json::to_value(record).map_err(|e| StoreError::json(&self.path, e))?;
            entries.push(entry);
        }

        let bytes = to_pretty_json(&entries).map_err(|e| StoreError::json(&self.path, e))?;
        self.replace_contents(&bytes).await?;
        Ok(entries.len())
    }

    /// Copies the current file to `dest` while holding the writer slot.
    ///
    /// Returns `false` when the store has not been written yet.
    pub async fn snapshot_to(&self, dest: &Path) -> Result<bool, StoreError> {
        let _writer = self.writer.lock().await;

        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?
        {
            return Ok(false);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::copy(&self.path, dest)
            .await
            .map_err(|e| StoreError::io(dest, e))?;
        Ok(true)
    }

    async fn replace_contents(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }
}
