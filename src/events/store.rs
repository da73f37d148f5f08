//! Durable, append-only event storage keyed by correlation id.
//!
//! [`JsonlEventStore`] writes one JSON object per line, one file per
//! correlation id, and keeps the file handle open across appends until the
//! owner of the id calls [`EventStore::close`]. Reads always go back to disk
//! so a freshly started process sees the full history.
//!
//! Correlation ids are opaque: anything outside `[A-Za-z0-9_-]` is
//! percent-encoded into the file name, so `acme/app#42` is stored as
//! `acme%2Fapp%2342.jsonl` and can never leave the base directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::PipelineEvent;
use crate::error::EventLogError;

/// Storage backend for the event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends one event to the log of `event.request_id`.
    async fn append(&self, event: &PipelineEvent) -> Result<(), EventLogError>;

    /// Returns every persisted event for `correlation_id` in append order.
    async fn read(&self, correlation_id: &str) -> Result<Vec<PipelineEvent>, EventLogError>;

    /// Releases resources held for `correlation_id`. Later appends reopen them.
    async fn close(&self, _correlation_id: &str) {}
}

/// JSON-lines files under a base directory, `<base>/<correlation-id>.jsonl`.
pub struct JsonlEventStore {
    base_path: PathBuf,
    handles: Mutex<HashMap<String, File>>,
}

impl JsonlEventStore {
    /// Creates a store rooted at `base_path`. The directory is created lazily.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Base directory of the log files.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// File holding the events of `correlation_id`.
    pub fn log_path(&self, correlation_id: &str) -> Result<PathBuf, EventLogError> {
        let name = file_stem(correlation_id)?;
        Ok(self.base_path.join(format!("{}.jsonl", name)))
    }

    async fn ensure_directory(&self) -> Result<(), EventLogError> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|source| {
                EventLogError::DirectoryCreationFailed {
                    path: self.base_path.display().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Number of log files currently held open.
    pub async fn open_handles(&self) -> usize {
        self.handles.lock().await.len()
    }
}

/// Longest file stem most filesystems accept once `.jsonl` is appended.
const MAX_STEM_LEN: usize = 240;

/// Percent-encodes `id` into a file stem. The mapping is injective and the
/// result holds no separator or dot.
fn file_stem(id: &str) -> Result<String, EventLogError> {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    if stem.is_empty() || stem.len() > MAX_STEM_LEN {
        return Err(EventLogError::InvalidCorrelationId(id.to_string()));
    }
    Ok(stem)
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, event: &PipelineEvent) -> Result<(), EventLogError> {
        let path = self.log_path(&event.request_id)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut handles = self.handles.lock().await;
        if !handles.contains_key(&event.request_id) {
            self.ensure_directory().await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!(path = %path.display(), "Opened event log");
            handles.insert(event.request_id.clone(), file);
        }

        if let Some(file) = handles.get_mut(&event.request_id) {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(err) = written {
                // Drop the handle so the next append reopens the file.
                handles.remove(&event.request_id);
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn read(&self, correlation_id: &str) -> Result<Vec<PipelineEvent>, EventLogError> {
        let path = self.log_path(correlation_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path).await?;
        let mut events = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PipelineEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %err,
                    "Skipping unreadable event log line"
                ),
            }
        }
        Ok(events)
    }

    async fn close(&self, correlation_id: &str) {
        if self.handles.lock().await.remove(correlation_id).is_some() {
            debug!(correlation_id = %correlation_id, "Closed event log");
        }
    }
}

/// Process-local store, used in tests and for ephemeral runs.
#[derive(Default)]
pub struct MemoryEventStore {
    events: StdMutex<HashMap<String, Vec<PipelineEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &PipelineEvent) -> Result<(), EventLogError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| EventLogError::Io(std::io::Error::other("event store lock poisoned")))?;
        events
            .entry(event.request_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read(&self, correlation_id: &str) -> Result<Vec<PipelineEvent>, EventLogError> {
        let events = self
            .events
            .lock()
            .map_err(|_| EventLogError::Io(std::io::Error::other("event store lock poisoned")))?;
        Ok(events.get(correlation_id).cloned().unwrap_or_default())
    }
}
