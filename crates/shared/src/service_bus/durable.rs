//! Durable fallback queue for CRITICAL messages
//!
//! A CRITICAL message is written to the store before each retry wait and
//! removed once it is delivered. On startup the bus loads every stored
//! message and re-attempts it before accepting new traffic.
//!
//! ## Key Features
//!
//! - **File Queue**: one JSON file per message, written to a temporary file
//!   and renamed into place so a crash never leaves a half-written entry
//! - **Memory Queue**: same contract without I/O, shareable between bus
//!   instances in one process
//! - **Ordered Recovery**: `load_all` returns messages by `created_at`
//!
//! Persistence is best effort. A failed write is reported as
//! `DurablePersistenceFailure` and the delivery continues in memory.

use super::errors::{BusError, BusResult};
use super::types::Message;
use crate::error::{MeridianError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Trait for durable message stores
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Writes or overwrites the entry for `message.id`
    async fn persist(&self, message: &Message) -> BusResult<()>;

    /// Removes the entry for `message_id`; removing a missing entry succeeds
    async fn remove(&self, message_id: &str) -> BusResult<()>;

    /// Loads every stored message ordered by creation time
    async fn load_all(&self) -> BusResult<Vec<Message>>;

    /// Number of stored messages
    async fn len(&self) -> BusResult<usize>;

    /// Name of this store implementation
    fn name(&self) -> &'static str;
}

fn sort_for_recovery(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// In-memory durable store
///
/// Survives bus restarts within one process when the same instance (or a
/// clone) is handed to the new bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurableQueue {
    entries: Arc<RwLock<HashMap<String, Message>>>,
}

impl MemoryDurableQueue {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether an entry exists for `message_id`
    pub async fn contains(&self, message_id: &str) -> bool {
        self.entries.read().await.contains_key(message_id)
    }
}

#[async_trait]
impl DurableStore for MemoryDurableQueue {
    async fn persist(&self, message: &Message) -> BusResult<()> {
        self.entries
            .write()
            .await
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn remove(&self, message_id: &str) -> BusResult<()> {
        self.entries.write().await.remove(message_id);
        Ok(())
    }

    async fn load_all(&self) -> BusResult<Vec<Message>> {
        let mut messages: Vec<Message> = self.entries.read().await.values().cloned().collect();
        sort_for_recovery(&mut messages);
        Ok(messages)
    }

    async fn len(&self) -> BusResult<usize> {
        Ok(self.entries.read().await.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// File-backed durable store
///
/// Layout: `<dir>/<message-id>.json`, one envelope per file.
///
/// # Examples
///
/// ```rust,no_run
/// use meridian_shared::service_bus::{DurableStore, FileDurableQueue};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = FileDurableQueue::open("/var/lib/meridian/critical-queue").await?;
/// println!("{} messages awaiting recovery", queue.len().await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileDurableQueue {
    dir: PathBuf,
}

impl FileDurableQueue {
    /// Opens the queue, creating the directory if needed
    ///
    /// Temporary files left behind by an interrupted write are removed.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            MeridianError::storage(
                dir.display().to_string(),
                "Failed to create durable queue directory",
                Some(Box::new(e)),
            )
        })?;

        let queue = Self { dir };
        queue.remove_stale_temp_files().await;
        debug!("Durable queue opened");
        Ok(queue)
    }

    /// Directory holding the queue entries
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, message_id: &str) -> BusResult<PathBuf> {
        let valid = !message_id.is_empty()
            && message_id.len() <= 128
            && message_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BusError::persistence(
                message_id,
                "Message id is not usable as a file name",
            ));
        }
        Ok(self.dir.join(format!("{}.{}", message_id, ENTRY_EXTENSION)))
    }

    async fn remove_stale_temp_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXTENSION) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove stale temp file");
                }
            }
        }
    }
}

#[async_trait]
impl DurableStore for FileDurableQueue {
    async fn persist(&self, message: &Message) -> BusResult<()> {
        let path = self.entry_path(&message.id)?;
        let temp = path.with_extension(TEMP_EXTENSION);
        let bytes = serde_json::to_vec_pretty(message)
            .map_err(|e| BusError::persistence(&message.id, e.to_string()))?;

        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| BusError::persistence(&message.id, format!("write failed: {}", e)))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| BusError::persistence(&message.id, format!("rename failed: {}", e)))?;

        debug!(message_id = %message.id, attempt = message.attempt, "Persisted critical message");
        Ok(())
    }

    async fn remove(&self, message_id: &str) -> BusResult<()> {
        let path = self.entry_path(message_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BusError::persistence(
                message_id,
                format!("remove failed: {}", e),
            )),
        }
    }

    async fn load_all(&self) -> BusResult<Vec<Message>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| BusError::persistence("*", format!("read_dir failed: {}", e)))?;

        let mut messages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BusError::persistence("*", format!("read_dir failed: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable queue entry");
                    continue;
                }
            };

            match serde_json::from_slice::<Message>(&bytes) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt queue entry");
                }
            }
        }

        sort_for_recovery(&mut messages);
        Ok(messages)
    }

    async fn len(&self) -> BusResult<usize> {
        Ok(self.load_all().await?.len())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
