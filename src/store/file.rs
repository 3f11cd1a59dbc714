// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed store.
//!
//! Both tables live in a single JSON document so downloads survive a
//! restart of the host process. Saves go through a temp file followed by
//! an atomic rename, under an exclusive advisory lock on a sidecar `.lock`
//! file, so another instance writing the same database cannot interleave
//! and a crash mid-write never corrupts the current document.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::locks::{resilient_read, resilient_write};
use crate::store::Store;
use crate::types::{QueueEntry, RegistryEntry};

/// Timeout for acquiring the sidecar file lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while waiting for the lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// On-disk document holding both tables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Document {
    schema_version: u32,
    registry: HashMap<String, RegistryEntry>,
    queue: HashMap<String, QueueEntry>,
    last_saved: Option<DateTime<Utc>>,
}

/// Durable store persisting one JSON document per database.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    tables: std::sync::RwLock<Document>,
    // Serializes mutate-then-persist sequences so a slow save cannot be
    // overwritten on disk by an older snapshot.
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Open (or create) the database under the platform data directory.
    pub fn open(database_name: &str, schema_version: u32) -> Result<Self, StoreError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        let path = base
            .join(database_name)
            .join(format!("store-v{}.json", schema_version));
        Self::open_at(path, schema_version)
    }

    /// Open (or create) the database at an explicit path.
    pub fn open_at(path: impl Into<PathBuf>, schema_version: u32) -> Result<Self, StoreError> {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        let tables = Self::load(&path, &lock_path, schema_version)?;
        Ok(Self {
            path,
            lock_path,
            tables: std::sync::RwLock::new(tables),
            persist_lock: Mutex::new(()),
        })
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path, lock_path: &Path, schema_version: u32) -> Result<Document, StoreError> {
        if !path.exists() {
            return Ok(Document {
                schema_version,
                ..Document::default()
            });
        }

        let lock_file = open_lock_file(lock_path)?;
        acquire_shared_with_timeout(&lock_file, LOCK_TIMEOUT)?;

        let content = fs::read_to_string(path)?;
        let document: Document = serde_json::from_str(&content)?;
        if document.schema_version != schema_version {
            tracing::warn!(
                target: "store",
                found = document.schema_version,
                expected = schema_version,
                "schema version mismatch; starting from an empty database"
            );
            return Ok(Document {
                schema_version,
                ..Document::default()
            });
        }
        Ok(document)
    }

    /// Apply a mutation to the in-memory tables and persist the result.
    async fn mutate<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Document),
    {
        let _persist = self.persist_lock.lock().await;
        let content = {
            let mut tables = resilient_write(&self.tables);
            apply(&mut tables);
            tables.last_saved = Some(Utc::now());
            serde_json::to_string(&*tables)?
        };

        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &lock_path, content.as_bytes()))
            .await
            .map_err(|e| StoreError::Backend(format!("persist task failed: {}", e)))?
    }
}

/// Write `content` to `path` via a temp file and atomic rename, holding the
/// exclusive sidecar lock for the whole operation.
fn write_atomic(path: &Path, lock_path: &Path, content: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let _lock_guard = acquire_exclusive_with_timeout(lock_path, LOCK_TIMEOUT)?;

    let temp_path = path.with_extension("tmp");
    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        temp_file.write_all(content)?;
        // Flush to disk before the rename makes the document current.
        temp_file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

fn open_lock_file(lock_path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(file)
}

/// Acquire an exclusive lock on the sidecar, retrying until the timeout.
fn acquire_exclusive_with_timeout(lock_path: &Path, timeout: Duration) -> Result<File, StoreError> {
    let lock_file = open_lock_file(lock_path)?;
    let start = Instant::now();

    loop {
        match fs2::FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(StoreError::Backend(format!(
                        "timed out waiting for exclusive lock on {:?} after {:?}; \
                         another instance may be writing to the database",
                        lock_path, timeout
                    )));
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
    }
}

/// Acquire a shared lock, retrying until the timeout.
fn acquire_shared_with_timeout(lock_file: &File, timeout: Duration) -> Result<(), StoreError> {
    let start = Instant::now();

    loop {
        match fs2::FileExt::try_lock_shared(lock_file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(StoreError::Backend(format!(
                        "timed out waiting for shared lock after {:?}; \
                         another instance may be writing to the database",
                        timeout
                    )));
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn registry_get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(resilient_read(&self.tables).registry.get(id).cloned())
    }

    async fn registry_put(&self, entry: RegistryEntry) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.registry.insert(entry.id.clone(), entry);
        })
        .await
    }

    async fn registry_delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.mutate(|doc| {
            doc.registry.remove(&id);
        })
        .await
    }

    async fn registry_all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(resilient_read(&self.tables).registry.values().cloned().collect())
    }

    async fn queue_get(&self, id: &str) -> Result<Option<QueueEntry>, StoreError> {
        Ok(resilient_read(&self.tables).queue.get(id).cloned())
    }

    async fn queue_put(&self, entry: QueueEntry) -> Result<(), StoreError> {
        self.mutate(|doc| {
            doc.queue.insert(entry.id.clone(), entry);
        })
        .await
    }

    async fn queue_delete(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.mutate(|doc| {
            doc.queue.remove(&id);
        })
        .await
    }

    async fn queue_all(&self) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(resilient_read(&self.tables).queue.values().cloned().collect())
    }

    async fn queue_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(resilient_read(&self.tables).queue.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::{FileRegistration, ItemStatus};

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry::from_registration(FileRegistration::new(id, "/x", 1), Utc::now())
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open_at(&path, 1).unwrap();
            store.registry_put(entry("a")).await.unwrap();

            let mut q = QueueEntry::pending("a");
            q.status = ItemStatus::Complete;
            q.data = Some(vec![9, 9, 9]);
            store.queue_put(q).await.unwrap();
        }

        let reopened = FileStore::open_at(&path, 1).unwrap();
        let registry = reopened.registry_get("a").await.unwrap().unwrap();
        assert_eq!(registry.id, "a");

        let queue = reopened.queue_get("a").await.unwrap().unwrap();
        assert_eq!(queue.data.as_deref(), Some(&[9u8, 9, 9][..]));
    }

    #[tokio::test]
    async fn test_schema_mismatch_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open_at(&path, 1).unwrap();
            store.registry_put(entry("a")).await.unwrap();
        }

        let upgraded = FileStore::open_at(&path, 2).unwrap();
        assert!(upgraded.registry_get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = FileStore::open_at(&path, 1).unwrap();
            store.queue_put(QueueEntry::pending("gone")).await.unwrap();
            store.queue_delete("gone").await.unwrap();
        }

        let reopened = FileStore::open_at(&path, 1).unwrap();
        assert!(reopened.queue_get("gone").await.unwrap().is_none());
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("test.lock");

        let held = acquire_exclusive_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(held.is_ok(), "first exclusive lock should succeed");

        let second = acquire_exclusive_with_timeout(&lock_path, Duration::from_millis(120));
        assert!(second.is_err(), "second exclusive lock should time out while first is held");

        drop(held);
        let third = acquire_exclusive_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(third.is_ok(), "lock should succeed after the holder releases");
    }
}
