//! Record of references that were synchronized successfully.
//!
//! The engine only ever writes to it. Deciding whether to skip an item is the
//! caller's business (`batch --skip-processed`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Bytes hashed from the start of each file, together with its size
const HASHED_PREFIX: u64 = 4 * 1024 * 1024;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessedItems: Send + Sync {
    async fn mark_as_processed(&self, reference: &Path) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopProcessedItems;

#[async_trait]
impl ProcessedItems for NoopProcessedItems {
    async fn mark_as_processed(&self, _reference: &Path) -> Result<()> {
        Ok(())
    }
}

/// Keeps marked paths in memory, in marking order
#[derive(Debug, Default)]
pub struct InMemoryProcessedItems {
    items: Mutex<Vec<PathBuf>>,
}

impl InMemoryProcessedItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn items(&self) -> Vec<PathBuf> {
        self.items.lock().await.clone()
    }
}

#[async_trait]
impl ProcessedItems for InMemoryProcessedItems {
    async fn mark_as_processed(&self, reference: &Path) -> Result<()> {
        self.items.lock().await.push(reference.to_path_buf());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub path: PathBuf,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    items: BTreeMap<String, ProcessedEntry>,
}

/// JSON file keyed by content hash, so renamed or moved files are still recognised
pub struct ProcessedStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl ProcessedStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn is_processed(&self, reference: &Path) -> Result<bool> {
        let key = content_key(reference).await?;
        Ok(self.state.lock().await.items.contains_key(&key))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn save(&self, state: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedItems for ProcessedStore {
    async fn mark_as_processed(&self, reference: &Path) -> Result<()> {
        let key = content_key(reference).await?;
        let mut state = self.state.lock().await;
        state.items.insert(
            key,
            ProcessedEntry {
                path: reference.to_path_buf(),
                processed_at: Utc::now(),
            },
        );
        self.save(&state).await?;
        debug!("Marked {} as processed", reference.display());
        Ok(())
    }
}

/// SHA-256 over the file size and its leading bytes
pub async fn content_key(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();

        let mut hasher = Sha256::new();
        hasher.update(size.to_le_bytes());
        let mut reader = file.take(HASHED_PREFIX);
        let mut buffer = [0u8; 8192];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok::<_, SyncError>(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[tokio::test]
    async fn store_recognises_renamed_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        let video = temp.child("ep01.mkv");
        video.write_binary(b"not really a video").unwrap();
        let db = temp.child("state/processed.json");

        let store = ProcessedStore::open(db.path()).await.unwrap();
        assert!(store.is_empty().await);
        store.mark_as_processed(video.path()).await.unwrap();
        assert!(std::fs::read_to_string(db.path()).unwrap().contains("ep01.mkv"));

        let renamed = temp.child("Episode 1.mkv");
        std::fs::rename(video.path(), renamed.path()).unwrap();

        let reopened = ProcessedStore::open(db.path()).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.is_processed(renamed.path()).await.unwrap());
    }

    #[tokio::test]
    async fn different_content_is_not_processed() {
        let temp = assert_fs::TempDir::new().unwrap();
        let a = temp.child("a.mkv");
        let b = temp.child("b.mkv");
        a.write_str("one").unwrap();
        b.write_str("two").unwrap();

        let store = ProcessedStore::open(temp.child("db.json").path()).await.unwrap();
        store.mark_as_processed(a.path()).await.unwrap();
        assert!(!store.is_processed(b.path()).await.unwrap());
    }

    #[tokio::test]
    async fn missing_reference_cannot_be_marked() {
        let store = InMemoryProcessedItems::new();
        store.mark_as_processed(Path::new("x.mkv")).await.unwrap();
        assert_eq!(store.items().await, vec![PathBuf::from("x.mkv")]);

        let temp = assert_fs::TempDir::new().unwrap();
        let file_store = ProcessedStore::open(temp.child("db.json").path()).await.unwrap();
        assert!(file_store.mark_as_processed(Path::new("/nonexistent/x.mkv")).await.is_err());
    }
}
