//! Storage adapter: load/save a single `SessionSnapshot` document.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StorageError;
use crate::session::SessionSnapshot;

/// Single-document persistence capability. Implementations never throw on
/// a missing or corrupt document; they return `Ok(None)` instead.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load(&self) -> Result<Option<SessionSnapshot>, StorageError>;
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError>;
}

/// Persists the snapshot as JSON under a single file path, simulating the
/// single-key-in-local-durable-storage model. Once the configured byte
/// ceiling is exceeded, further writes are silently dropped for the
/// lifetime of the process.
pub struct FileStorage {
    path: PathBuf,
    max_bytes: usize,
    disabled: AtomicBool,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            disabled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load(&self) -> Result<Option<SessionSnapshot>, StorageError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("discarding unreadable session snapshot at {:?}: {e}", self.path);
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        if self.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let json = serde_json::to_vec(snapshot)?;
        if json.len() > self.max_bytes {
            self.disabled.store(true, Ordering::Relaxed);
            warn!(
                "session snapshot ({} bytes) exceeds quota ({} bytes); disabling further writes",
                json.len(),
                self.max_bytes
            );
            return Err(StorageError::QuotaExceeded);
        }

        std::fs::write(&self.path, json).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Deep-clones on load/save to prevent a caller from mutating the stored
/// value through a shared reference.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Option<SessionSnapshot>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load(&self) -> Result<Option<SessionSnapshot>, StorageError> {
        Ok(self.inner.lock().expect("storage mutex poisoned").clone())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        *self.inner.lock().expect("storage mutex poisoned") = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn sample_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            sessions: vec![Session::new_client_initiated(
                crate::keys::generate(),
                vec!["wss://relay".into()],
                vec![],
                None,
            )],
            active_session_id: None,
        }
    }

    #[tokio::test]
    async fn in_memory_storage_round_trips() {
        let storage = InMemoryStorage::new();
        assert!(storage.load().await.unwrap().is_none());

        let snapshot = sample_snapshot();
        storage.save(&snapshot).await.unwrap();
        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.sessions.len(), 1);
    }

    #[tokio::test]
    async fn file_storage_tolerates_missing_file() {
        let storage = FileStorage::new("/nonexistent/path/does-not-exist.json", 1_000_000);
        assert!(storage.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_disables_writes_past_quota() {
        let path = std::env::temp_dir().join("nip46-core-test-quota.json");
        let storage = FileStorage::new(path, 1);
        let snapshot = sample_snapshot();
        assert!(storage.save(&snapshot).await.is_err());
        assert!(storage.save(&snapshot).await.is_ok());
    }
}
