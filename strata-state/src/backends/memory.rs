//! In-memory backend for tests and embedding
//!
//! Clones share the same store, so two clones behave like two processes
//! pointed at the same remote state.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::StateFile;

#[derive(Debug, Default)]
struct Store {
    /// Serialized state, as a remote store would hold it
    state: Option<String>,
    lock: Option<LockInfo>,
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    key: String,
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            store: Arc::default(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.get_string("key").unwrap_or("default"))
    }

    /// Overwrite the stored content, bypassing validation and locking
    pub fn put_raw(&self, content: impl Into<String>) {
        if let Ok(mut store) = self.store.lock() {
            store.state = Some(content.into());
        }
    }

    fn store(&self) -> BackendResult<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| BackendError::Io("Memory store is poisoned".to_string()))
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = self.store()?.state.clone();
        content.map(|c| StateFile::from_json(&c)).transpose()
    }

    async fn write_state(&self, lock: &LockInfo, state: &StateFile) -> BackendResult<()> {
        let content = state.to_json()?;
        let mut store = self.store()?;
        match &store.lock {
            Some(active) if active.id == lock.id => {}
            _ => return Err(BackendError::NotLockHolder(lock.id.clone())),
        }
        store.state = Some(content);
        Ok(())
    }

    async fn try_acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let mut store = self.store()?;
        if let Some(existing) = &store.lock {
            if !existing.is_expired() {
                return Err(BackendError::locked(existing));
            }
            log::warn!("Reclaiming stale state lock {} held by {}", existing.id, existing.who);
        }

        let lock = LockInfo::new(&self.key, operation);
        store.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let mut store = self.store()?;
        if store.lock.as_ref().is_some_and(|active| active.id == lock.id) {
            store.lock = None;
        }
        Ok(())
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let mut store = self.store()?;
        match &store.lock {
            None => Err(BackendError::LockNotFound(lock_id.to_string())),
            Some(active) if active.id != lock_id => Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: active.id.clone(),
            }),
            Some(_) => {
                store.lock = None;
                Ok(())
            }
        }
    }

    async fn current_lock(&self) -> BackendResult<Option<LockInfo>> {
        Ok(self.store()?.lock.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_lock_and_state() {
        let first = MemoryBackend::new("prod");
        let second = first.clone();

        let lock = first.try_acquire_lock("apply").await.unwrap();
        assert!(matches!(
            second.try_acquire_lock("apply").await,
            Err(BackendError::Locked { .. })
        ));

        let mut state = StateFile::new();
        state.increment_serial();
        first.write_state(&lock, &state).await.unwrap();
        assert_eq!(second.read_state().await.unwrap(), Some(state));

        // Second cannot write with a lock it does not hold
        let foreign = LockInfo::new("prod", "apply");
        assert!(matches!(
            second.write_state(&foreign, &StateFile::new()).await,
            Err(BackendError::NotLockHolder(_))
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_keeps_foreign_lock() {
        let backend = MemoryBackend::new("prod");
        let stale = LockInfo::new("prod", "apply");
        backend.release_lock(&stale).await.unwrap();

        let held = backend.try_acquire_lock("apply").await.unwrap();
        backend.release_lock(&stale).await.unwrap();
        assert_eq!(backend.current_lock().await.unwrap(), Some(held));
    }

    #[tokio::test]
    async fn test_corrupt_content_is_invalid_state() {
        let backend = MemoryBackend::new("prod");
        backend.put_raw("[]");
        assert!(matches!(
            backend.read_state().await,
            Err(BackendError::InvalidState(_))
        ));
    }
}
