//! Local file backend for state storage
//!
//! State for key `<env>` lives in `<dir>/<env>.state.json`; the lock is
//! `<dir>/<env>.lock`, created with create-new semantics so that only one
//! process can hold it.

use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo};
use crate::state::StateFile;

/// Local file backend for development and single-machine use
pub struct LocalBackend {
    key: String,
    /// Path to the state file
    state_path: PathBuf,
    /// Path to the lock file
    lock_path: PathBuf,
    lock_ttl: chrono::Duration,
}

impl LocalBackend {
    /// Default state directory
    pub const DEFAULT_DIR: &'static str = ".strata";
    /// Default state key
    pub const DEFAULT_KEY: &'static str = "default";

    /// Create a LocalBackend storing state for `key` under `dir`
    pub fn new(dir: impl AsRef<Path>, key: impl Into<String>) -> Self {
        let key = key.into();
        let dir = dir.as_ref();
        Self {
            state_path: dir.join(format!("{}.state.json", key)),
            lock_path: dir.join(format!("{}.lock", key)),
            key,
            lock_ttl: chrono::Duration::seconds(DEFAULT_LOCK_TTL_SECS),
        }
    }

    /// Lifetime after which a held lock is considered stale
    pub fn with_lock_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let dir = config.get_string("path").unwrap_or(Self::DEFAULT_DIR);
        let key = config.get_string("key").unwrap_or(Self::DEFAULT_KEY);
        if key.is_empty() || key.contains(['/', '\\']) {
            return Err(BackendError::configuration(format!(
                "Invalid state key '{}'",
                key
            )));
        }

        let mut backend = Self::new(dir, key);
        if let Some(ttl) = config.get_int("lock_ttl_secs") {
            backend = backend.with_lock_ttl(chrono::Duration::seconds(ttl));
        }
        Ok(backend)
    }

    /// Get the state file path
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Get the lock file path
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn ensure_dir(&self) -> BackendResult<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                BackendError::Io(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        Ok(())
    }

    fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        read_lock_at(&self.lock_path)
    }

    /// Move the lock file aside if it still holds `stale_id`
    ///
    /// The rename is atomic, so of several processes reclaiming the same
    /// stale lock exactly one moves it. A process that moved a lock other
    /// than `stale_id` puts it back and reports `Ok(false)`.
    fn reclaim_stale_lock(&self, stale_id: &str) -> BackendResult<bool> {
        let tombstone = self
            .lock_path
            .with_extension(format!("lock.stale-{}", uuid::Uuid::new_v4()));
        match fs::rename(&self.lock_path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BackendError::Io(format!("Failed to move lock file: {}", e))),
        }

        let moved = read_lock_at(&tombstone);
        if matches!(&moved, Ok(Some(lock)) if lock.id == stale_id) {
            remove_file_if_exists(&tombstone)?;
            return Ok(true);
        }

        // Not the lock we judged stale: restore it unless a new one was created
        match fs::hard_link(&tombstone, &self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                log::warn!(
                    "Could not restore lock moved during stale reclaim; a newer lock exists"
                );
            }
            Err(e) => {
                return Err(BackendError::Io(format!("Failed to restore lock file: {}", e)));
            }
        }
        remove_file_if_exists(&tombstone)?;
        Ok(false)
    }

    fn remove_lock_file(&self) -> BackendResult<()> {
        remove_file_if_exists(&self.lock_path)
    }

    /// Create the lock file; `Ok(false)` if it already exists
    fn create_lock_file(&self, lock: &LockInfo) -> BackendResult<bool> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(BackendError::Io(format!("Failed to create lock file: {}", e))),
        };

        let content = serde_json::to_string_pretty(lock)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| BackendError::Io(format!("Failed to write lock file: {}", e)))?;
        Ok(true)
    }
}

fn read_lock_at(path: &Path) -> BackendResult<Option<LockInfo>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackendError::Io(format!("Failed to read lock file: {}", e))),
    };
    let lock = serde_json::from_str(&content).map_err(|e| {
        BackendError::invalid_state(format!(
            "Failed to parse lock file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(Some(lock))
}

fn remove_file_if_exists(path: &Path) -> BackendResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    fn key(&self) -> &str {
        &self.key
    }

    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(format!("Failed to read state file: {}", e))),
        };

        StateFile::from_json(&content).map(Some)
    }

    async fn write_state(&self, lock: &LockInfo, state: &StateFile) -> BackendResult<()> {
        match self.read_lock()? {
            Some(active) if active.id == lock.id => {}
            _ => return Err(BackendError::NotLockHolder(lock.id.clone())),
        }

        let content = state.to_json()?;
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;
        fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| BackendError::Io(format!("Failed to replace state file: {}", e)))?;

        log::debug!(
            "Wrote state serial {} to {}",
            state.serial,
            self.state_path.display()
        );
        Ok(())
    }

    async fn try_acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        self.ensure_dir()?;
        let lock = LockInfo::with_ttl(&self.key, operation, self.lock_ttl);

        // One retry after reclaiming a stale lock
        for _ in 0..2 {
            if self.create_lock_file(&lock)? {
                return Ok(lock);
            }

            let Some(existing) = self.read_lock()? else {
                // Released between our attempt and the read
                continue;
            };
            if !existing.is_expired() {
                return Err(BackendError::locked(&existing));
            }

            log::warn!(
                "Reclaiming stale state lock {} held by {} since {}",
                existing.id,
                existing.who,
                existing.created
            );
            if !self.reclaim_stale_lock(&existing.id)? {
                log::debug!("Stale lock {} was reclaimed by another run", existing.id);
            }
        }

        match self.read_lock()? {
            Some(existing) => Err(BackendError::locked(&existing)),
            None => Err(BackendError::Io("Lock file changed during acquisition".to_string())),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        match self.read_lock()? {
            None => {
                log::debug!("Lock {} already released", lock.id);
                Ok(())
            }
            Some(existing) if existing.id != lock.id => {
                log::warn!(
                    "Lock {} is no longer held; leaving lock {} held by {} in place",
                    lock.id,
                    existing.id,
                    existing.who
                );
                Ok(())
            }
            Some(_) => {
                self.remove_lock_file()?;
                log::info!("Released state lock {}", lock.id);
                Ok(())
            }
        }
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        // An unreadable lock file can only be cleared this way
        let existing = match self.read_lock() {
            Ok(Some(existing)) => existing,
            Ok(None) => return Err(BackendError::LockNotFound(lock_id.to_string())),
            Err(BackendError::InvalidState(_)) => return self.remove_lock_file(),
            Err(e) => return Err(e),
        };

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.remove_lock_file()?;
        log::warn!("Force-released state lock {} held by {}", lock_id, existing.who);
        Ok(())
    }

    async fn current_lock(&self) -> BackendResult<Option<LockInfo>> {
        self.read_lock()
    }
}
