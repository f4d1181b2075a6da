//! State backend trait and error types

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use strata_core::resource::Value;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

/// Interval between lock acquisition attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The state is locked by another process
    #[error("State is locked by {who} (lock ID: {lock_id}, operation: {operation})")]
    Locked {
        lock_id: String,
        who: String,
        operation: String,
    },

    /// The lock stayed held for the whole wait
    #[error("Timed out after {}s waiting for the state lock on '{key}': {reason}", .waited.as_secs_f64())]
    LockTimeout {
        key: String,
        waited: Duration,
        reason: Box<BackendError>,
    },

    /// The lock was not found (for force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// A write was attempted without holding the active lock
    #[error("Lock {0} is not the active lock for this state")]
    NotLockHolder(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// State file is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a Locked error from a LockInfo
    pub fn locked(lock: &LockInfo) -> Self {
        Self::Locked {
            lock_id: lock.id.clone(),
            who: lock.who.clone(),
            operation: lock.operation.clone(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Another run holds the lock
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::LockTimeout { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// One backend instance serves one state key. Lock acquisition must be an
/// atomic create-if-absent so that two callers never both succeed.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// State key (environment) served by this backend
    fn key(&self) -> &str;

    /// Read the current state from the backend
    ///
    /// Returns `None` if no state exists (first-time use). Content that cannot
    /// be parsed or fails validation is `InvalidState`.
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Write the state to the backend
    ///
    /// Fails with `NotLockHolder` unless `lock` is the active lock.
    async fn write_state(&self, lock: &LockInfo, state: &StateFile) -> BackendResult<()>;

    /// Make a single attempt to acquire the lock
    ///
    /// Fails with `Locked` if a live lock is held. An expired lock is
    /// reclaimed.
    async fn try_acquire_lock(&self, operation: &str) -> BackendResult<LockInfo>;

    /// Acquire the lock, polling until it is free or `timeout` elapses
    async fn acquire_lock(&self, operation: &str, timeout: Duration) -> BackendResult<LockInfo> {
        let started = tokio::time::Instant::now();
        loop {
            match self.try_acquire_lock(operation).await {
                Ok(lock) => {
                    log::info!("Acquired state lock {} for {}", lock.id, operation);
                    return Ok(lock);
                }
                Err(e @ BackendError::Locked { .. }) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(BackendError::LockTimeout {
                            key: self.key().to_string(),
                            waited,
                            reason: Box::new(e),
                        });
                    }
                    log::debug!("{}, retrying", e);
                    tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout - waited)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a previously acquired lock
    ///
    /// Idempotent: releasing a lock that no longer exists succeeds, and a lock
    /// now held by someone else is left in place.
    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Force release a lock by its ID
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;

    /// The lock currently held, if any
    async fn current_lock(&self) -> BackendResult<Option<LockInfo>>;
}

/// Configuration for a state backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type ("local" or "memory")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get an integer attribute value
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Value::Int(n)) => Some(*n),
            _ => None,
        }
    }
}
