//! Lock information for state backend locking

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lock lifetime in seconds (15 minutes). A lock older than this is
/// considered abandoned by a crashed holder and may be reclaimed.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// State key (environment) the lock protects
    pub key: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation
    pub fn new(key: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::with_ttl(key, operation, Duration::seconds(DEFAULT_LOCK_TTL_SECS))
    }

    /// Create a new lock with a custom lifetime
    pub fn with_ttl(key: impl Into<String>, operation: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            operation: operation.into(),
            who: get_lock_owner(),
            created: now,
            expires: now + ttl,
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
