//! Strata State Management
//!
//! This crate persists the last-applied view of managed resources and guards
//! it with a lock so that only one run changes an environment at a time.
//!
//! # Overview
//!
//! - **StateFile**: The persisted document containing all managed resources
//! - **StateBackend**: A trait for state storage backends (local, memory)
//! - **LockInfo**: Information about the lock held by a run
//! - **StateSession**: Lock, read, record changes, commit, release
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use strata_state::{create_backend, BackendConfig, StateSession};
//!
//! let config = BackendConfig::new("local")
//!     .with_attribute("path", Value::string(".strata"))
//!     .with_attribute("key", Value::string("prod"));
//! let backend = Arc::from(create_backend(&config).await?);
//!
//! let mut session = StateSession::begin(backend, "apply", Duration::from_secs(30)).await?;
//! let current = session.current_states().clone();
//!
//! // ... plan and apply against `current` ...
//!
//! session.record(&report, &registry);
//! session.commit().await?;
//! session.close().await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod session;
pub mod state;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, MemoryBackend, create_backend};
pub use lock::LockInfo;
pub use session::StateSession;
pub use state::{ResourceState, StateFile};
