//! Backend implementations for state storage

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    match config.backend_type.as_str() {
        "local" => {
            let backend = LocalBackend::from_config(config)?;
            Ok(Box::new(backend))
        }
        "memory" => {
            let backend = MemoryBackend::from_config(config);
            Ok(Box::new(backend))
        }
        other => Err(BackendError::unsupported_backend(other)),
    }
}
