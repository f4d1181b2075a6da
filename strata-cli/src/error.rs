//! CLI error type and process exit codes

use strata_core::config::ConfigError;
use strata_core::differ::DiffError;
use strata_core::refresh::RefreshError;
use strata_core::resource::{AddressError, ResourceId};
use strata_provider_local::cloud::CloudError;
use strata_state::BackendError;
use thiserror::Error;

/// Errors that abort a command before or instead of applying anything
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("Failed to open local cloud: {0}")]
    Cloud(#[from] CloudError),

    #[error(
        "Plan deletes protected resources: {}",
        .0.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
    )]
    Protected(Vec<ResourceId>),

    #[error("Resource {0} is not recorded in state")]
    NotInState(ResourceId),

    #[error("Failed to read confirmation: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("Cancelled by user")]
    Declined,
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Changes applied (or a plan with changes, or a read-only command)
    Success,
    /// Nothing to do
    NoChanges,
    /// Some entries failed or were not run
    PartialFailure,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::NoChanges => 2,
            Outcome::PartialFailure => 3,
        }
    }
}

/// Exit code for a command that was aborted before apply
pub const EXIT_ABORTED: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            Outcome::Success.exit_code(),
            Outcome::NoChanges.exit_code(),
            Outcome::PartialFailure.exit_code(),
            EXIT_ABORTED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn protected_error_lists_resources() {
        let err = CliError::Protected(vec![
            ResourceId::new("dynamodb.table", "users"),
            ResourceId::new("iam.role", "exec"),
        ]);
        assert_eq!(
            err.to_string(),
            "Plan deletes protected resources: dynamodb.table.users, iam.role.exec"
        );
    }
}
