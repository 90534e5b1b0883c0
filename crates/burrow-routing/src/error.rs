//! Error types for routing policy application.

use thiserror::Error;

use crate::policy::PolicyStep;

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors that can occur while applying or reverting routing policy.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A network operation failed.
    #[error("network operation failed: {0}")]
    Ops(String),

    /// Application failed part-way; rollback of this call was attempted.
    ///
    /// `survivors` lists the steps that could not be reversed and are
    /// therefore still installed on the host. An empty list means rollback
    /// was complete.
    #[error("policy application failed at {failed}: {cause} ({} steps survived rollback)", survivors.len())]
    PartialApply {
        /// The step whose installation failed.
        failed: PolicyStep,
        /// Why it failed.
        cause: String,
        /// Applied steps that could not be reversed.
        survivors: Vec<PolicyStep>,
    },
}
