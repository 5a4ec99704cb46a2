//! Broker error kinds
//!
//! Requesters only ever see `Option<InstalledCode>`; these errors are logged,
//! counted, and surfaced through `RequestOutcome::Rejected` for diagnostics.

use crate::code_cache::CodeBlobKind;

/// Reasons a compile request produced no new code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The method is already queued or being compiled
    #[error("Compilation already in progress for {0}")]
    AlreadyInProgress(String),

    /// Installed code already exists at the requested tier
    #[error("Method is already compiled at this tier")]
    AlreadyComplete,

    /// The method is marked not-compilable or excluded
    #[error("Compilation prohibited: {0}")]
    Prohibited(String),

    /// Task allocation or thread creation failed
    #[error("Out of resources: {0}")]
    OutOfResources(String),

    /// The back-end gave up on this attempt
    #[error("Compiler bailout: {0}")]
    CompilerBailout(String),

    /// The back-end can never compile this method at this tier
    #[error("Permanent compiler failure: {0}")]
    CompilerPermanentFailure(String),

    /// The code cache has no room left for the tier's blob kind
    #[error("Code cache exhausted ({0:?})")]
    CodeCacheExhausted(CodeBlobKind),

    /// A back-end failed to initialize
    #[error("Backend initialization failed: {0}")]
    BackendInitFailure(String),

    /// The task was drained from its queue before it ran
    #[error("stale task")]
    Stale,

    /// The broker is not accepting work (not initialized, tier disabled, stopped or shut down)
    #[error("Compilation unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    /// Whether this rejection is part of normal operation and needs no log line above trace
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            BrokerError::AlreadyInProgress(_)
                | BrokerError::AlreadyComplete
                | BrokerError::Prohibited(_)
        )
    }
}
