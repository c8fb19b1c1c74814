//! Error taxonomy for the coordination kernel.

use thiserror::Error;

/// The five-way error taxonomy the kernel surfaces to callers and logs.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema, type, or regex violation in a command. No state change.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Optimistic-check failure on assignment/claim/transition. No state change.
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    /// VCS/host CLI failure during merge; the merger advances to the next tier.
    #[error("transient subprocess failure: {0}")]
    TransientSubprocess(String),

    /// Detected by the watchdog; recovered locally and never shown to the user.
    #[error("worker death: {0}")]
    WorkerDeath(String),

    /// Database open failure, schema mismatch, or socket bind failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    #[must_use]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput(reason.into())
    }

    #[must_use]
    pub fn conflicting_state(reason: impl Into<String>) -> Self {
        Self::ConflictingState(reason.into())
    }

    #[must_use]
    pub fn transient_subprocess(reason: impl Into<String>) -> Self {
        Self::TransientSubprocess(reason.into())
    }

    #[must_use]
    pub fn worker_death(reason: impl Into<String>) -> Self {
        Self::WorkerDeath(reason.into())
    }

    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    /// Whether this error represents a caller-retryable optimistic-check failure.
    #[must_use]
    pub const fn is_conflicting_state(&self) -> bool {
        matches!(self, Self::ConflictingState(_))
    }
}

/// Result type alias used throughout `conductor-core`.
pub type Result<T> = std::result::Result<T, Error>;
