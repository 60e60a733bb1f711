//! Cycle engine error type.

use gen_common::LedgerError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by cycle engine operations.
///
/// None of these are fatal to the process: the cycle manager logs them and
/// retries on its next scheduled step.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The operation is not allowed in the current state. Nothing was mutated.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// Persisting engine state failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A ledger call needed by the whole step failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CycleError {
    /// Whether this is a precondition refusal rather than a failure.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }
}
