//! Errors surfaced by the write queue.

use thiserror::Error;

use crate::storage::StoreError;

/// Failures a caller of the outbox can observe.
///
/// Upload failures and lost claim races are not errors here: a flush absorbs
/// them and reports them per item as
/// [`ItemOutcome`](crate::outbox::ItemOutcome)s.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No identity is signed in; the caller must obtain one first.
    #[error("Not authenticated: sign in before writing")]
    NotAuthenticated,
    /// A storage transaction could not complete.
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
}
