use thiserror::Error;

use crate::database::DatabaseError;
use crate::state::StateStoreError;

#[derive(Error, Debug)]
pub enum BackfillError {
    /// A chunk kept failing past the attempt cap. The job is Failed and the
    /// candidate stays Pending for manual intervention; nothing is rolled back.
    #[error(
        "Backfill of {table}.{column} failed at partition `{partition}` \
         after {attempts} attempts: {source}"
    )]
    RetriesExhausted {
        table: String,
        column: String,
        partition: String,
        attempts: u32,
        source: DatabaseError,
    },

    /// A chunk failed with an error retrying cannot fix (e.g. a malformed
    /// statement). The job goes straight to Failed.
    #[error("Backfill of {table}.{column} hit a non-retryable error at partition `{partition}`: {source}")]
    NonRetryable {
        table: String,
        column: String,
        partition: String,
        source: DatabaseError,
    },

    #[error(transparent)]
    State(#[from] StateStoreError),
}
