use crate::group_store::GroupStoreError;
use crate::merger::MergeError;
use crate::object_store::ObjectStoreError;
use thiserror::Error;

/// Errors raised by a single pipeline invocation.
///
/// Everything here is fatal for the invocation that raised it; the external
/// trigger infrastructure owns whole-invocation retries (at-least-once), so
/// no variant is retried internally.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The object-created notification did not carry a bucket and key
    #[error("malformed object-created event: {0}")]
    MalformedEvent(String),

    /// The trigger object was not a manifest naming a group id
    #[error("manifest {key} has no usable groupId: {message}")]
    MissingGroupId { key: String, message: String },

    /// Object storage failure (listing, read, or write)
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),

    /// Group status store failure
    #[error(transparent)]
    Status(#[from] GroupStoreError),

    /// The merge itself failed; inputs have been quarantined
    #[error(transparent)]
    Merge(#[from] MergeError),
}
