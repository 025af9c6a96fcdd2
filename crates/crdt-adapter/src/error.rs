use automerge::{AutomergeError, ObjId};

/// Errors raised by replica transactions, undo managers and replication.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("automerge error: {0}")]
    Automerge(#[from] AutomergeError),

    #[error("replica is busy: a transaction or replication step is already in progress")]
    Reentrant,

    #[error("replica has been destroyed")]
    Destroyed,

    #[error("undo manager has been destroyed")]
    ManagerDestroyed,

    #[error("object {0} is already tracked by another undo manager")]
    AlreadyTracked(ObjId),

    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },
}

pub type Result<T, E = AdapterError> = std::result::Result<T, E>;
