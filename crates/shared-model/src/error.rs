use crdt_adapter::AdapterError;

/// Errors raised by the notebook model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("unknown cell type {0:?}")]
    UnknownCellType(String),

    #[error("the cell undo manager is already set")]
    UndoManagerAlreadySet,

    #[error("metadata value for {0:?} cannot be undefined; use delete_metadata")]
    MetadataValueUndefined(String),

    #[error("index {index} out of range for {len} items")]
    InvalidIndex { index: usize, len: usize },

    #[error("invalid range {start}..{end} for {len} items")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("operation not supported for {cell_type} cells")]
    Unsupported { cell_type: String },

    #[error("document has been disposed")]
    Disposed,

    #[error("malformed document: {0}")]
    InvalidSchema(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub type Result<T, E = ModelError> = std::result::Result<T, E>;
