//! shared-model - Collaborative notebook model on a shared Automerge replica.
//!
//! A [`Notebook`] keeps an ordered list of [`SharedCell`] wrappers in step with
//! the replicated cell list, whether changes come from local calls, undo and
//! redo, or merged remote updates. Each change is reported once, as a typed
//! record ([`NotebookChange`], [`CellChange`], [`ListChange`], [`MapChange`]).
//!
//! Undo is either document-wide (the default) or per cell
//! ([`NotebookOptions::per_cell_undo`]). Output and execution-count writes are
//! never undoable.
//!
//! ```no_run
//! use shared_model::{CellRecord, Notebook, NotebookOptions};
//!
//! let notebook = Notebook::new(NotebookOptions::default())?;
//! let cells = notebook.insert_cells(0, &[CellRecord::code("1 + 1")])?;
//! cells[0].set_metadata_key("collapsed", Some(serde_json::json!(true)))?;
//! notebook.undo()?;
//! # Ok::<(), shared_model::ModelError>(())
//! ```

pub mod cell;
pub mod changes;
pub mod document;
pub mod error;
pub mod file;
mod metadata;
pub mod notebook;
pub mod options;
pub mod record;

pub use cell::{
    create_standalone_cell, create_standalone_cell_with, CellCore, CellHandle, CodeCell,
    MarkdownCell, RawCell, SharedCell, WithAttachments,
};
pub use changes::{
    diff_metadata, CellChange, FileChange, ListChange, ListChangeType, MapChange, MapChangeType,
    NbformatChange, NotebookChange, StateChange, ValueChange,
};
pub use document::SharedDocument;
pub use error::{ModelError, Result};
pub use file::SharedFile;
pub use notebook::Notebook;
pub use options::NotebookOptions;
pub use record::{
    default_cell_type_adaptor, CellKind, CellRecord, CellTypeAdaptor, Metadata, NotebookRecord,
};

pub use crdt_adapter::{Delta, DeltaOp, Presence, Subscription, SyncMessage, SyncState};
