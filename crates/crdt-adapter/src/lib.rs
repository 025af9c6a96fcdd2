//! crdt-adapter - Observable, undoable transactions over an Automerge replica.
//!
//! Automerge merges concurrent edits but leaves grouping, observation and undo
//! to the application. This crate adds those on top of `AutoCommit`:
//!
//! - [`Replica::transact`] groups writes under an [`Origin`] and reports them
//!   to observers as one [`ChangeBatch`].
//! - [`UndoManager`] captures transactions by origin and scope and reverts
//!   them without touching concurrent remote edits.
//! - [`Presence`] holds ephemeral per-client state.
//!
//! Replication (save, incremental updates, sync messages) passes straight
//! through to Automerge; remote batches carry [`Origin::REMOTE`].

pub mod error;
pub mod events;
pub mod origin;
pub mod presence;
pub mod replica;
pub mod subscription;
pub mod txn;
pub mod undo;
pub mod value;

pub use error::{AdapterError, Result};
pub use events::{push_op, ChangeBatch, Delta, DeltaOp, KeyAction, KeyChange, ObjChange, ObjEvent};
pub use origin::Origin;
pub use presence::{Presence, PresenceChange};
pub use replica::Replica;
pub use subscription::{Emitter, Subscription};
pub use txn::Txn;
pub use undo::{StackEvent, StackKind, UndoManager, UndoOptions};
pub use value::{child_id, is_reachable, is_within, read_i64, read_str, Entry, Snapshot};

pub use automerge::sync::{Message as SyncMessage, State as SyncState};
pub use automerge::{ObjId, ObjType, ReadDoc, ScalarValue, ROOT};
