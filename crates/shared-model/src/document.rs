//! Shared document base: one replica with a state map, a document-wide undo
//! manager and a presence channel.
//!
//! ## Document schema (common part)
//!
//! ```text
//! ROOT/
//!   state/          ← Map of JSON-encoded Str values
//! ```
//!
//! Notebooks and files add their own root objects in the same bootstrap
//! change, so replicas created independently can still merge.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crdt_adapter::{
    child_id, read_str, Emitter, Entry, ObjId, ObjType, Origin, Presence, Replica, Subscription,
    Txn, UndoManager, ROOT,
};
use log::{debug, info};
use serde_json::Value;

use crate::changes::StateChange;
use crate::error::{ModelError, Result};

pub(crate) const STATE_KEY: &str = "state";

/// Decode a JSON-encoded string entry.
pub(crate) fn decode_entry(entry: Option<&Entry>) -> Option<Value> {
    entry
        .and_then(Entry::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

pub(crate) fn read_json<R: crdt_adapter::ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Option<Value> {
    read_str(doc, obj, key).and_then(|raw| serde_json::from_str(&raw).ok())
}

/// Root handle to replicated state.
pub struct SharedDocument {
    replica: Replica,
    origin: Origin,
    state_map: ObjId,
    undo_manager: Rc<UndoManager>,
    presence: Rc<Presence>,
    state_changed: Emitter<Vec<StateChange>>,
    disposed: Cell<bool>,
    subscription: RefCell<Option<Subscription>>,
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("origin", &self.origin)
            .field("disposed", &self.disposed.get())
            .finish_non_exhaustive()
    }
}

impl SharedDocument {
    /// A fresh document whose bootstrap change also runs `schema`.
    pub fn with_schema<F>(schema: F) -> Result<Self>
    where
        F: FnOnce(&Txn<'_>) -> crdt_adapter::Result<()>,
    {
        let replica = Replica::with_schema(|txn| {
            txn.put_object(&ROOT, STATE_KEY, ObjType::Map)?;
            schema(txn)
        })?;
        Self::from_replica(replica)
    }

    pub fn new() -> Result<Self> {
        Self::with_schema(|_| Ok(()))
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Self::from_replica(Replica::load(bytes)?)
    }

    /// Wrap an existing replica; it must already contain the state map.
    pub fn from_replica(replica: Replica) -> Result<Self> {
        let state_map = replica
            .read(|doc| child_id(doc, ROOT, STATE_KEY, ObjType::Map))
            .ok_or_else(|| ModelError::InvalidSchema("missing state map".into()))?;
        let origin = Origin::unique();
        let undo_manager = Rc::new(UndoManager::new(&replica, &[], &[origin])?);

        let state_changed: Emitter<Vec<StateChange>> = Emitter::new();
        let subscription = {
            let emitter = state_changed.clone();
            let target = state_map.clone();
            replica.observe(&state_map, move |batch| {
                let Some(keys) = batch.map_change(&target) else {
                    return;
                };
                let changes: Vec<StateChange> = keys
                    .iter()
                    .map(|(name, change)| StateChange {
                        name: name.clone(),
                        old_value: decode_entry(change.old.as_ref()),
                        new_value: decode_entry(change.new.as_ref()),
                    })
                    .collect();
                if !changes.is_empty() {
                    emitter.emit(&changes);
                }
            })
        };

        debug!("[shared-doc] Opened document with origin {:?}", origin);
        Ok(Self {
            replica,
            origin,
            state_map,
            undo_manager,
            presence: Rc::new(Presence::new()),
            state_changed,
            disposed: Cell::new(false),
            subscription: RefCell::new(Some(subscription)),
        })
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed.get() {
            return Err(ModelError::Disposed);
        }
        Ok(())
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Origin tagged on this document's undoable transactions.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn undo_manager(&self) -> &Rc<UndoManager> {
        &self.undo_manager
    }

    pub fn presence(&self) -> &Rc<Presence> {
        &self.presence
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Group everything `f` writes into one change. Undoable changes form one undo step.
    pub fn transact<R, F>(&self, undoable: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Txn<'_>) -> Result<R>,
    {
        self.ensure_live()?;
        let origin = if undoable {
            self.origin
        } else {
            Origin::UNTRACKED
        };
        self.replica.transact(origin, f)
    }

    pub fn undo(&self) -> Result<()> {
        self.ensure_live()?;
        self.undo_manager.undo()?;
        Ok(())
    }

    pub fn redo(&self) -> Result<()> {
        self.ensure_live()?;
        self.undo_manager.redo()?;
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        !self.disposed.get() && self.undo_manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        !self.disposed.get() && self.undo_manager.can_redo()
    }

    pub fn clear_undo_history(&self) -> Result<()> {
        self.ensure_live()?;
        self.undo_manager.clear()?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.replica.read(|doc| read_json(doc, &self.state_map, key))
    }

    /// Set a shared state value. State writes are never undoable.
    pub fn set_state(&self, key: &str, value: &Value) -> Result<()> {
        if self.get_state(key).as_ref() == Some(value) {
            return Ok(());
        }
        let encoded = serde_json::to_string(value)?;
        self.transact(false, |txn| Ok(txn.put(&self.state_map, key, encoded)?))
    }

    pub fn on_state_change(&self, f: impl Fn(&Vec<StateChange>) + 'static) -> Subscription {
        self.state_changed.subscribe(f)
    }

    /// Release the presence channel, the undo manager and the replica. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.subscription.borrow_mut().take();
        self.state_changed.clear();
        self.presence.destroy();
        self.undo_manager.destroy();
        self.replica.destroy();
        info!("[shared-doc] Disposed document");
    }
}
