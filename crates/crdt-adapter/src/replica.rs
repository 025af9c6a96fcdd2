//! A replica: one Automerge document plus its observers and undo managers.
//!
//! All local writes go through [`Replica::transact`]. When the outermost
//! transaction commits, the replica:
//!
//! ```text
//! commit ─► diff(before, after) ─► ChangeBatch ─► undo capture ─► observers ─► stack events
//! ```
//!
//! Remote steps (incremental load, merge, sync) produce one batch each with
//! [`Origin::REMOTE`]; undo managers never capture them.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use automerge::sync::{self, SyncDoc};
use automerge::transaction::CommitOptions;
use automerge::{
    ActorId, AutoCommit, ChangeHash, Cursor, LoadOptions, ObjId, ObjType, ReadDoc, TextEncoding,
};
use log::{debug, warn};

use crate::error::{AdapterError, Result};
use crate::events::{self, ChangeBatch};
use crate::origin::Origin;
use crate::subscription::Subscription;
use crate::txn::{Mode, OpenTxn, Txn};
use crate::undo::{self, ManagerState};

/// Actor used for schema bootstrap changes, so every replica that builds the
/// same schema produces byte-identical initial history and can merge.
const SCHEMA_ACTOR: &[u8; 16] = b"crdt-adapter/0.1";

pub(crate) struct ReplicaState {
    pub(crate) doc: AutoCommit,
    pub(crate) open: Option<OpenTxn>,
    /// Objects recreated by undo, keyed by the id they replace.
    pub(crate) redirects: HashMap<ObjId, ObjId>,
    /// Elements recreated by undo, keyed by the encoded cursor they replace.
    pub(crate) cursor_redirects: HashMap<Vec<u8>, Cursor>,
    pub(crate) managers: Vec<Option<ManagerState>>,
    pub(crate) destroyed: bool,
}

struct Observer {
    id: u64,
    target: ObjId,
    deep: bool,
    alive: Rc<Cell<bool>>,
    callback: Rc<dyn Fn(&ChangeBatch)>,
}

struct Shared {
    state: RefCell<ReplicaState>,
    observers: RefCell<Vec<Observer>>,
    next_observer: Cell<u64>,
}

/// Shared handle to a replica. Clones refer to the same document.
#[derive(Clone)]
pub struct Replica(Rc<Shared>);

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.state.try_borrow() {
            Ok(state) => f
                .debug_struct("Replica")
                .field("actor", state.doc.get_actor())
                .field("destroyed", &state.destroyed)
                .finish(),
            Err(_) => f.debug_struct("Replica").finish_non_exhaustive(),
        }
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    fn from_doc(doc: AutoCommit) -> Self {
        Replica(Rc::new(Shared {
            state: RefCell::new(ReplicaState {
                doc,
                open: None,
                redirects: HashMap::new(),
                cursor_redirects: HashMap::new(),
                managers: Vec::new(),
                destroyed: false,
            }),
            observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(0),
        }))
    }

    /// An empty document with a random actor.
    pub fn new() -> Self {
        let doc = AutoCommit::new_with_encoding(TextEncoding::UnicodeCodePoint)
            .with_actor(ActorId::random());
        Self::from_doc(doc)
    }

    /// A document whose initial structure is written by `schema` as a
    /// deterministic change.
    ///
    /// Replicas bootstrapped with the same schema share their first change and
    /// can exchange updates without conflicting root objects.
    pub fn with_schema<F>(schema: F) -> Result<Self>
    where
        F: FnOnce(&Txn<'_>) -> Result<()>,
    {
        let doc = AutoCommit::new_with_encoding(TextEncoding::UnicodeCodePoint)
            .with_actor(ActorId::from(SCHEMA_ACTOR.as_slice()));
        let replica = Self::from_doc(doc);
        {
            let mut state = replica.state_mut()?;
            let before = state.doc.get_heads();
            state.open = Some(OpenTxn::new(Origin::UNTRACKED, Mode::Normal, before));
        }
        let result = schema(&Txn::new(&replica));
        let mut state = replica.state_mut()?;
        state.open = None;
        match result {
            Ok(()) => {
                state
                    .doc
                    .commit_with(CommitOptions::default().with_time(0));
                state.doc.set_actor(ActorId::random());
            }
            Err(err) => {
                state.doc.rollback();
                return Err(err);
            }
        }
        drop(state);
        Ok(replica)
    }

    /// Load a document saved with [`Replica::save`].
    pub fn load(bytes: &[u8]) -> Result<Self> {
        let options = LoadOptions::new().text_encoding(TextEncoding::UnicodeCodePoint);
        let mut doc = AutoCommit::load_with_options(bytes, options)?;
        doc.set_actor(ActorId::random());
        Ok(Self::from_doc(doc))
    }

    pub(crate) fn state(&self) -> Ref<'_, ReplicaState> {
        self.0.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> Result<RefMut<'_, ReplicaState>> {
        let state = self
            .0
            .state
            .try_borrow_mut()
            .map_err(|_| AdapterError::Reentrant)?;
        if state.destroyed {
            return Err(AdapterError::Destroyed);
        }
        Ok(state)
    }

    pub fn ptr_eq(&self, other: &Replica) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub fn in_transaction(&self) -> bool {
        self.state().open.is_some()
    }

    // ── Transactions ─────────────────────────────────────────────────────

    /// Run `f` as one atomic change tagged with `origin`.
    ///
    /// A call made while another transaction is open joins it; the outer
    /// origin applies to the whole batch. If `f` fails, every write of the
    /// outermost transaction is rolled back and no event fires.
    pub fn transact<R, E, F>(&self, origin: Origin, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<R, E>,
        E: From<AdapterError>,
    {
        self.transact_with_mode(origin, Mode::Normal, f)
    }

    pub(crate) fn transact_with_mode<R, E, F>(
        &self,
        origin: Origin,
        mode: Mode,
        f: F,
    ) -> std::result::Result<R, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<R, E>,
        E: From<AdapterError>,
    {
        {
            let mut state = self.state_mut()?;
            if state.open.is_some() {
                drop(state);
                return f(&Txn::new(self));
            }
            let before = state.doc.get_heads();
            state.open = Some(OpenTxn::new(origin, mode, before));
        }

        match f(&Txn::new(self)) {
            Ok(value) => {
                self.finish()?;
                Ok(value)
            }
            Err(err) => {
                let mut state = self.state_mut()?;
                let discarded = state.doc.rollback();
                state.open = None;
                debug!("[replica] Rolled back transaction ({} ops)", discarded);
                Err(err)
            }
        }
    }

    fn finish(&self) -> Result<()> {
        let (batch, notices) = {
            let mut guard = self.state_mut()?;
            let state = &mut *guard;
            let Some(open) = state.open.take() else {
                return Ok(());
            };
            if state.doc.commit().is_none() {
                return Ok(());
            }
            let OpenTxn {
                origin,
                mode,
                before,
                log,
                created,
                redirects,
                cursor_redirects,
            } = open;
            state.redirects.extend(redirects);
            state.cursor_redirects.extend(
                cursor_redirects
                    .into_iter()
                    .map(|(from, to)| (from.to_bytes(), to)),
            );

            let after = state.doc.get_heads();
            let patches = state.doc.diff(&before, &after);
            let batch = ChangeBatch {
                origin,
                events: events::collect(&state.doc, &before, patches),
            };
            let log = log
                .into_iter()
                .filter(|op| !created.contains(op.target()))
                .collect();
            let notices = undo::capture(state, origin, mode, log);
            (batch, notices)
        };

        self.dispatch(&batch);
        undo::notify(notices);
        Ok(())
    }

    // ── Observers ────────────────────────────────────────────────────────

    /// Call `f` after every batch that changes `target` itself.
    pub fn observe(&self, target: &ObjId, f: impl Fn(&ChangeBatch) + 'static) -> Subscription {
        self.add_observer(target, false, Rc::new(f))
    }

    /// Call `f` after every batch that changes `target` or anything below it.
    pub fn observe_deep(
        &self,
        target: &ObjId,
        f: impl Fn(&ChangeBatch) + 'static,
    ) -> Subscription {
        self.add_observer(target, true, Rc::new(f))
    }

    fn add_observer(
        &self,
        target: &ObjId,
        deep: bool,
        callback: Rc<dyn Fn(&ChangeBatch)>,
    ) -> Subscription {
        let id = self.0.next_observer.get();
        self.0.next_observer.set(id + 1);
        let alive = Rc::new(Cell::new(true));
        self.0.observers.borrow_mut().push(Observer {
            id,
            target: target.clone(),
            deep,
            alive: alive.clone(),
            callback,
        });

        let shared: Weak<Shared> = Rc::downgrade(&self.0);
        Subscription::new(move || {
            alive.set(false);
            if let Some(shared) = shared.upgrade() {
                if let Ok(mut observers) = shared.observers.try_borrow_mut() {
                    observers.retain(|observer| observer.id != id);
                }
            }
        })
    }

    /// Shallow observers run before deep ones; each group in registration order.
    fn dispatch(&self, batch: &ChangeBatch) {
        if batch.events.is_empty() {
            return;
        }
        let mut observers: Vec<(ObjId, bool, Rc<Cell<bool>>, Rc<dyn Fn(&ChangeBatch)>)> = self
            .0
            .observers
            .borrow()
            .iter()
            .map(|o| (o.target.clone(), o.deep, o.alive.clone(), o.callback.clone()))
            .collect();
        observers.sort_by_key(|(_, deep, _, _)| *deep);

        for (target, deep, alive, callback) in observers {
            if !alive.get() {
                continue;
            }
            let events: Vec<_> = batch
                .events
                .iter()
                .filter(|event| {
                    if deep {
                        target == automerge::ROOT || event.is_within(&target)
                    } else {
                        event.target == target
                    }
                })
                .cloned()
                .collect();
            if events.is_empty() {
                continue;
            }
            callback(&ChangeBatch {
                origin: batch.origin,
                events,
            });
        }
    }

    // ── Persistence and replication ──────────────────────────────────────

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut state = self.state_mut()?;
        if state.open.is_some() {
            return Err(AdapterError::Reentrant);
        }
        Ok(state.doc.save())
    }

    /// Changes made since the previous `save` or `save_incremental`.
    pub fn save_incremental(&self) -> Result<Vec<u8>> {
        let mut state = self.state_mut()?;
        if state.open.is_some() {
            return Err(AdapterError::Reentrant);
        }
        Ok(state.doc.save_incremental())
    }

    /// Apply an update produced by `save` or `save_incremental` on another replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<usize> {
        self.apply_remote(|doc| Ok(doc.load_incremental(update)?))
    }

    /// Pull every change `other` has that this replica lacks.
    pub fn merge(&self, other: &Replica) -> Result<()> {
        if self.ptr_eq(other) {
            return Ok(());
        }
        let update = other.save()?;
        self.apply_update(&update)?;
        Ok(())
    }

    pub fn generate_sync_message(&self, peer: &mut sync::State) -> Result<Option<sync::Message>> {
        let mut state = self.state_mut()?;
        if state.open.is_some() {
            return Err(AdapterError::Reentrant);
        }
        let message = state.doc.sync().generate_sync_message(peer);
        Ok(message)
    }

    pub fn receive_sync_message(&self, peer: &mut sync::State, message: sync::Message) -> Result<()> {
        self.apply_remote(|doc| {
            doc.sync().receive_sync_message(peer, message)?;
            Ok(())
        })
    }

    fn apply_remote<R>(&self, f: impl FnOnce(&mut AutoCommit) -> Result<R>) -> Result<R> {
        let (result, batch) = {
            let mut guard = self.state_mut()?;
            let state = &mut *guard;
            if state.open.is_some() {
                warn!("[replica] Refusing remote update while a transaction is open");
                return Err(AdapterError::Reentrant);
            }
            let before = state.doc.get_heads();
            let result = f(&mut state.doc)?;
            let after = state.doc.get_heads();
            if before == after {
                return Ok(result);
            }
            let patches = state.doc.diff(&before, &after);
            let batch = ChangeBatch {
                origin: Origin::REMOTE,
                events: events::collect(&state.doc, &before, patches),
            };
            (result, batch)
        };
        debug!("[replica] Applied remote update ({} events)", batch.events.len());
        self.dispatch(&batch);
        Ok(result)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Read the current document, including writes of an open transaction.
    pub fn read<R>(&self, f: impl FnOnce(&AutoCommit) -> R) -> R {
        f(&self.state().doc)
    }

    pub fn heads(&self) -> Result<Vec<ChangeHash>> {
        let mut state = self.state_mut()?;
        if state.open.is_some() {
            return Err(AdapterError::Reentrant);
        }
        Ok(state.doc.get_heads())
    }

    pub fn actor(&self) -> ActorId {
        self.state().doc.get_actor().clone()
    }

    pub fn text(&self, obj: &ObjId) -> Result<String> {
        Ok(self.read(|doc| doc.text(obj))?)
    }

    pub fn length(&self, obj: &ObjId) -> usize {
        self.read(|doc| doc.length(obj))
    }

    pub fn keys(&self, obj: &ObjId) -> Vec<String> {
        self.read(|doc| doc.keys(obj).collect())
    }

    pub fn object_type(&self, obj: &ObjId) -> Result<ObjType> {
        Ok(self.read(|doc| doc.object_type(obj))?)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Drop observers and undo managers; later writes fail with `Destroyed`.
    ///
    /// Calling this more than once is a no-op.
    pub fn destroy(&self) {
        let Ok(mut state) = self.0.state.try_borrow_mut() else {
            warn!("[replica] Cannot destroy while a transaction is running");
            return;
        };
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        state.open = None;
        state.managers.clear();
        state.redirects.clear();
        state.cursor_redirects.clear();
        drop(state);

        let observers = std::mem::take(&mut *self.0.observers.borrow_mut());
        for observer in &observers {
            observer.alive.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeltaOp, KeyAction};
    use crate::value::child_id;

    fn replica_with_list() -> (Replica, ObjId) {
        let replica = Replica::with_schema(|txn| {
            txn.put_object(&automerge::ROOT, "cells", ObjType::List)?;
            Ok(())
        })
        .unwrap();
        let cells = replica
            .read(|doc| child_id(doc, automerge::ROOT, "cells", ObjType::List))
            .unwrap();
        (replica, cells)
    }

    #[test]
    fn test_transact_fires_one_batch_with_origin() {
        let (replica, cells) = replica_with_list();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _sub = replica.observe(&cells, move |batch| sink.borrow_mut().push(batch.clone()));

        let origin = Origin::unique();
        replica
            .transact(origin, |txn| {
                txn.insert(&cells, 0, "a")?;
                txn.insert(&cells, 1, "b")
            })
            .unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, origin);
        let delta = seen[0].list_delta(&cells).unwrap();
        assert!(matches!(delta.as_slice(), [DeltaOp::Insert(items)] if items.len() == 2));
    }

    #[test]
    fn test_failed_transaction_rolls_back_silently() {
        let (replica, cells) = replica_with_list();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let _sub = replica.observe_deep(&automerge::ROOT, move |_| counter.set(counter.get() + 1));

        let result: Result<()> = replica.transact(Origin::UNTRACKED, |txn| {
            txn.insert(&cells, 0, "a")?;
            Err(AdapterError::OutOfBounds { index: 9, len: 1 })
        });
        assert!(result.is_err());
        assert_eq!(replica.length(&cells), 0);
        assert_eq!(fired.get(), 0);
        assert!(!replica.in_transaction());
    }

    #[test]
    fn test_nested_transact_joins_outer() {
        let (replica, cells) = replica_with_list();
        let batches = Rc::new(Cell::new(0));
        let counter = batches.clone();
        let _sub = replica.observe(&cells, move |_| counter.set(counter.get() + 1));

        let outer = replica.clone();
        replica
            .transact(Origin::UNTRACKED, |txn| {
                txn.insert(&cells, 0, "a")?;
                outer.transact(Origin::unique(), |inner| inner.insert(&cells, 1, "b"))
            })
            .unwrap();

        assert_eq!(replica.length(&cells), 2);
        assert_eq!(batches.get(), 1);
    }

    #[test]
    fn test_shallow_observers_run_before_deep() {
        let (replica, cells) = replica_with_list();
        let order = Rc::new(RefCell::new(Vec::new()));
        let deep = order.clone();
        let _deep = replica.observe_deep(&automerge::ROOT, move |_| deep.borrow_mut().push("deep"));
        let shallow = order.clone();
        let _shallow = replica.observe(&cells, move |_| shallow.borrow_mut().push("shallow"));

        replica
            .transact(Origin::UNTRACKED, |txn| txn.insert(&cells, 0, "a"))
            .unwrap();
        assert_eq!(*order.borrow(), vec!["shallow", "deep"]);
    }

    #[test]
    fn test_empty_transaction_fires_nothing() {
        let (replica, _cells) = replica_with_list();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let _sub = replica.observe_deep(&automerge::ROOT, move |_| flag.set(true));

        replica
            .transact(Origin::UNTRACKED, |_txn| Ok::<_, AdapterError>(()))
            .unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_schema_replicas_merge_into_same_list() {
        let (a, cells_a) = replica_with_list();
        let (b, cells_b) = replica_with_list();
        assert_eq!(cells_a, cells_b);

        a.transact(Origin::UNTRACKED, |txn| txn.insert(&cells_a, 0, "from-a"))
            .unwrap();
        b.transact(Origin::UNTRACKED, |txn| txn.insert(&cells_b, 0, "from-b"))
            .unwrap();

        let remote = Rc::new(Cell::new(false));
        let flag = remote.clone();
        let _sub = a.observe(&cells_a, move |batch| flag.set(batch.is_remote()));

        a.merge(&b).unwrap();
        b.merge(&a).unwrap();
        assert!(remote.get());
        assert_eq!(a.length(&cells_a), 2);
        assert_eq!(a.heads().unwrap(), b.heads().unwrap());
        let items = |r: &Replica, list: &ObjId| {
            r.read(|doc| {
                (0..doc.length(list))
                    .filter_map(|i| crate::value::read_str(doc, list, i))
                    .collect::<Vec<_>>()
            })
        };
        assert_eq!(items(&a, &cells_a), items(&b, &cells_b));
    }

    #[test]
    fn test_sync_messages_converge() {
        let (a, cells) = replica_with_list();
        let b = Replica::load(&a.save().unwrap()).unwrap();
        a.transact(Origin::UNTRACKED, |txn| txn.insert(&cells, 0, "x"))
            .unwrap();

        let mut a_state = sync::State::new();
        let mut b_state = sync::State::new();
        for _ in 0..10 {
            if let Some(msg) = a.generate_sync_message(&mut a_state).unwrap() {
                b.receive_sync_message(&mut b_state, msg).unwrap();
            }
            if let Some(msg) = b.generate_sync_message(&mut b_state).unwrap() {
                a.receive_sync_message(&mut a_state, msg).unwrap();
            }
        }
        assert_eq!(b.length(&cells), 1);
        assert_eq!(a.heads().unwrap(), b.heads().unwrap());
    }

    #[test]
    fn test_map_observer_sees_key_changes() {
        let replica = Replica::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let _sub = replica.observe(&automerge::ROOT, move |batch| {
            *sink.borrow_mut() = batch.map_change(&automerge::ROOT).cloned();
        });

        replica
            .transact(Origin::UNTRACKED, |txn| txn.put(&automerge::ROOT, "name", "nb"))
            .unwrap();
        let keys = seen.borrow().clone().unwrap();
        assert_eq!(keys["name"].action, KeyAction::Add);
    }

    #[test]
    fn test_destroy_is_idempotent_and_blocks_writes() {
        let (replica, cells) = replica_with_list();
        replica.destroy();
        replica.destroy();
        let result = replica.transact(Origin::UNTRACKED, |txn| txn.insert(&cells, 0, "a"));
        assert!(matches!(result, Err(AdapterError::Destroyed)));
    }
}
