//! Scoped undo/redo over a replica.
//!
//! A manager captures committed local transactions whose origin it tracks,
//! keeping only inverses that touch objects inside its scope. Each capture
//! becomes one stack item unless it lands within `capture_timeout` of the
//! previous one. Undoing replays an item's inverses in reverse inside a
//! transaction tagged with the manager's own origin; that transaction's
//! inverses become the matching redo item.
//!
//! Remote batches are never captured. Inverses are anchored with cursors, so
//! undo only reverts this replica's own edits and leaves concurrent remote
//! edits in place.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use automerge::ObjId;
use log::debug;

use crate::error::{AdapterError, Result};
use crate::origin::Origin;
use crate::replica::{Replica, ReplicaState};
use crate::subscription::{Emitter, Subscription};
use crate::txn::{InverseOp, Mode};
use crate::value::is_within;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Undo,
    Redo,
}

/// Notifications about an undo manager's stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    ItemAdded(StackKind),
    /// The newest undo item absorbed a capture within the capture window.
    ItemUpdated,
    ItemPopped(StackKind),
    Cleared { undo: bool, redo: bool },
}

#[derive(Debug, Clone, Default)]
pub struct UndoOptions {
    /// Captures closer together than this merge into one item. Zero disables merging.
    pub capture_timeout: Duration,
}

#[derive(Debug, Clone)]
struct StackItem {
    ops: Vec<InverseOp>,
}

pub(crate) struct ManagerState {
    scope: Vec<ObjId>,
    tracked: HashSet<Origin>,
    undo: Vec<StackItem>,
    redo: Vec<StackItem>,
    capture_timeout: Duration,
    last_capture: Option<Instant>,
    origin: Origin,
    events: Emitter<StackEvent>,
}

pub(crate) struct Notice {
    events: Emitter<StackEvent>,
    event: StackEvent,
}

/// Route the inverses of a committed local transaction to the managers that want them.
pub(crate) fn capture(
    state: &mut ReplicaState,
    origin: Origin,
    mode: Mode,
    log: Vec<InverseOp>,
) -> Vec<Notice> {
    let mut notices = Vec::new();
    if log.is_empty() {
        return notices;
    }
    let ReplicaState { doc, managers, .. } = state;

    match mode {
        Mode::Normal => {
            for manager in managers.iter_mut().flatten() {
                if !manager.tracked.contains(&origin) || manager.scope.is_empty() {
                    continue;
                }
                let ops: Vec<InverseOp> = log
                    .iter()
                    .filter(|op| is_within(&*doc, op.target(), &manager.scope))
                    .cloned()
                    .collect();
                if ops.is_empty() {
                    continue;
                }

                let now = Instant::now();
                let within_window = manager
                    .last_capture
                    .is_some_and(|last| now.duration_since(last) < manager.capture_timeout);
                manager.last_capture = Some(now);
                manager.redo.clear();

                match manager.undo.last_mut() {
                    Some(item) if within_window => {
                        item.ops.extend(ops);
                        notices.push(Notice {
                            events: manager.events.clone(),
                            event: StackEvent::ItemUpdated,
                        });
                    }
                    _ => {
                        manager.undo.push(StackItem { ops });
                        notices.push(Notice {
                            events: manager.events.clone(),
                            event: StackEvent::ItemAdded(StackKind::Undo),
                        });
                    }
                }
            }
        }
        Mode::Undo(id) | Mode::Redo(id) => {
            let Some(Some(manager)) = managers.get_mut(id) else {
                return notices;
            };
            let kind = if matches!(mode, Mode::Undo(_)) {
                manager.redo.push(StackItem { ops: log });
                StackKind::Redo
            } else {
                manager.undo.push(StackItem { ops: log });
                StackKind::Undo
            };
            notices.push(Notice {
                events: manager.events.clone(),
                event: StackEvent::ItemAdded(kind),
            });
        }
    }
    notices
}

pub(crate) fn notify(notices: Vec<Notice>) {
    for notice in notices {
        notice.events.emit(&notice.event);
    }
}

/// Handle to an undo manager registered on a replica.
///
/// Dropping the handle destroys the manager.
pub struct UndoManager {
    replica: Replica,
    id: usize,
}

impl std::fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoManager").field("id", &self.id).finish()
    }
}

impl UndoManager {
    /// A manager over `scope` that captures transactions tagged with `tracked`.
    pub fn new(replica: &Replica, scope: &[ObjId], tracked: &[Origin]) -> Result<Self> {
        Self::with_options(replica, scope, tracked, UndoOptions::default())
    }

    pub fn with_options(
        replica: &Replica,
        scope: &[ObjId],
        tracked: &[Origin],
        options: UndoOptions,
    ) -> Result<Self> {
        let id = {
            let mut state = replica.state_mut()?;
            state.managers.push(Some(ManagerState {
                scope: Vec::new(),
                tracked: tracked.iter().copied().collect(),
                undo: Vec::new(),
                redo: Vec::new(),
                capture_timeout: options.capture_timeout,
                last_capture: None,
                origin: Origin::unique(),
                events: Emitter::new(),
            }));
            state.managers.len() - 1
        };
        let manager = UndoManager {
            replica: replica.clone(),
            id,
        };
        for obj in scope {
            manager.add_to_scope(obj)?;
        }
        Ok(manager)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> Result<R> {
        let mut state = self.replica.state_mut()?;
        match state.managers.get_mut(self.id) {
            Some(Some(manager)) => Ok(f(manager)),
            _ => Err(AdapterError::ManagerDestroyed),
        }
    }

    fn peek<R>(&self, f: impl FnOnce(&ManagerState) -> R) -> Option<R> {
        let state = self.replica.state();
        match state.managers.get(self.id) {
            Some(Some(manager)) => Some(f(manager)),
            _ => None,
        }
    }

    /// The origin tagged on this manager's own undo and redo transactions.
    pub fn origin(&self) -> Option<Origin> {
        self.peek(|m| m.origin)
    }

    /// Extend the scope with `obj` and everything below it.
    pub fn add_to_scope(&self, obj: &ObjId) -> Result<()> {
        let mut state = self.replica.state_mut()?;
        let owned_elsewhere = state
            .managers
            .iter()
            .enumerate()
            .any(|(id, m)| id != self.id && m.as_ref().is_some_and(|m| m.scope.contains(obj)));
        if owned_elsewhere {
            return Err(AdapterError::AlreadyTracked(obj.clone()));
        }
        match state.managers.get_mut(self.id) {
            Some(Some(manager)) => {
                if !manager.scope.contains(obj) {
                    manager.scope.push(obj.clone());
                }
                Ok(())
            }
            _ => Err(AdapterError::ManagerDestroyed),
        }
    }

    pub fn add_tracked_origin(&self, origin: Origin) -> Result<()> {
        self.with_state(|m| {
            m.tracked.insert(origin);
        })
    }

    pub fn can_undo(&self) -> bool {
        self.peek(|m| !m.undo.is_empty()).unwrap_or(false)
    }

    pub fn can_redo(&self) -> bool {
        self.peek(|m| !m.redo.is_empty()).unwrap_or(false)
    }

    pub fn undo_depth(&self) -> usize {
        self.peek(|m| m.undo.len()).unwrap_or(0)
    }

    pub fn redo_depth(&self) -> usize {
        self.peek(|m| m.redo.len()).unwrap_or(0)
    }

    /// Revert the newest undo item. Returns whether anything changed.
    pub fn undo(&self) -> Result<bool> {
        self.pop_and_apply(StackKind::Undo)
    }

    /// Reapply the newest redo item. Returns whether anything changed.
    pub fn redo(&self) -> Result<bool> {
        self.pop_and_apply(StackKind::Redo)
    }

    fn pop_and_apply(&self, kind: StackKind) -> Result<bool> {
        loop {
            let (item, origin, events) = {
                let mut state = self.replica.state_mut()?;
                if state.open.is_some() {
                    return Err(AdapterError::Reentrant);
                }
                let Some(Some(manager)) = state.managers.get_mut(self.id) else {
                    return Err(AdapterError::ManagerDestroyed);
                };
                let stack = match kind {
                    StackKind::Undo => &mut manager.undo,
                    StackKind::Redo => &mut manager.redo,
                };
                let Some(item) = stack.pop() else {
                    return Ok(false);
                };
                manager.last_capture = None;
                (item, manager.origin, manager.events.clone())
            };

            let mode = match kind {
                StackKind::Undo => Mode::Undo(self.id),
                StackKind::Redo => Mode::Redo(self.id),
            };
            let applied = self
                .replica
                .transact_with_mode(origin, mode, |txn| txn.apply_inverse(&item.ops));

            match applied {
                Ok(changed) => {
                    events.emit(&StackEvent::ItemPopped(kind));
                    if changed {
                        return Ok(true);
                    }
                    debug!("[undo] Dropped stale {:?} item with nothing left to revert", kind);
                }
                Err(err) => {
                    self.with_state(|m| match kind {
                        StackKind::Undo => m.undo.push(item),
                        StackKind::Redo => m.redo.push(item),
                    })?;
                    return Err(err);
                }
            }
        }
    }

    /// Empty both stacks.
    pub fn clear(&self) -> Result<()> {
        let (cleared, events) = self.with_state(|m| {
            let cleared = StackEvent::Cleared {
                undo: !m.undo.is_empty(),
                redo: !m.redo.is_empty(),
            };
            m.undo.clear();
            m.redo.clear();
            m.last_capture = None;
            (cleared, m.events.clone())
        })?;
        if cleared != (StackEvent::Cleared { undo: false, redo: false }) {
            events.emit(&cleared);
        }
        Ok(())
    }

    /// Start a new stack item with the next capture, even inside the capture window.
    pub fn stop_capturing(&self) -> Result<()> {
        self.with_state(|m| m.last_capture = None)
    }

    pub fn set_capture_timeout(&self, timeout: Duration) -> Result<()> {
        self.with_state(|m| m.capture_timeout = timeout)
    }

    pub fn on_stack_event(&self, f: impl Fn(&StackEvent) + 'static) -> Result<Subscription> {
        let events = self.with_state(|m| m.events.clone())?;
        Ok(events.subscribe(f))
    }

    /// Unregister from the replica. Later calls fail with `ManagerDestroyed`.
    pub fn destroy(&self) {
        if let Ok(mut state) = self.replica.state_mut() {
            if let Some(slot) = state.managers.get_mut(self.id) {
                if let Some(manager) = slot.take() {
                    manager.events.clear();
                }
            }
        }
    }
}

impl Drop for UndoManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
