//! Transactions and the inverse log that undo managers are built from.
//!
//! Every mutation records how to revert itself at the moment it is made.
//! Positions inside lists and text are anchored with Automerge cursors so an
//! inverse still lands in the right place after concurrent remote edits:
//!
//! ```text
//! put / put_object / delete_key  → RestoreKey     (previous deep value)
//! insert / insert_object / splice → RemoveInserted (cursor per inserted element)
//! delete_range                    → ReinsertItems  (deleted values + their cursors + anchor)
//! splice_text (deleting)          → ReinsertText   (deleted text + its cursors + anchor)
//! ```
//!
//! Reinserted elements get fresh cursors. The old cursor of each one is
//! redirected to its replacement, so older `RemoveInserted` inverses still
//! find the element.

use std::collections::{HashMap, HashSet};

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ChangeHash, Cursor, ObjId, ObjType, ReadDoc, ScalarValue};
use log::debug;

use crate::error::{AdapterError, Result};
use crate::origin::Origin;
use crate::replica::{Replica, ReplicaState};
use crate::value::{capture_index, capture_key, is_reachable, Snapshot};

/// How a transaction feeds the undo managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Normal,
    Undo(usize),
    Redo(usize),
}

#[derive(Debug, Clone)]
pub(crate) enum InverseOp {
    RestoreKey {
        obj: ObjId,
        key: String,
        prev: Option<Snapshot>,
    },
    RemoveInserted {
        obj: ObjId,
        index: usize,
        cursors: Vec<Cursor>,
    },
    ReinsertItems {
        obj: ObjId,
        index: usize,
        anchor: Cursor,
        cursors: Vec<Cursor>,
        items: Vec<Snapshot>,
    },
    ReinsertText {
        obj: ObjId,
        index: usize,
        anchor: Cursor,
        cursors: Vec<Cursor>,
        text: String,
    },
}

impl InverseOp {
    pub(crate) fn target(&self) -> &ObjId {
        match self {
            InverseOp::RestoreKey { obj, .. }
            | InverseOp::RemoveInserted { obj, .. }
            | InverseOp::ReinsertItems { obj, .. }
            | InverseOp::ReinsertText { obj, .. } => obj,
        }
    }
}

/// State of the outermost open transaction.
pub(crate) struct OpenTxn {
    pub(crate) origin: Origin,
    pub(crate) mode: Mode,
    pub(crate) before: Vec<ChangeHash>,
    pub(crate) log: Vec<InverseOp>,
    pub(crate) created: HashSet<ObjId>,
    pub(crate) redirects: Vec<(ObjId, ObjId)>,
    pub(crate) cursor_redirects: Vec<(Cursor, Cursor)>,
}

impl OpenTxn {
    pub(crate) fn new(origin: Origin, mode: Mode, before: Vec<ChangeHash>) -> Self {
        Self {
            origin,
            mode,
            before,
            log: Vec::new(),
            created: HashSet::new(),
            redirects: Vec::new(),
            cursor_redirects: Vec::new(),
        }
    }
}

/// Write access to a replica for the duration of [`Replica::transact`].
///
/// Reads through the owning replica see the pending writes.
pub struct Txn<'r> {
    replica: &'r Replica,
}

impl<'r> Txn<'r> {
    pub(crate) fn new(replica: &'r Replica) -> Self {
        Self { replica }
    }

    pub fn replica(&self) -> &Replica {
        self.replica
    }

    pub fn origin(&self) -> Option<Origin> {
        self.replica
            .state()
            .open
            .as_ref()
            .map(|open| open.origin)
    }

    /// Read the document, including writes made so far in this transaction.
    pub fn read<R>(&self, f: impl FnOnce(&AutoCommit) -> R) -> R {
        self.replica.read(f)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Writer<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.replica.state_mut()?;
        let ReplicaState {
            doc,
            open,
            redirects,
            cursor_redirects,
            ..
        } = &mut *guard;
        let open = open.as_mut().ok_or(AdapterError::Reentrant)?;
        let mut writer = Writer {
            doc,
            open,
            redirects,
            cursor_redirects,
        };
        f(&mut writer)
    }

    pub fn put<V: Into<ScalarValue>>(&self, obj: &ObjId, key: &str, value: V) -> Result<()> {
        let value = value.into();
        self.write(|w| w.put(obj, key, value))
    }

    pub fn put_object(&self, obj: &ObjId, key: &str, ty: ObjType) -> Result<ObjId> {
        self.write(|w| w.put_object(obj, key, ty))
    }

    /// Remove `key`; returns whether it was present.
    pub fn delete_key(&self, obj: &ObjId, key: &str) -> Result<bool> {
        self.write(|w| w.delete_key(obj, key))
    }

    pub fn insert<V: Into<ScalarValue>>(&self, list: &ObjId, index: usize, value: V) -> Result<()> {
        let value = value.into();
        self.write(|w| w.insert(list, index, value))
    }

    pub fn insert_object(&self, list: &ObjId, index: usize, ty: ObjType) -> Result<ObjId> {
        self.write(|w| w.insert_object(list, index, ty))
    }

    pub fn delete_range(&self, list: &ObjId, start: usize, len: usize) -> Result<()> {
        self.write(|w| w.delete_range(list, start, len))
    }

    /// Delete `del` characters at `pos` and insert `text` there.
    pub fn splice_text(&self, text_obj: &ObjId, pos: usize, del: usize, text: &str) -> Result<()> {
        self.write(|w| w.splice_text(text_obj, pos, del, text))
    }

    /// Replace the whole content of a text object with the smallest single splice.
    pub fn update_text(&self, text_obj: &ObjId, text: &str) -> Result<()> {
        self.write(|w| w.update_text(text_obj, text))
    }

    /// Write a deep copy of `snapshot` at `key`.
    pub fn put_snapshot(&self, obj: &ObjId, key: &str, snapshot: &Snapshot) -> Result<()> {
        self.write(|w| {
            let prev = capture_key(&*w.doc, obj, key)?;
            w.write_at_key(obj, key, snapshot)?;
            w.record(InverseOp::RestoreKey {
                obj: obj.clone(),
                key: key.to_string(),
                prev,
            });
            Ok(())
        })
    }

    /// Insert a deep copy of `snapshot` at `index`.
    pub fn insert_snapshot(&self, list: &ObjId, index: usize, snapshot: &Snapshot) -> Result<()> {
        self.write(|w| {
            w.check_index(list, index, 0)?;
            w.write_at_index(list, index, snapshot)?;
            let cursors = w.cursors(list, index, 1)?;
            w.record(InverseOp::RemoveInserted {
                obj: list.clone(),
                index,
                cursors,
            });
            Ok(())
        })
    }

    pub(crate) fn apply_inverse(&self, ops: &[InverseOp]) -> Result<bool> {
        self.write(|w| {
            let mut changed = false;
            for op in ops.iter().rev() {
                changed |= w.apply(op)?;
            }
            Ok(changed)
        })
    }
}

pub(crate) struct Writer<'a> {
    doc: &'a mut AutoCommit,
    open: &'a mut OpenTxn,
    redirects: &'a HashMap<ObjId, ObjId>,
    cursor_redirects: &'a HashMap<Vec<u8>, Cursor>,
}

impl Writer<'_> {
    fn record(&mut self, op: InverseOp) {
        self.open.log.push(op);
    }

    fn put(&mut self, obj: &ObjId, key: &str, value: ScalarValue) -> Result<()> {
        let prev = capture_key(&*self.doc, obj, key)?;
        self.doc.put(obj, key, value)?;
        self.record(InverseOp::RestoreKey {
            obj: obj.clone(),
            key: key.to_string(),
            prev,
        });
        Ok(())
    }

    fn put_object(&mut self, obj: &ObjId, key: &str, ty: ObjType) -> Result<ObjId> {
        let prev = capture_key(&*self.doc, obj, key)?;
        let id = self.doc.put_object(obj, key, ty)?;
        self.open.created.insert(id.clone());
        self.record(InverseOp::RestoreKey {
            obj: obj.clone(),
            key: key.to_string(),
            prev,
        });
        Ok(id)
    }

    fn delete_key(&mut self, obj: &ObjId, key: &str) -> Result<bool> {
        let Some(prev) = capture_key(&*self.doc, obj, key)? else {
            return Ok(false);
        };
        self.doc.delete(obj, key)?;
        self.record(InverseOp::RestoreKey {
            obj: obj.clone(),
            key: key.to_string(),
            prev: Some(prev),
        });
        Ok(true)
    }

    fn check_index(&self, obj: &ObjId, index: usize, len: usize) -> Result<()> {
        let length = self.doc.length(obj);
        if index + len > length {
            return Err(AdapterError::OutOfBounds {
                index: index + len,
                len: length,
            });
        }
        Ok(())
    }

    fn cursors(&self, obj: &ObjId, start: usize, len: usize) -> Result<Vec<Cursor>> {
        (start..start + len)
            .map(|index| self.doc.get_cursor(obj, index, None).map_err(AdapterError::from))
            .collect()
    }

    /// Cursor of the element at `index`, or the end of the sequence.
    fn anchor(&self, obj: &ObjId, index: usize) -> Result<Cursor> {
        if index >= self.doc.length(obj) {
            return Ok(Cursor::End);
        }
        Ok(self.doc.get_cursor(obj, index, None)?)
    }

    fn insert(&mut self, list: &ObjId, index: usize, value: ScalarValue) -> Result<()> {
        self.check_index(list, index, 0)?;
        self.doc.insert(list, index, value)?;
        let cursors = self.cursors(list, index, 1)?;
        self.record(InverseOp::RemoveInserted {
            obj: list.clone(),
            index,
            cursors,
        });
        Ok(())
    }

    fn insert_object(&mut self, list: &ObjId, index: usize, ty: ObjType) -> Result<ObjId> {
        self.check_index(list, index, 0)?;
        let id = self.doc.insert_object(list, index, ty)?;
        self.open.created.insert(id.clone());
        let cursors = self.cursors(list, index, 1)?;
        self.record(InverseOp::RemoveInserted {
            obj: list.clone(),
            index,
            cursors,
        });
        Ok(id)
    }

    fn delete_range(&mut self, list: &ObjId, start: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_index(list, start, len)?;
        let mut items = Vec::with_capacity(len);
        let mut cursors = Vec::with_capacity(len);
        for index in start..start + len {
            if let Some(item) = capture_index(&*self.doc, list, index)? {
                items.push(item);
                cursors.push(self.doc.get_cursor(list, index, None)?);
            }
        }
        let anchor = self.anchor(list, start + len)?;
        self.doc
            .splice(list, start, len as isize, Vec::<ScalarValue>::new())?;
        self.record(InverseOp::ReinsertItems {
            obj: list.clone(),
            index: start,
            anchor,
            cursors,
            items,
        });
        Ok(())
    }

    fn splice_text(&mut self, obj: &ObjId, pos: usize, del: usize, text: &str) -> Result<()> {
        self.check_index(obj, pos, del)?;
        let inserted = text.chars().count();
        if del == 0 && inserted == 0 {
            return Ok(());
        }
        let deleted: String = self.doc.text(obj)?.chars().skip(pos).take(del).collect();
        let deleted_cursors = self.cursors(obj, pos, del)?;
        let anchor = self.anchor(obj, pos + del)?;
        self.doc.splice_text(obj, pos, del as isize, text)?;
        if del > 0 {
            self.record(InverseOp::ReinsertText {
                obj: obj.clone(),
                index: pos,
                anchor,
                cursors: deleted_cursors,
                text: deleted,
            });
        }
        if inserted > 0 {
            let cursors = self.cursors(obj, pos, inserted)?;
            self.record(InverseOp::RemoveInserted {
                obj: obj.clone(),
                index: pos,
                cursors,
            });
        }
        Ok(())
    }

    fn update_text(&mut self, obj: &ObjId, text: &str) -> Result<()> {
        let current: Vec<char> = self.doc.text(obj)?.chars().collect();
        let next: Vec<char> = text.chars().collect();
        let prefix = current
            .iter()
            .zip(&next)
            .take_while(|(a, b)| a == b)
            .count();
        let room = current.len().min(next.len()) - prefix;
        let suffix = current
            .iter()
            .rev()
            .zip(next.iter().rev())
            .take(room)
            .take_while(|(a, b)| a == b)
            .count();
        let del = current.len() - prefix - suffix;
        let insert: String = next[prefix..next.len() - suffix].iter().collect();
        self.splice_text(obj, prefix, del, &insert)
    }

    // ── Snapshot writes (not logged; the caller records one inverse) ─────
    //
    // Objects recreated by undo or redo are redirected from the id they replace.

    fn materialize(&mut self, id: &ObjId, snapshot: &Snapshot) -> Result<()> {
        self.open.created.insert(id.clone());
        if self.open.mode != Mode::Normal {
            if let Some(origin) = snapshot.origin() {
                self.open.redirects.push((origin.clone(), id.clone()));
            }
        }
        match snapshot {
            Snapshot::Scalar(_) => {}
            Snapshot::Text { content, .. } => {
                self.doc.splice_text(id, 0, 0, content)?;
            }
            Snapshot::List { items, .. } => {
                for (index, item) in items.iter().enumerate() {
                    self.write_at_index(id, index, item)?;
                }
            }
            Snapshot::Map { entries, .. } => {
                for (key, value) in entries {
                    self.write_at_key(id, key, value)?;
                }
            }
        }
        Ok(())
    }

    fn write_at_key(&mut self, obj: &ObjId, key: &str, snapshot: &Snapshot) -> Result<()> {
        match (snapshot, snapshot.obj_type()) {
            (Snapshot::Scalar(value), _) => self.doc.put(obj, key, value.clone())?,
            (_, Some(ty)) => {
                let id = self.doc.put_object(obj, key, ty)?;
                self.materialize(&id, snapshot)?;
            }
            (_, None) => {}
        }
        Ok(())
    }

    fn write_at_index(&mut self, list: &ObjId, index: usize, snapshot: &Snapshot) -> Result<()> {
        match (snapshot, snapshot.obj_type()) {
            (Snapshot::Scalar(value), _) => self.doc.insert(list, index, value.clone())?,
            (_, Some(ty)) => {
                let id = self.doc.insert_object(list, index, ty)?;
                self.materialize(&id, snapshot)?;
            }
            (_, None) => {}
        }
        Ok(())
    }

    // ── Applying inverses ────────────────────────────────────────────────

    /// Follow recreated objects to their current incarnation.
    fn resolve(&self, obj: &ObjId) -> (ObjId, bool) {
        let mut current = obj.clone();
        let mut moved = false;
        for _ in 0..=(self.redirects.len() + self.open.redirects.len()) {
            let next = self
                .open
                .redirects
                .iter()
                .rev()
                .find(|(from, _)| *from == current)
                .map(|(_, to)| to.clone())
                .or_else(|| self.redirects.get(&current).cloned());
            match next {
                Some(next) => {
                    current = next;
                    moved = true;
                }
                None => break,
            }
        }
        (current, moved)
    }

    /// Position of the element a cursor was taken from, if it is visible.
    fn visible_position(&self, obj: &ObjId, cursor: &Cursor) -> Option<usize> {
        let pos = self.doc.get_cursor_position(obj, cursor, None).ok()?;
        if pos >= self.doc.length(obj) {
            return None;
        }
        match self.doc.get_cursor(obj, pos, None) {
            Ok(found) if found == *cursor => Some(pos),
            _ => None,
        }
    }

    /// Where a cursor's element lives now, following elements recreated by undo.
    fn live_position(&self, obj: &ObjId, cursor: &Cursor) -> Option<usize> {
        let mut current = cursor.clone();
        for _ in 0..=(self.cursor_redirects.len() + self.open.cursor_redirects.len()) {
            if let Some(pos) = self.visible_position(obj, &current) {
                return Some(pos);
            }
            current = self
                .open
                .cursor_redirects
                .iter()
                .rev()
                .find(|(from, _)| *from == current)
                .map(|(_, to)| to.clone())
                .or_else(|| self.cursor_redirects.get(&current.to_bytes()).cloned())?;
        }
        None
    }

    fn reinsert_position(&self, obj: &ObjId, anchor: &Cursor, index: usize, moved: bool) -> usize {
        let length = self.doc.length(obj);
        if moved {
            return index.min(length);
        }
        self.live_position(obj, anchor)
            .or_else(|| self.doc.get_cursor_position(obj, anchor, None).ok())
            .unwrap_or(index)
            .min(length)
    }

    /// Point the cursors of removed elements at the elements that replace them.
    fn redirect_cursors(&mut self, obj: &ObjId, old: &[Cursor], pos: usize) -> Result<()> {
        let fresh = self.cursors(obj, pos, old.len())?;
        self.open
            .cursor_redirects
            .extend(old.iter().cloned().zip(fresh));
        Ok(())
    }

    fn apply(&mut self, op: &InverseOp) -> Result<bool> {
        let (target, moved) = self.resolve(op.target());
        if !is_reachable(&*self.doc, &target) {
            debug!("[undo] Skipping inverse for unreachable object {}", target);
            return Ok(false);
        }

        match op {
            InverseOp::RestoreKey { key, prev, .. } => {
                let current = capture_key(&*self.doc, &target, key)?;
                let unchanged = match (&current, prev) {
                    (None, None) => true,
                    (Some(Snapshot::Scalar(a)), Some(Snapshot::Scalar(b))) => a == b,
                    _ => false,
                };
                if unchanged {
                    return Ok(false);
                }
                match prev {
                    Some(snapshot) => self.write_at_key(&target, key, snapshot)?,
                    None => self.doc.delete(&target, key.as_str())?,
                }
                self.record(InverseOp::RestoreKey {
                    obj: target,
                    key: key.clone(),
                    prev: current,
                });
                Ok(true)
            }
            InverseOp::RemoveInserted { index, cursors, .. } => {
                let length = self.doc.length(&target);
                let mut positions: Vec<usize> = if moved {
                    (*index..index + cursors.len())
                        .filter(|pos| *pos < length)
                        .collect()
                } else {
                    cursors
                        .iter()
                        .filter_map(|cursor| self.live_position(&target, cursor))
                        .collect()
                };
                positions.sort_unstable();
                positions.dedup();
                if positions.is_empty() {
                    return Ok(false);
                }

                let is_text = self.doc.object_type(&target)? == ObjType::Text;
                for (start, len) in runs(&positions).into_iter().rev() {
                    if is_text {
                        self.splice_text(&target, start, len, "")?;
                    } else {
                        self.delete_range(&target, start, len)?;
                    }
                }
                Ok(true)
            }
            InverseOp::ReinsertItems {
                index,
                anchor,
                cursors: removed,
                items,
                ..
            } => {
                if items.is_empty() {
                    return Ok(false);
                }
                let pos = self.reinsert_position(&target, anchor, *index, moved);
                for (offset, item) in items.iter().enumerate() {
                    self.write_at_index(&target, pos + offset, item)?;
                }
                self.redirect_cursors(&target, removed, pos)?;
                let cursors = self.cursors(&target, pos, items.len())?;
                self.record(InverseOp::RemoveInserted {
                    obj: target,
                    index: pos,
                    cursors,
                });
                Ok(true)
            }
            InverseOp::ReinsertText {
                index,
                anchor,
                cursors: removed,
                text,
                ..
            } => {
                if text.is_empty() {
                    return Ok(false);
                }
                let pos = self.reinsert_position(&target, anchor, *index, moved);
                self.splice_text(&target, pos, 0, text)?;
                if removed.len() == text.chars().count() {
                    self.redirect_cursors(&target, removed, pos)?;
                }
                Ok(true)
            }
        }
    }
}

/// Group sorted, distinct positions into (start, len) runs.
fn runs(positions: &[usize]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &pos in positions {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == pos => *len += 1,
            _ => runs.push((pos, 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runs_groups_contiguous_positions() {
        assert_eq!(runs(&[0, 1, 2, 5, 7, 8]), vec![(0, 3), (5, 1), (7, 2)]);
        assert!(runs(&[]).is_empty());
    }

    #[test]
    fn test_update_text_uses_minimal_splice() {
        let replica = Replica::with_schema(|txn| {
            txn.put_object(&automerge::ROOT, "source", ObjType::Text)?;
            Ok(())
        })
        .unwrap();
        let text = replica
            .read(|doc| crate::value::child_id(doc, automerge::ROOT, "source", ObjType::Text))
            .unwrap();

        replica
            .transact(Origin::UNTRACKED, |txn| txn.update_text(&text, "x = 1\ny = 2"))
            .unwrap();
        replica
            .transact(Origin::UNTRACKED, |txn| txn.update_text(&text, "x = 1\ny = 3"))
            .unwrap();

        assert_eq!(replica.text(&text).unwrap(), "x = 1\ny = 3");
    }

    #[test]
    fn test_snapshot_copies_nested_map() {
        let replica = Replica::with_schema(|txn| {
            let cells = txn.put_object(&automerge::ROOT, "cells", ObjType::List)?;
            let cell = txn.insert_object(&cells, 0, ObjType::Map)?;
            txn.put(&cell, "id", "c1")?;
            let source = txn.put_object(&cell, "source", ObjType::Text)?;
            txn.splice_text(&source, 0, 0, "1 + 1")
        })
        .unwrap();
        let cells = replica
            .read(|doc| crate::value::child_id(doc, automerge::ROOT, "cells", ObjType::List))
            .unwrap();
        let snapshot = replica
            .read(|doc| capture_index(doc, &cells, 0))
            .unwrap()
            .unwrap();

        replica
            .transact(Origin::UNTRACKED, |txn| txn.insert_snapshot(&cells, 1, &snapshot))
            .unwrap();

        let copy = replica.read(|doc| crate::value::child_id(doc, &cells, 1, ObjType::Map)).unwrap();
        let original = replica.read(|doc| crate::value::child_id(doc, &cells, 0, ObjType::Map)).unwrap();
        assert_ne!(copy, original);
        let source = replica
            .read(|doc| crate::value::child_id(doc, &copy, "source", ObjType::Text))
            .unwrap();
        assert_eq!(replica.text(&source).unwrap(), "1 + 1");
    }

    #[test]
    fn test_out_of_bounds_insert_is_rejected() {
        let replica = Replica::with_schema(|txn| {
            txn.put_object(&automerge::ROOT, "cells", ObjType::List)?;
            Ok(())
        })
        .unwrap();
        let cells = replica
            .read(|doc| crate::value::child_id(doc, automerge::ROOT, "cells", ObjType::List))
            .unwrap();

        let result = replica.transact(Origin::UNTRACKED, |txn| txn.insert(&cells, 3, "x"));
        assert!(matches!(result, Err(AdapterError::OutOfBounds { .. })));
        assert_eq!(replica.length(&cells), 0);
    }
}
