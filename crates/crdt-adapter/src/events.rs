//! Change batches delivered to observers after each transaction or merge.
//!
//! Automerge reports a committed range as per-object patches; they are folded
//! here into one event per touched object:
//!
//! ```text
//! Map  → keys changed, each with action (add/update/delete) and old/new entry
//! List → delta of retain / insert(entries) / delete runs
//! Text → delta of retain / insert(string) / delete runs
//! ```
//!
//! Objects created inside the batch are reported only through the insert or
//! put that introduced them, never as events of their own.

use std::collections::{BTreeMap, HashMap, HashSet};

use automerge::{AutoCommit, ChangeHash, ObjId, ObjType, Patch, PatchAction, Prop, ReadDoc, Value};

use crate::origin::Origin;
use crate::value::Entry;

/// One step of a sequence delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp<T> {
    Retain(usize),
    Insert(T),
    Delete(usize),
}

pub type Delta<T> = Vec<DeltaOp<T>>;

/// Payloads that can be concatenated when adjacent inserts are merged.
pub trait Extend {
    fn extend_with(&mut self, other: Self);
    fn is_empty_value(&self) -> bool;
}

impl Extend for String {
    fn extend_with(&mut self, other: Self) {
        self.push_str(&other);
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Extend for Vec<T> {
    fn extend_with(&mut self, other: Self) {
        self.extend(other);
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

/// Append `op` to `delta`, dropping empty steps and merging with a preceding step of the same kind.
pub fn push_op<T: Extend>(delta: &mut Delta<T>, op: DeltaOp<T>) {
    match op {
        DeltaOp::Retain(0) | DeltaOp::Delete(0) => {}
        DeltaOp::Insert(ref value) if value.is_empty_value() => {}
        DeltaOp::Retain(n) => match delta.last_mut() {
            Some(DeltaOp::Retain(prev)) => *prev += n,
            _ => delta.push(DeltaOp::Retain(n)),
        },
        DeltaOp::Delete(n) => match delta.last_mut() {
            Some(DeltaOp::Delete(prev)) => *prev += n,
            _ => delta.push(DeltaOp::Delete(n)),
        },
        DeltaOp::Insert(value) => match delta.last_mut() {
            Some(DeltaOp::Insert(prev)) => prev.extend_with(value),
            _ => delta.push(DeltaOp::Insert(value)),
        },
    }
}

/// What happened to one key of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    pub action: KeyAction,
    pub old: Option<Entry>,
    pub new: Option<Entry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjChange {
    Map(BTreeMap<String, KeyChange>),
    List(Delta<Vec<Entry>>),
    Text(Delta<String>),
}

/// Changes to a single object within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjEvent {
    pub target: ObjId,
    /// Path from the root to `target`, as (container, property) pairs.
    pub path: Vec<(ObjId, Prop)>,
    pub change: ObjChange,
}

/// Everything one transaction (or one replication step) changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub origin: Origin,
    pub events: Vec<ObjEvent>,
}

impl ChangeBatch {
    pub fn is_remote(&self) -> bool {
        self.origin.is_remote()
    }

    pub fn event_for(&self, target: &ObjId) -> Option<&ObjEvent> {
        self.events.iter().find(|event| event.target == *target)
    }

    pub fn map_change(&self, target: &ObjId) -> Option<&BTreeMap<String, KeyChange>> {
        match self.event_for(target).map(|event| &event.change) {
            Some(ObjChange::Map(keys)) => Some(keys),
            _ => None,
        }
    }

    pub fn list_delta(&self, target: &ObjId) -> Option<&Delta<Vec<Entry>>> {
        match self.event_for(target).map(|event| &event.change) {
            Some(ObjChange::List(delta)) => Some(delta),
            _ => None,
        }
    }

    pub fn text_delta(&self, target: &ObjId) -> Option<&Delta<String>> {
        match self.event_for(target).map(|event| &event.change) {
            Some(ObjChange::Text(delta)) => Some(delta),
            _ => None,
        }
    }
}

impl ObjEvent {
    /// Whether this event targets `obj` or one of its descendants.
    pub fn is_within(&self, obj: &ObjId) -> bool {
        self.target == *obj || self.path.iter().any(|(ancestor, _)| ancestor == obj)
    }
}

struct Pending {
    event: ObjEvent,
    /// Position in the post-change sequence that the delta has reached.
    cursor: usize,
}

/// Fold the patches of one committed range into per-object events.
pub(crate) fn collect(doc: &AutoCommit, before: &[ChangeHash], patches: Vec<Patch>) -> Vec<ObjEvent> {
    let created: HashSet<ObjId> = patches.iter().flat_map(created_objects).collect();

    let mut pending: Vec<Pending> = Vec::new();
    let mut by_target: HashMap<ObjId, usize> = HashMap::new();

    for patch in patches {
        if created.contains(&patch.obj)
            || patch.path.iter().any(|(ancestor, _)| created.contains(ancestor))
        {
            continue;
        }

        let slot = match by_target.get(&patch.obj) {
            Some(slot) => *slot,
            None => {
                let change = match doc.object_type(&patch.obj) {
                    Ok(ObjType::Map | ObjType::Table) => ObjChange::Map(BTreeMap::new()),
                    Ok(ObjType::List) => ObjChange::List(Vec::new()),
                    Ok(ObjType::Text) => ObjChange::Text(Vec::new()),
                    Err(_) => continue,
                };
                pending.push(Pending {
                    event: ObjEvent {
                        target: patch.obj.clone(),
                        path: patch.path.clone(),
                        change,
                    },
                    cursor: 0,
                });
                by_target.insert(patch.obj.clone(), pending.len() - 1);
                pending.len() - 1
            }
        };

        let entry = &mut pending[slot];
        match &mut entry.event.change {
            ObjChange::Map(keys) => apply_map_patch(doc, before, &patch.obj, keys, patch.action),
            ObjChange::List(delta) => apply_list_patch(delta, &mut entry.cursor, patch.action),
            ObjChange::Text(delta) => apply_text_patch(delta, &mut entry.cursor, patch.action),
        }
    }

    pending
        .into_iter()
        .map(|pending| pending.event)
        .filter(|event| match &event.change {
            ObjChange::Map(keys) => !keys.is_empty(),
            ObjChange::List(delta) => !delta.is_empty(),
            ObjChange::Text(delta) => !delta.is_empty(),
        })
        .collect()
}

fn created_objects(patch: &Patch) -> Vec<ObjId> {
    match &patch.action {
        PatchAction::PutMap {
            value: (Value::Object(_), id),
            ..
        }
        | PatchAction::PutSeq {
            value: (Value::Object(_), id),
            ..
        } => vec![id.clone()],
        PatchAction::Insert { values, .. } => values
            .iter()
            .filter(|(value, _, _)| matches!(value, Value::Object(_)))
            .map(|(_, id, _)| id.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn previous(doc: &AutoCommit, before: &[ChangeHash], obj: &ObjId, key: &str) -> Option<Entry> {
    doc.get_at(obj, key, before)
        .ok()
        .flatten()
        .map(|(value, id)| Entry::new(value, id))
}

fn apply_map_patch(
    doc: &AutoCommit,
    before: &[ChangeHash],
    obj: &ObjId,
    keys: &mut BTreeMap<String, KeyChange>,
    action: PatchAction,
) {
    let (key, new) = match action {
        PatchAction::PutMap { key, value, .. } => {
            let new = Entry::new(value.0, value.1);
            (key, Some(new))
        }
        PatchAction::DeleteMap { key } => (key, None),
        PatchAction::Increment {
            prop: Prop::Map(key),
            ..
        } => {
            let current = doc
                .get(obj, key.as_str())
                .ok()
                .flatten()
                .map(|(value, id)| Entry::new(value, id));
            (key, current)
        }
        _ => return,
    };

    let change = keys.entry(key.clone()).or_insert_with(|| {
        let old = previous(doc, before, obj, &key);
        KeyChange {
            action: KeyAction::Update,
            old,
            new: None,
        }
    });
    change.new = new;
    change.action = match (&change.old, &change.new) {
        (None, Some(_)) => KeyAction::Add,
        (Some(_), None) => KeyAction::Delete,
        _ => KeyAction::Update,
    };

    let unchanged = change.old == change.new;
    if unchanged {
        keys.remove(&key);
    }
}

fn apply_list_patch(delta: &mut Delta<Vec<Entry>>, cursor: &mut usize, action: PatchAction) {
    match action {
        PatchAction::Insert { index, values } => {
            let entries: Vec<Entry> = values
                .iter()
                .map(|(value, id, _)| Entry::new(value.clone(), id.clone()))
                .collect();
            push_op(delta, DeltaOp::Retain(index.saturating_sub(*cursor)));
            *cursor = index + entries.len();
            push_op(delta, DeltaOp::Insert(entries));
        }
        PatchAction::DeleteSeq { index, length } => {
            push_op(delta, DeltaOp::Retain(index.saturating_sub(*cursor)));
            push_op(delta, DeltaOp::Delete(length));
            *cursor = index;
        }
        PatchAction::PutSeq { index, value, .. } => {
            push_op(delta, DeltaOp::Retain(index.saturating_sub(*cursor)));
            push_op(delta, DeltaOp::Delete(1));
            push_op(delta, DeltaOp::Insert(vec![Entry::new(value.0, value.1)]));
            *cursor = index + 1;
        }
        _ => {}
    }
}

fn apply_text_patch(delta: &mut Delta<String>, cursor: &mut usize, action: PatchAction) {
    match action {
        PatchAction::SpliceText { index, value, .. } => {
            let text = value.make_string();
            push_op(delta, DeltaOp::Retain(index.saturating_sub(*cursor)));
            *cursor = index + text.chars().count();
            push_op(delta, DeltaOp::Insert(text));
        }
        PatchAction::DeleteSeq { index, length } => {
            push_op(delta, DeltaOp::Retain(index.saturating_sub(*cursor)));
            push_op(delta, DeltaOp::Delete(length));
            *cursor = index;
        }
        _ => {}
    }
}
