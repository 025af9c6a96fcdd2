//! Typed change records delivered by cells, notebooks and files.

use crdt_adapter::{Delta, DeltaOp};
use serde_json::Value;

use crate::cell::CellHandle;
use crate::record::Metadata;

/// Old and new value of a single field.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange<T> {
    pub old_value: Option<T>,
    pub new_value: Option<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChangeType {
    Add,
    Remove,
    Change,
}

/// One metadata key that was added, removed or changed.
#[derive(Debug, Clone, PartialEq)]
pub struct MapChange {
    pub change_type: MapChangeType,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangeType {
    Add,
    Remove,
}

/// One contiguous run of cells inserted into or removed from a notebook.
#[derive(Debug, Clone)]
pub struct ListChange {
    pub change_type: ListChangeType,
    pub new_index: Option<usize>,
    pub new_values: Vec<CellHandle>,
    pub old_index: Option<usize>,
    pub old_values: Vec<CellHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub name: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellChange {
    pub source_change: Option<Delta<String>>,
    pub metadata_change: Option<ValueChange<Metadata>>,
    pub outputs_change: Option<Delta<Vec<Value>>>,
    pub execution_count_change: Option<ValueChange<i64>>,
    pub attachments_change: Option<ValueChange<Metadata>>,
}

impl CellChange {
    pub fn is_empty(&self) -> bool {
        self.source_change.is_none()
            && self.metadata_change.is_none()
            && self.outputs_change.is_none()
            && self.execution_count_change.is_none()
            && self.attachments_change.is_none()
    }
}

/// A change to `nbformat` or `nbformat_minor`.
#[derive(Debug, Clone, PartialEq)]
pub struct NbformatChange {
    pub key: String,
    pub old_value: Option<i64>,
    pub new_value: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct NotebookChange {
    pub cells_change: Option<Delta<Vec<CellHandle>>>,
    pub metadata_change: Option<ValueChange<Metadata>>,
    pub nbformat_changed: Option<NbformatChange>,
    pub state_change: Option<Vec<StateChange>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileChange {
    pub source_change: Option<Delta<String>>,
    pub state_change: Option<Vec<StateChange>>,
}

/// Per-key differences between two metadata snapshots: keys of `old` first, then keys only in `new`.
pub fn diff_metadata(old: &Metadata, new: &Metadata) -> Vec<MapChange> {
    let mut changes = Vec::new();
    for (key, old_value) in old {
        match new.get(key) {
            None => changes.push(MapChange {
                change_type: MapChangeType::Remove,
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: None,
            }),
            Some(new_value) if new_value != old_value => changes.push(MapChange {
                change_type: MapChangeType::Change,
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: Some(new_value.clone()),
            }),
            Some(_) => {}
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            changes.push(MapChange {
                change_type: MapChangeType::Add,
                key: key.clone(),
                old_value: None,
                new_value: Some(new_value.clone()),
            });
        }
    }
    changes
}

/// Rewrite the inserted payloads of a delta, keeping retain and delete steps.
pub(crate) fn map_delta<T, U>(delta: &Delta<T>, mut f: impl FnMut(&T) -> U) -> Delta<U> {
    delta
        .iter()
        .map(|op| match op {
            DeltaOp::Retain(n) => DeltaOp::Retain(*n),
            DeltaOp::Delete(n) => DeltaOp::Delete(*n),
            DeltaOp::Insert(value) => DeltaOp::Insert(f(value)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_diff_metadata_reports_each_key() {
        let old = meta(json!({"a": 1, "b": 2, "c": {"x": true}}));
        let new = meta(json!({"b": 3, "c": {"x": true}, "d": null}));

        let changes = diff_metadata(&old, &new);
        let summary: Vec<(MapChangeType, &str)> = changes
            .iter()
            .map(|c| (c.change_type, c.key.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (MapChangeType::Remove, "a"),
                (MapChangeType::Change, "b"),
                (MapChangeType::Add, "d"),
            ]
        );
        assert_eq!(changes[1].old_value, Some(json!(2)));
        assert_eq!(changes[1].new_value, Some(json!(3)));
    }

    #[test]
    fn test_map_delta_keeps_structure() {
        let delta: Delta<Vec<&str>> = vec![
            DeltaOp::Retain(2),
            DeltaOp::Insert(vec!["a", "b"]),
            DeltaOp::Delete(1),
        ];
        let mapped = map_delta(&delta, |items| items.len());
        assert_eq!(
            mapped,
            vec![DeltaOp::Retain(2), DeltaOp::Insert(2), DeltaOp::Delete(1)]
        );
    }
}
