//! Values read out of a replica: shallow entries and deep snapshots.

use std::collections::BTreeMap;

use automerge::{ObjId, ObjType, Prop, ReadDoc, ScalarValue, Value};

use crate::error::Result;

/// A single slot of a map or list: a scalar, or a reference to a child object.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Scalar(ScalarValue),
    Object(ObjType, ObjId),
}

impl Entry {
    pub(crate) fn new(value: Value<'_>, id: ObjId) -> Self {
        match value {
            Value::Object(ty) => Entry::Object(ty, id),
            Value::Scalar(s) => Entry::Scalar(s.into_owned()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Entry::Scalar(ScalarValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Entry::Scalar(ScalarValue::Int(n)) => Some(*n),
            Entry::Scalar(ScalarValue::Uint(n)) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn object(&self) -> Option<&ObjId> {
        match self {
            Entry::Object(_, id) => Some(id),
            Entry::Scalar(_) => None,
        }
    }
}

/// A deep copy of a value, used to recreate it after it was overwritten or deleted.
///
/// Object snapshots remember the id they were captured from, so a restored
/// object can be traced back to the one it replaces.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Scalar(ScalarValue),
    Text {
        origin: Option<ObjId>,
        content: String,
    },
    List {
        origin: Option<ObjId>,
        items: Vec<Snapshot>,
    },
    Map {
        origin: Option<ObjId>,
        entries: BTreeMap<String, Snapshot>,
    },
}

impl Snapshot {
    pub fn capture<R: ReadDoc>(doc: &R, value: Value<'_>, id: ObjId) -> Result<Self> {
        match value {
            Value::Scalar(s) => Ok(Snapshot::Scalar(s.into_owned())),
            Value::Object(ObjType::Text) => Ok(Snapshot::Text {
                content: doc.text(&id)?,
                origin: Some(id),
            }),
            Value::Object(ObjType::List) => {
                let mut items = Vec::new();
                for index in 0..doc.length(&id) {
                    if let Some((child, child_id)) = doc.get(&id, index)? {
                        items.push(Snapshot::capture(doc, child, child_id)?);
                    }
                }
                Ok(Snapshot::List {
                    origin: Some(id),
                    items,
                })
            }
            Value::Object(ObjType::Map | ObjType::Table) => {
                let keys: Vec<String> = doc.keys(&id).collect();
                let mut entries = BTreeMap::new();
                for key in keys {
                    if let Some((child, child_id)) = doc.get(&id, key.as_str())? {
                        entries.insert(key, Snapshot::capture(doc, child, child_id)?);
                    }
                }
                Ok(Snapshot::Map {
                    origin: Some(id),
                    entries,
                })
            }
        }
    }

    pub fn obj_type(&self) -> Option<ObjType> {
        match self {
            Snapshot::Scalar(_) => None,
            Snapshot::Text { .. } => Some(ObjType::Text),
            Snapshot::List { .. } => Some(ObjType::List),
            Snapshot::Map { .. } => Some(ObjType::Map),
        }
    }

    pub fn origin(&self) -> Option<&ObjId> {
        match self {
            Snapshot::Scalar(_) => None,
            Snapshot::Text { origin, .. }
            | Snapshot::List { origin, .. }
            | Snapshot::Map { origin, .. } => origin.as_ref(),
        }
    }
}

/// Capture the current value at `key` of a map, if any.
pub(crate) fn capture_key<R: ReadDoc>(doc: &R, obj: &ObjId, key: &str) -> Result<Option<Snapshot>> {
    match doc.get(obj, key)? {
        Some((value, id)) => Ok(Some(Snapshot::capture(doc, value, id)?)),
        None => Ok(None),
    }
}

pub(crate) fn capture_index<R: ReadDoc>(doc: &R, obj: &ObjId, index: usize) -> Result<Option<Snapshot>> {
    match doc.get(obj, index)? {
        Some((value, id)) => Ok(Some(Snapshot::capture(doc, value, id)?)),
        None => Ok(None),
    }
}

/// Read a string scalar.
pub fn read_str<R: ReadDoc, O: AsRef<ObjId>, P: Into<Prop>>(
    doc: &R,
    obj: O,
    prop: P,
) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            Value::Scalar(s) => match s.as_ref() {
                ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

/// Read an integer scalar.
pub fn read_i64<R: ReadDoc, O: AsRef<ObjId>, P: Into<Prop>>(
    doc: &R,
    obj: O,
    prop: P,
) -> Option<i64> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, id)| Entry::new(value, id).as_i64())
}

/// Id of the child object at `prop`, if it exists and has type `ty`.
pub fn child_id<R: ReadDoc, O: AsRef<ObjId>, P: Into<Prop>>(
    doc: &R,
    obj: O,
    prop: P,
    ty: ObjType,
) -> Option<ObjId> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            Value::Object(found) if found == ty => Some(id),
            _ => None,
        })
}

/// Whether `obj` can still be reached from the root through visible properties.
pub fn is_reachable<R: ReadDoc>(doc: &R, obj: &ObjId) -> bool {
    *obj == automerge::ROOT
        || doc
            .parents(obj)
            .ok()
            .and_then(|parents| parents.visible_path())
            .is_some()
}

/// Whether `obj` is one of `roots` or lives somewhere below one of them.
pub fn is_within<R: ReadDoc>(doc: &R, obj: &ObjId, roots: &[ObjId]) -> bool {
    if roots.contains(obj) {
        return true;
    }
    match doc.parents(obj) {
        Ok(parents) => parents
            .path()
            .iter()
            .any(|(ancestor, _)| roots.contains(ancestor)),
        Err(_) => false,
    }
}
