//! Cell metadata rules: `collapsed` and `jupyter.outputs_hidden` are two
//! views of one flag and are kept equal on every write.

use serde_json::{Map, Value};

use crate::record::Metadata;

pub(crate) const COLLAPSED: &str = "collapsed";
pub(crate) const JUPYTER: &str = "jupyter";
pub(crate) const OUTPUTS_HIDDEN: &str = "outputs_hidden";

/// Which side of the alias wins when both are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prefer {
    Collapsed,
    Jupyter,
}

fn outputs_hidden(metadata: &Metadata) -> Option<&Value> {
    metadata
        .get(JUPYTER)
        .and_then(Value::as_object)
        .and_then(|jupyter| jupyter.get(OUTPUTS_HIDDEN))
        .filter(|value| !value.is_null())
}

fn collapsed(metadata: &Metadata) -> Option<&Value> {
    metadata.get(COLLAPSED).filter(|value| !value.is_null())
}

fn set_outputs_hidden(metadata: &mut Metadata, value: Value) {
    let jupyter = metadata
        .entry(JUPYTER)
        .or_insert_with(|| Value::Object(Map::new()));
    if !jupyter.is_object() {
        *jupyter = Value::Object(Map::new());
    }
    if let Value::Object(jupyter) = jupyter {
        jupyter.insert(OUTPUTS_HIDDEN.to_string(), value);
    }
}

/// Bring the alias pair into agreement.
pub(crate) fn normalize(metadata: &mut Metadata, prefer: Prefer) {
    let from_collapsed = collapsed(metadata).cloned();
    let from_jupyter = outputs_hidden(metadata).cloned();

    let (source, value) = match (prefer, from_collapsed, from_jupyter) {
        (Prefer::Collapsed, Some(value), _) | (Prefer::Jupyter, Some(value), None) => {
            (Prefer::Collapsed, value)
        }
        (_, _, Some(value)) => (Prefer::Jupyter, value),
        (_, None, None) => return,
    };
    match source {
        Prefer::Collapsed => set_outputs_hidden(metadata, value),
        Prefer::Jupyter => {
            metadata.insert(COLLAPSED.to_string(), value);
        }
    }
}

/// `current` with `key` set to `value`, aliases synchronized toward `key`.
pub(crate) fn with_key(current: &Metadata, key: &str, value: Value) -> Metadata {
    let mut next = current.clone();
    next.insert(key.to_string(), value);
    let prefer = if key == JUPYTER {
        Prefer::Jupyter
    } else {
        Prefer::Collapsed
    };
    normalize(&mut next, prefer);
    next
}

/// `current` without `key`. Removing either side of the alias removes both.
pub(crate) fn without_key(current: &Metadata, key: &str) -> Metadata {
    let mut next = current.clone();
    next.remove(key);
    match key {
        COLLAPSED => {
            let now_empty = match next.get_mut(JUPYTER) {
                Some(Value::Object(jupyter)) => {
                    jupyter.remove(OUTPUTS_HIDDEN);
                    jupyter.is_empty()
                }
                _ => false,
            };
            if now_empty {
                next.remove(JUPYTER);
            }
        }
        JUPYTER => {
            next.remove(COLLAPSED);
        }
        _ => normalize(&mut next, Prefer::Collapsed),
    }
    next
}
