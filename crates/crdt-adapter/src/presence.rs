//! Ephemeral per-client state (cursor, selection, user name) that travels
//! beside a replica but is never part of its history.
//!
//! Encoding and broadcasting states is left to the transport; this channel
//! keeps the table and reports which clients changed.

use std::cell::RefCell;
use std::collections::BTreeMap;

use log::debug;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AdapterError, Result};
use crate::subscription::{Emitter, Subscription};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl PresenceChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct PresenceState {
    states: BTreeMap<String, Value>,
    destroyed: bool,
}

pub struct Presence {
    client_id: String,
    state: RefCell<PresenceState>,
    changes: Emitter<PresenceChange>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence {
    pub fn new() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            state: RefCell::new(PresenceState {
                states: BTreeMap::new(),
                destroyed: false,
            }),
            changes: Emitter::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn local_state(&self) -> Option<Value> {
        self.state.borrow().states.get(&self.client_id).cloned()
    }

    /// Every known client's state, including the local one.
    pub fn states(&self) -> BTreeMap<String, Value> {
        self.state.borrow().states.clone()
    }

    /// Set or clear (`None`) the local client's state.
    pub fn set_local_state(&self, state: Option<Value>) -> Result<()> {
        let client = self.client_id.clone();
        self.apply(&client, state)
    }

    /// Record a state received from another client; `None` means it left.
    pub fn apply_remote(&self, client: &str, state: Option<Value>) -> Result<()> {
        self.apply(client, state)
    }

    fn apply(&self, client: &str, state: Option<Value>) -> Result<()> {
        let change = {
            let mut inner = self.state.borrow_mut();
            if inner.destroyed {
                return Err(AdapterError::Destroyed);
            }
            let mut change = PresenceChange::default();
            match state {
                Some(value) => match inner.states.insert(client.to_string(), value.clone()) {
                    None => change.added.push(client.to_string()),
                    Some(prev) if prev != value => change.updated.push(client.to_string()),
                    Some(_) => {}
                },
                None => {
                    if inner.states.remove(client).is_some() {
                        change.removed.push(client.to_string());
                    }
                }
            }
            change
        };
        if !change.is_empty() {
            self.changes.emit(&change);
        }
        Ok(())
    }

    pub fn on_change(&self, f: impl Fn(&PresenceChange) + 'static) -> Subscription {
        self.changes.subscribe(f)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Remove the local state and stop accepting updates. Idempotent.
    pub fn destroy(&self) {
        let had_local = {
            let mut inner = self.state.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            let had_local = inner.states.remove(&self.client_id).is_some();
            inner.states.clear();
            had_local
        };
        debug!("[presence] Destroyed client {}", self.client_id);
        if had_local {
            self.changes.emit(&PresenceChange {
                removed: vec![self.client_id.clone()],
                ..Default::default()
            });
        }
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::rc::Rc;

    #[test]
    fn test_local_and_remote_states() {
        let presence = Presence::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _sub = presence.on_change(move |change| sink.borrow_mut().push(change.clone()));

        presence
            .set_local_state(Some(json!({"cursor": 3})))
            .unwrap();
        presence
            .apply_remote("peer", Some(json!({"cursor": 1})))
            .unwrap();
        presence
            .apply_remote("peer", Some(json!({"cursor": 1})))
            .unwrap();
        presence.apply_remote("peer", None).unwrap();

        assert_eq!(presence.local_state(), Some(json!({"cursor": 3})));
        assert_eq!(presence.states().len(), 1);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].added, vec![presence.client_id().to_string()]);
        assert_eq!(seen[1].added, vec!["peer".to_string()]);
        assert_eq!(seen[2].removed, vec!["peer".to_string()]);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let presence = Presence::new();
        presence.set_local_state(Some(json!({}))).unwrap();
        presence.destroy();
        presence.destroy();
        assert!(presence.is_destroyed());
        assert!(presence.states().is_empty());
        assert!(matches!(
            presence.set_local_state(Some(json!({}))),
            Err(AdapterError::Destroyed)
        ));
    }
}
