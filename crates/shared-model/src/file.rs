//! Shared plain-text file.
//!
//! ```text
//! ROOT/
//!   state/     ← Map (see `document`)
//!   source     ← Text
//! ```

use std::cell::RefCell;

use crdt_adapter::{child_id, Emitter, ObjId, ObjType, Subscription, Txn, ROOT};

use crate::changes::FileChange;
use crate::document::SharedDocument;
use crate::error::{ModelError, Result};

const SOURCE: &str = "source";

fn file_schema(txn: &Txn<'_>) -> crdt_adapter::Result<()> {
    txn.put_object(&ROOT, SOURCE, ObjType::Text)?;
    Ok(())
}

pub struct SharedFile {
    doc: SharedDocument,
    source: ObjId,
    changed: Emitter<FileChange>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile")
            .field("disposed", &self.doc.is_disposed())
            .finish()
    }
}

impl SharedFile {
    /// A new file, optionally with initial content as its first undo step.
    pub fn create(source: Option<&str>) -> Result<Self> {
        let file = Self::from_document(SharedDocument::with_schema(file_schema)?)?;
        if let Some(source) = source.filter(|source| !source.is_empty()) {
            file.set_source(source)?;
        }
        Ok(file)
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Self::from_document(SharedDocument::load(bytes)?)
    }

    pub fn from_document(doc: SharedDocument) -> Result<Self> {
        let source = doc
            .replica()
            .read(|d| child_id(d, ROOT, SOURCE, ObjType::Text))
            .ok_or_else(|| ModelError::InvalidSchema("missing source text".into()))?;
        doc.undo_manager().add_to_scope(&source)?;

        let changed: Emitter<FileChange> = Emitter::new();
        let subscriptions = vec![
            doc.replica().observe(&source, {
                let changed = changed.clone();
                let target = source.clone();
                move |batch| {
                    if let Some(delta) = batch.text_delta(&target) {
                        changed.emit(&FileChange {
                            source_change: Some(delta.clone()),
                            ..Default::default()
                        });
                    }
                }
            }),
            doc.on_state_change({
                let changed = changed.clone();
                move |changes| {
                    changed.emit(&FileChange {
                        state_change: Some(changes.clone()),
                        ..Default::default()
                    });
                }
            }),
        ];

        Ok(Self {
            doc,
            source,
            changed,
            subscriptions: RefCell::new(subscriptions),
        })
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn source(&self) -> String {
        self.doc.replica().text(&self.source).unwrap_or_default()
    }

    pub fn set_source(&self, value: &str) -> Result<()> {
        self.doc
            .transact(true, |txn| Ok(txn.update_text(&self.source, value)?))
    }

    /// Replace the characters in `start..end` with `value`.
    pub fn update_source(&self, start: usize, end: usize, value: &str) -> Result<()> {
        self.doc.ensure_live()?;
        let len = self.doc.replica().length(&self.source);
        if start > end || end > len {
            return Err(ModelError::InvalidRange { start, end, len });
        }
        let inserted = value.chars().count();
        self.doc.transact(true, |txn| {
            txn.splice_text(&self.source, start, 0, value)?;
            txn.splice_text(&self.source, start + inserted, end - start, "")?;
            Ok(())
        })
    }

    pub fn on_changed(&self, f: impl Fn(&FileChange) + 'static) -> Subscription {
        self.changed.subscribe(f)
    }

    pub fn undo(&self) -> Result<()> {
        self.doc.undo()
    }

    pub fn redo(&self) -> Result<()> {
        self.doc.redo()
    }

    pub fn can_undo(&self) -> bool {
        self.doc.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.doc.can_redo()
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(self.doc.replica().save()?)
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<usize> {
        Ok(self.doc.replica().apply_update(update)?)
    }

    pub fn dispose(&self) {
        self.subscriptions.borrow_mut().clear();
        self.changed.clear();
        self.doc.dispose();
    }
}
