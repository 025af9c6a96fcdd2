//! Cells: a typed handle over one replicated map.
//!
//! ## Cell map schema
//!
//! ```text
//! cells[i]/                ← Map
//!   id: Str
//!   cell_type: Str
//!   source: Text
//!   metadata: Str          ← JSON object
//!   outputs: List of Str   ← JSON objects (code cells)
//!   execution_count: Int | Null  (code cells)
//!   attachments: Str       ← JSON object (markdown and raw cells, optional)
//! ```
//!
//! A cell is either standalone, with a private replica, or attached to a
//! notebook and sharing its replica. Which one is fixed at construction.
//!
//! Maps written by other replicas may lack `source` or `outputs`; they read
//! as empty and are created by the first write.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crdt_adapter::{
    child_id, push_op, read_i64, read_str, ChangeBatch, DeltaOp, Emitter, Entry, ObjId,
    ObjType, Origin, Presence, ReadDoc, Replica, ScalarValue, Subscription, Txn, UndoManager,
    ROOT,
};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::changes::{diff_metadata, map_delta, CellChange, MapChange, ValueChange};
use crate::document::{decode_entry, read_json};
use crate::error::{ModelError, Result};
use crate::metadata::{normalize, with_key, without_key, Prefer};
use crate::notebook::{Notebook, NotebookInner};
use crate::record::{default_cell_type_adaptor, CellKind, CellRecord, CellTypeAdaptor, Metadata};

pub(crate) const ID: &str = "id";
pub(crate) const CELL_TYPE: &str = "cell_type";
const SOURCE: &str = "source";
const METADATA: &str = "metadata";
const OUTPUTS: &str = "outputs";
const EXECUTION_COUNT: &str = "execution_count";
const ATTACHMENTS: &str = "attachments";

/// Root list of a standalone cell's private replica.
const STANDALONE_CELLS: &str = "cells";

/// Shared handle to a cell wrapper. A notebook keeps exactly one per cell map.
pub type CellHandle = Rc<SharedCell>;

pub(crate) fn into_object(value: Value) -> Option<Metadata> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub(crate) fn resolve_kind(cell_type: &str, adaptor: CellTypeAdaptor) -> Result<CellKind> {
    adaptor(cell_type).ok_or_else(|| ModelError::UnknownCellType(cell_type.to_string()))
}

/// Where a cell lives.
pub(crate) enum Owner {
    Standalone { presence: Rc<Presence> },
    Attached(Attachment),
}

pub(crate) struct Attachment {
    pub(crate) notebook: Weak<NotebookInner>,
    pub(crate) doc_origin: Origin,
    pub(crate) doc_manager: Rc<UndoManager>,
    pub(crate) per_cell: bool,
    pub(crate) presence: Rc<Presence>,
}

enum UndoBinding {
    Unset,
    Shared(Rc<UndoManager>),
    Private(UndoManager),
}

/// Fields and behavior common to every cell variant.
pub struct CellCore {
    id: String,
    cell_type: String,
    kind: CellKind,
    map: ObjId,
    source: RefCell<Option<ObjId>>,
    source_len: Cell<usize>,
    replica: Replica,
    owner: Owner,
    origin: Origin,
    undo: RefCell<UndoBinding>,
    changed: Emitter<CellChange>,
    metadata_changed: Emitter<MapChange>,
    disposed: Cell<bool>,
    subscription: RefCell<Option<Subscription>>,
}

impl CellCore {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stored `cell_type` string.
    pub fn cell_type(&self) -> &str {
        &self.cell_type
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Id of the replicated map backing this cell.
    pub fn map_id(&self) -> &ObjId {
        &self.map
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self.owner, Owner::Standalone { .. })
    }

    /// The owning notebook, while it is alive.
    pub fn notebook(&self) -> Option<Notebook> {
        match &self.owner {
            Owner::Attached(attachment) => attachment.notebook.upgrade().map(Notebook::from_inner),
            Owner::Standalone { .. } => None,
        }
    }

    pub fn presence(&self) -> Rc<Presence> {
        match &self.owner {
            Owner::Standalone { presence } => Rc::clone(presence),
            Owner::Attached(attachment) => Rc::clone(&attachment.presence),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.get() {
            return Err(ModelError::Disposed);
        }
        Ok(())
    }

    fn write_origin(&self, undoable: bool) -> Origin {
        if !undoable {
            return Origin::UNTRACKED;
        }
        match &self.owner {
            Owner::Attached(attachment) if !attachment.per_cell => attachment.doc_origin,
            _ => self.origin,
        }
    }

    /// Run `f` as one change. Undoable changes go to whichever undo manager tracks this cell.
    pub fn transact<R, F>(&self, undoable: bool, f: F) -> Result<R>
    where
        F: FnOnce(&Txn<'_>) -> Result<R>,
    {
        self.ensure_live()?;
        self.replica.transact(self.write_origin(undoable), f)
    }

    // ── Source ───────────────────────────────────────────────────────────

    pub fn source(&self) -> String {
        self.source
            .borrow()
            .as_ref()
            .and_then(|source| self.replica.text(source).ok())
            .unwrap_or_default()
    }

    fn source_len(&self) -> usize {
        self.source
            .borrow()
            .as_ref()
            .map_or(0, |source| self.replica.length(source))
    }

    /// The source text, created inside `txn` if the map has none.
    fn source_text(&self, txn: &Txn<'_>) -> Result<ObjId> {
        let existing = self.source.borrow().clone();
        match existing {
            Some(source) => Ok(source),
            None => Ok(txn.put_object(&self.map, SOURCE, ObjType::Text)?),
        }
    }

    pub fn set_source(&self, value: &str) -> Result<()> {
        self.transact(true, |txn| {
            let source = self.source_text(txn)?;
            Ok(txn.update_text(&source, value)?)
        })
    }

    /// Replace the characters in `start..end` with `value`.
    pub fn update_source(&self, start: usize, end: usize, value: &str) -> Result<()> {
        self.ensure_live()?;
        let len = self.source_len();
        if start > end || end > len {
            return Err(ModelError::InvalidRange { start, end, len });
        }
        let inserted = value.chars().count();
        self.transact(true, |txn| {
            let source = self.source_text(txn)?;
            txn.splice_text(&source, start, 0, value)?;
            txn.splice_text(&source, start + inserted, end - start, "")?;
            Ok(())
        })
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    pub fn get_metadata(&self) -> Metadata {
        self.replica
            .read(|doc| read_json(doc, &self.map, METADATA))
            .and_then(into_object)
            .unwrap_or_default()
    }

    pub fn get_metadata_key(&self, key: &str) -> Option<Value> {
        self.get_metadata().remove(key)
    }

    /// Replace the whole metadata object.
    pub fn set_metadata(&self, metadata: Metadata) -> Result<()> {
        let mut next = metadata;
        normalize(&mut next, Prefer::Collapsed);
        self.write_metadata(next)
    }

    /// Set one key. `None` is rejected; use [`CellCore::delete_metadata`].
    pub fn set_metadata_key(&self, key: &str, value: Option<Value>) -> Result<()> {
        let value = value.ok_or_else(|| ModelError::MetadataValueUndefined(key.to_string()))?;
        self.write_metadata(with_key(&self.get_metadata(), key, value))
    }

    pub fn delete_metadata(&self, key: &str) -> Result<()> {
        self.write_metadata(without_key(&self.get_metadata(), key))
    }

    fn write_metadata(&self, next: Metadata) -> Result<()> {
        self.ensure_live()?;
        if self.get_metadata() == next {
            return Ok(());
        }
        let encoded = serde_json::to_string(&next)?;
        self.transact(true, |txn| Ok(txn.put(&self.map, METADATA, encoded)?))
    }

    // ── Undo ─────────────────────────────────────────────────────────────

    /// Bind the undo manager this cell's edits belong to. Allowed once.
    pub fn set_undo_manager(&self) -> Result<()> {
        self.ensure_live()?;
        let mut binding = self.undo.borrow_mut();
        if !matches!(*binding, UndoBinding::Unset) {
            return Err(ModelError::UndoManagerAlreadySet);
        }
        *binding = match &self.owner {
            Owner::Attached(attachment) if !attachment.per_cell => {
                UndoBinding::Shared(Rc::clone(&attachment.doc_manager))
            }
            _ => UndoBinding::Private(UndoManager::new(
                &self.replica,
                &[self.map.clone()],
                &[self.origin],
            )?),
        };
        Ok(())
    }

    fn with_manager<R>(&self, f: impl FnOnce(&UndoManager) -> R) -> Option<R> {
        let shared = match &*self.undo.borrow() {
            UndoBinding::Unset => return None,
            UndoBinding::Private(manager) => return Some(f(manager)),
            UndoBinding::Shared(manager) => Rc::clone(manager),
        };
        Some(f(&shared))
    }

    pub fn undo(&self) -> Result<()> {
        self.ensure_live()?;
        self.with_manager(UndoManager::undo).transpose()?;
        Ok(())
    }

    pub fn redo(&self) -> Result<()> {
        self.ensure_live()?;
        self.with_manager(UndoManager::redo).transpose()?;
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        self.with_manager(UndoManager::can_undo).unwrap_or(false)
    }

    pub fn can_redo(&self) -> bool {
        self.with_manager(UndoManager::can_redo).unwrap_or(false)
    }

    pub fn clear_undo_history(&self) -> Result<()> {
        self.ensure_live()?;
        self.with_manager(UndoManager::clear).transpose()?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn on_changed(&self, f: impl Fn(&CellChange) + 'static) -> Subscription {
        self.changed.subscribe(f)
    }

    /// One event per metadata key added, removed or changed.
    pub fn on_metadata_changed(&self, f: impl Fn(&MapChange) + 'static) -> Subscription {
        self.metadata_changed.subscribe(f)
    }

    /// Detach from the replica. A standalone cell also releases its private
    /// replica and presence channel. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.subscription.borrow_mut().take();
        self.changed.clear();
        self.metadata_changed.clear();
        if let Ok(mut binding) = self.undo.try_borrow_mut() {
            if let UndoBinding::Private(manager) = &*binding {
                manager.destroy();
            }
            *binding = UndoBinding::Unset;
        }
        if let Owner::Standalone { presence } = &self.owner {
            presence.destroy();
            self.replica.destroy();
        }
        debug!("[cell] Disposed cell {}", self.id);
    }

    /// Source and metadata parts of a change batch.
    fn core_changes(&self, batch: &ChangeBatch, change: &mut CellChange) {
        let keys = batch.map_change(&self.map);

        let source_key = keys.and_then(|keys| keys.get(SOURCE));
        if let Some(key) = source_key {
            let previous = self.source_len.get();
            *self.source.borrow_mut() = key.new.as_ref().and_then(Entry::object).cloned();
            let mut delta = Vec::new();
            push_op(&mut delta, DeltaOp::Delete(previous));
            push_op(&mut delta, DeltaOp::Insert(self.source()));
            if !delta.is_empty() {
                change.source_change = Some(delta);
            }
        } else if let Some(delta) = self
            .source
            .borrow()
            .as_ref()
            .and_then(|source| batch.text_delta(source))
        {
            change.source_change = Some(delta.clone());
        }
        self.source_len.set(self.source_len());

        if let Some(key) = keys.and_then(|keys| keys.get(METADATA)) {
            let old_value = decode_entry(key.old.as_ref()).and_then(into_object);
            let new_value = self.get_metadata();
            for key_change in diff_metadata(&old_value.clone().unwrap_or_default(), &new_value) {
                self.metadata_changed.emit(&key_change);
            }
            change.metadata_change = Some(ValueChange {
                old_value,
                new_value: Some(new_value),
            });
        }
    }
}

/// Outputs and execution count of a code cell.
pub struct CodeCell {
    core: CellCore,
    outputs: RefCell<Option<ObjId>>,
    outputs_len: Cell<usize>,
}

impl Deref for CodeCell {
    type Target = CellCore;

    fn deref(&self) -> &CellCore {
        &self.core
    }
}

impl CodeCell {
    pub fn outputs(&self) -> Vec<Value> {
        let Some(outputs) = self.outputs.borrow().clone() else {
            return Vec::new();
        };
        self.core.replica.read(|doc| {
            (0..doc.length(&outputs))
                .filter_map(|index| read_str(doc, &outputs, index))
                .filter_map(|raw| serde_json::from_str(&raw).ok())
                .collect()
        })
    }

    fn outputs_len(&self) -> usize {
        self.outputs
            .borrow()
            .as_ref()
            .map_or(0, |outputs| self.core.replica.length(outputs))
    }

    /// Replace every output. Never undoable.
    pub fn set_outputs(&self, outputs: &[Value]) -> Result<()> {
        self.core.ensure_live()?;
        self.replace_outputs(0, self.outputs_len(), outputs)
    }

    /// Replace outputs `start..end` with `outputs`; `end` is clamped to the list length.
    pub fn update_outputs(&self, start: usize, end: usize, outputs: &[Value]) -> Result<()> {
        self.core.ensure_live()?;
        let len = self.outputs_len();
        let end = end.min(len);
        if start > end {
            return Err(ModelError::InvalidRange { start, end, len });
        }
        self.replace_outputs(start, end, outputs)
    }

    fn replace_outputs(&self, start: usize, end: usize, outputs: &[Value]) -> Result<()> {
        let encoded = outputs
            .iter()
            .map(serde_json::to_string)
            .collect::<serde_json::Result<Vec<_>>>()?;
        let existing = self.outputs.borrow().clone();
        self.core.transact(false, |txn| {
            let list = match existing {
                Some(list) => list,
                None => txn.put_object(&self.core.map, OUTPUTS, ObjType::List)?,
            };
            if end > start {
                txn.delete_range(&list, start, end - start)?;
            }
            for (offset, output) in encoded.into_iter().enumerate() {
                txn.insert(&list, start + offset, output)?;
            }
            Ok(())
        })
    }

    pub fn execution_count(&self) -> Option<i64> {
        self.core
            .replica
            .read(|doc| read_i64(doc, &self.core.map, EXECUTION_COUNT))
    }

    /// Never undoable.
    pub fn set_execution_count(&self, count: Option<i64>) -> Result<()> {
        self.core.ensure_live()?;
        if self.execution_count() == count {
            return Ok(());
        }
        self.core
            .transact(false, |txn| Ok(txn.put(&self.core.map, EXECUTION_COUNT, count_value(count))?))
    }

    fn output_changes(&self, batch: &ChangeBatch, change: &mut CellChange) {
        let keys = batch.map_change(&self.core.map);

        if let Some(key) = keys.and_then(|keys| keys.get(OUTPUTS)) {
            let previous = self.outputs_len.get();
            *self.outputs.borrow_mut() = key.new.as_ref().and_then(Entry::object).cloned();
            let mut delta = Vec::new();
            push_op(&mut delta, DeltaOp::Delete(previous));
            push_op(&mut delta, DeltaOp::Insert(self.outputs()));
            if !delta.is_empty() {
                change.outputs_change = Some(delta);
            }
        } else if let Some(delta) = self
            .outputs
            .borrow()
            .as_ref()
            .and_then(|outputs| batch.list_delta(outputs))
        {
            change.outputs_change = Some(map_delta(delta, |entries| {
                entries
                    .iter()
                    .filter_map(|entry| decode_entry(Some(entry)))
                    .collect()
            }));
        }
        self.outputs_len.set(self.outputs_len());

        if let Some(key) = keys.and_then(|keys| keys.get(EXECUTION_COUNT)) {
            change.execution_count_change = Some(ValueChange {
                old_value: key.old.as_ref().and_then(Entry::as_i64),
                new_value: key.new.as_ref().and_then(Entry::as_i64),
            });
        }
    }
}

fn count_value(count: Option<i64>) -> ScalarValue {
    match count {
        Some(count) => ScalarValue::Int(count),
        None => ScalarValue::Null,
    }
}

/// Named binary attachments, shared by markdown and raw cells.
pub trait WithAttachments {
    fn core(&self) -> &CellCore;

    fn attachments(&self) -> Option<Metadata> {
        let core = self.core();
        core.replica
            .read(|doc| read_json(doc, &core.map, ATTACHMENTS))
            .and_then(into_object)
    }

    /// Set or, with `None`, remove the attachments.
    fn set_attachments(&self, attachments: Option<Metadata>) -> Result<()> {
        let core = self.core();
        core.ensure_live()?;
        if self.attachments() == attachments {
            return Ok(());
        }
        let encoded = attachments.as_ref().map(serde_json::to_string).transpose()?;
        core.transact(true, |txn| {
            match encoded {
                Some(encoded) => txn.put(&core.map, ATTACHMENTS, encoded)?,
                None => {
                    txn.delete_key(&core.map, ATTACHMENTS)?;
                }
            }
            Ok(())
        })
    }
}

fn attachment_changes(core: &CellCore, batch: &ChangeBatch, change: &mut CellChange) {
    let key = batch
        .map_change(&core.map)
        .and_then(|keys| keys.get(ATTACHMENTS));
    if let Some(key) = key {
        change.attachments_change = Some(ValueChange {
            old_value: decode_entry(key.old.as_ref()).and_then(into_object),
            new_value: decode_entry(key.new.as_ref()).and_then(into_object),
        });
    }
}

pub struct MarkdownCell {
    core: CellCore,
}

impl Deref for MarkdownCell {
    type Target = CellCore;

    fn deref(&self) -> &CellCore {
        &self.core
    }
}

impl WithAttachments for MarkdownCell {
    fn core(&self) -> &CellCore {
        &self.core
    }
}

pub struct RawCell {
    core: CellCore,
}

impl Deref for RawCell {
    type Target = CellCore;

    fn deref(&self) -> &CellCore {
        &self.core
    }
}

impl WithAttachments for RawCell {
    fn core(&self) -> &CellCore {
        &self.core
    }
}

/// A notebook cell.
pub enum SharedCell {
    Code(CodeCell),
    Markdown(MarkdownCell),
    Raw(RawCell),
}

impl Deref for SharedCell {
    type Target = CellCore;

    fn deref(&self) -> &CellCore {
        self.core()
    }
}

impl std::fmt::Debug for SharedCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCell")
            .field("id", &self.core().id)
            .field("cell_type", &self.core().cell_type)
            .field("disposed", &self.core().disposed.get())
            .finish()
    }
}

impl SharedCell {
    pub fn core(&self) -> &CellCore {
        match self {
            SharedCell::Code(cell) => &cell.core,
            SharedCell::Markdown(cell) => &cell.core,
            SharedCell::Raw(cell) => &cell.core,
        }
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match self {
            SharedCell::Code(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_markdown(&self) -> Option<&MarkdownCell> {
        match self {
            SharedCell::Markdown(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&RawCell> {
        match self {
            SharedCell::Raw(cell) => Some(cell),
            _ => None,
        }
    }

    fn with_attachments(&self) -> Option<&dyn WithAttachments> {
        match self {
            SharedCell::Code(_) => None,
            SharedCell::Markdown(cell) => Some(cell),
            SharedCell::Raw(cell) => Some(cell),
        }
    }

    /// Attachments of a markdown or raw cell; always `None` for code cells.
    pub fn attachments(&self) -> Option<Metadata> {
        self.with_attachments().and_then(|cell| cell.attachments())
    }

    pub fn set_attachments(&self, attachments: Option<Metadata>) -> Result<()> {
        match self.with_attachments() {
            Some(cell) => cell.set_attachments(attachments),
            None => Err(ModelError::Unsupported {
                cell_type: self.cell_type.clone(),
            }),
        }
    }

    /// The canonical record for this cell.
    pub fn to_json(&self) -> CellRecord {
        let core = self.core();
        let mut record = CellRecord::new(core.cell_type.clone(), core.source())
            .with_id(core.id.clone())
            .with_metadata(core.get_metadata());
        match self {
            SharedCell::Code(cell) => {
                record.outputs = Some(cell.outputs());
                record.execution_count = Some(cell.execution_count());
            }
            SharedCell::Markdown(_) | SharedCell::Raw(_) => {
                record.attachments = self.attachments();
            }
        }
        record
    }

    /// Translate a change batch into a [`CellChange`], emitting per-key metadata events first.
    pub(crate) fn get_changes(&self, batch: &ChangeBatch) -> CellChange {
        let mut change = CellChange::default();
        self.core().core_changes(batch, &mut change);
        match self {
            SharedCell::Code(cell) => cell.output_changes(batch, &mut change),
            SharedCell::Markdown(cell) => attachment_changes(&cell.core, batch, &mut change),
            SharedCell::Raw(cell) => attachment_changes(&cell.core, batch, &mut change),
        }
        change
    }

    fn handle_batch(&self, batch: &ChangeBatch) {
        if self.disposed.get() {
            return;
        }
        let change = self.get_changes(batch);
        if !change.is_empty() {
            self.core().changed.emit(&change);
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────────

/// Write a new cell map for `record` at `index` of `list`.
pub(crate) fn write_cell(
    txn: &Txn<'_>,
    list: &ObjId,
    index: usize,
    record: &CellRecord,
    kind: CellKind,
) -> Result<ObjId> {
    let id = record
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut metadata = record.metadata.clone();
    normalize(&mut metadata, Prefer::Collapsed);

    let map = txn.insert_object(list, index, ObjType::Map)?;
    txn.put(&map, ID, id)?;
    txn.put(&map, CELL_TYPE, record.cell_type.as_str())?;
    let source = txn.put_object(&map, SOURCE, ObjType::Text)?;
    if !record.source.is_empty() {
        txn.splice_text(&source, 0, 0, &record.source)?;
    }
    txn.put(&map, METADATA, serde_json::to_string(&metadata)?)?;

    match kind {
        CellKind::Code => {
            let outputs = txn.put_object(&map, OUTPUTS, ObjType::List)?;
            for (index, output) in record.outputs.iter().flatten().enumerate() {
                txn.insert(&outputs, index, serde_json::to_string(output)?)?;
            }
            let count = record.execution_count.flatten();
            txn.put(&map, EXECUTION_COUNT, count_value(count))?;
        }
        CellKind::Markdown | CellKind::Raw => {
            if let Some(attachments) = &record.attachments {
                txn.put(&map, ATTACHMENTS, serde_json::to_string(attachments)?)?;
            }
        }
    }
    Ok(map)
}

/// Wrap an existing cell map and start observing it.
pub(crate) fn from_map(replica: &Replica, map: &ObjId, kind: CellKind, owner: Owner) -> CellHandle {
    let (id, cell_type, source, outputs) = replica.read(|doc| {
        (
            read_str(doc, map, ID),
            read_str(doc, map, CELL_TYPE),
            child_id(doc, map, SOURCE, ObjType::Text),
            child_id(doc, map, OUTPUTS, ObjType::List),
        )
    });
    let id = id.unwrap_or_else(|| {
        warn!("[cell] Cell map {} has no id", map);
        map.to_string()
    });
    if source.is_none() {
        warn!("[cell] Cell {} has no source text", id);
    }

    let core = CellCore {
        cell_type: cell_type.unwrap_or_else(|| kind.as_str().to_string()),
        kind,
        map: map.clone(),
        source_len: Cell::new(source.as_ref().map_or(0, |source| replica.length(source))),
        source: RefCell::new(source),
        replica: replica.clone(),
        owner,
        origin: Origin::unique(),
        undo: RefCell::new(UndoBinding::Unset),
        changed: Emitter::new(),
        metadata_changed: Emitter::new(),
        disposed: Cell::new(false),
        subscription: RefCell::new(None),
        id,
    };
    let cell = Rc::new(match kind {
        CellKind::Code => SharedCell::Code(CodeCell {
            outputs_len: Cell::new(outputs.as_ref().map_or(0, |outputs| replica.length(outputs))),
            outputs: RefCell::new(outputs),
            core,
        }),
        CellKind::Markdown => SharedCell::Markdown(MarkdownCell { core }),
        CellKind::Raw => SharedCell::Raw(RawCell { core }),
    });

    let weak = Rc::downgrade(&cell);
    let subscription = replica.observe_deep(map, move |batch| {
        if let Some(cell) = weak.upgrade() {
            cell.handle_batch(batch);
        }
    });
    *cell.subscription.borrow_mut() = Some(subscription);
    cell
}

/// A cell with its own private replica, presence channel and undo manager.
pub fn create_standalone_cell(record: &CellRecord) -> Result<CellHandle> {
    create_standalone_cell_with(record, default_cell_type_adaptor)
}

pub fn create_standalone_cell_with(
    record: &CellRecord,
    adaptor: CellTypeAdaptor,
) -> Result<CellHandle> {
    let kind = resolve_kind(&record.cell_type, adaptor)?;
    let replica = Replica::with_schema(|txn| {
        txn.put_object(&ROOT, STANDALONE_CELLS, ObjType::List)?;
        Ok(())
    })?;
    let list = replica
        .read(|doc| child_id(doc, ROOT, STANDALONE_CELLS, ObjType::List))
        .ok_or_else(|| ModelError::InvalidSchema("missing cell list".into()))?;
    let map = replica.transact(Origin::UNTRACKED, |txn| {
        write_cell(txn, &list, 0, record, kind)
    })?;

    let owner = Owner::Standalone {
        presence: Rc::new(Presence::new()),
    };
    let cell = from_map(&replica, &map, kind, owner);
    if let Err(err) = cell.set_undo_manager() {
        warn!("[cell] Could not bind undo manager for {}: {}", cell.id(), err);
        cell.dispose();
        return Err(err);
    }
    Ok(cell)
}
