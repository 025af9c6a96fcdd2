//! Notebook aggregate: an ordered list of cell wrappers kept index-aligned
//! with the replicated cell list.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   state/               ← Map (see `document`)
//!   meta/                ← Map
//!     metadata: Str      ← JSON object
//!     nbformat: Int
//!     nbformat_minor: Int
//!   cells/               ← List of cell Maps (see `cell`)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use crdt_adapter::{
    child_id, push_op, read_i64, read_str, ChangeBatch, Delta, DeltaOp, Emitter, Entry, ObjId,
    ObjType, Presence, ReadDoc, Replica, StackEvent, Subscription, SyncMessage, SyncState, Txn,
    ROOT,
};
use log::{error, info, warn};
use serde_json::Value;

use crate::cell::{
    create_standalone_cell, from_map, into_object, resolve_kind, write_cell, Attachment,
    CellHandle, Owner, CELL_TYPE,
};
use crate::changes::{
    diff_metadata, ListChange, ListChangeType, MapChange, NbformatChange, NotebookChange,
    ValueChange,
};
use crate::document::{decode_entry, read_json, SharedDocument};
use crate::error::{ModelError, Result};
use crate::options::NotebookOptions;
use crate::record::{
    default_nbformat, default_nbformat_minor, CellKind, CellRecord, Metadata, NotebookRecord,
};

const META: &str = "meta";
const CELLS: &str = "cells";
const METADATA: &str = "metadata";
const NBFORMAT: &str = "nbformat";
const NBFORMAT_MINOR: &str = "nbformat_minor";

fn notebook_schema(txn: &Txn<'_>) -> crdt_adapter::Result<()> {
    let meta = txn.put_object(&ROOT, META, ObjType::Map)?;
    txn.put(&meta, METADATA, "{}")?;
    txn.put(&meta, NBFORMAT, default_nbformat())?;
    txn.put(&meta, NBFORMAT_MINOR, default_nbformat_minor())?;
    txn.put_object(&ROOT, CELLS, ObjType::List)?;
    Ok(())
}

pub(crate) struct NotebookInner {
    doc: SharedDocument,
    cells_list: ObjId,
    meta: ObjId,
    options: NotebookOptions,
    cells: RefCell<Vec<CellHandle>>,
    /// Cell map id → the one live wrapper for it.
    table: RefCell<HashMap<ObjId, CellHandle>>,
    changed: Emitter<NotebookChange>,
    cells_changed: Emitter<ListChange>,
    metadata_changed: Emitter<MapChange>,
    undo_changed: Emitter<bool>,
    redo_changed: Emitter<bool>,
    can_undo: Cell<bool>,
    can_redo: Cell<bool>,
    subscriptions: RefCell<Vec<Subscription>>,
}

/// A collaborative notebook. Clones share the same underlying notebook.
#[derive(Clone)]
pub struct Notebook {
    inner: Rc<NotebookInner>,
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notebook")
            .field("cells", &self.inner.cells.borrow().len())
            .field("disposed", &self.inner.doc.is_disposed())
            .finish()
    }
}

impl Notebook {
    pub(crate) fn from_inner(inner: Rc<NotebookInner>) -> Self {
        Self { inner }
    }

    /// An empty notebook with default metadata (`nbformat` 4.5).
    pub fn new(options: NotebookOptions) -> Result<Self> {
        let doc = SharedDocument::with_schema(notebook_schema)?;
        Self::from_document(doc, options)
    }

    /// Load a notebook saved with [`Notebook::save`].
    pub fn load(bytes: &[u8], options: NotebookOptions) -> Result<Self> {
        Self::from_document(SharedDocument::load(bytes)?, options)
    }

    /// Load from `path`, or create an empty notebook if it does not exist.
    ///
    /// A file that cannot be read or decoded is renamed to
    /// `{path}.automerge.corrupt` and a fresh notebook is created.
    pub fn load_or_create(path: &Path, options: NotebookOptions) -> Result<Self> {
        if path.exists() {
            match std::fs::read(path) {
                Ok(data) => match Self::load(&data, options) {
                    Ok(notebook) => {
                        info!("[notebook] Loaded from {:?}", path);
                        return Ok(notebook);
                    }
                    Err(e) => {
                        warn!(
                            "[notebook] Corrupt doc at {:?}: {}. \
                             Preserving as .corrupt and creating fresh doc.",
                            path, e
                        );
                        preserve_corrupt(path);
                    }
                },
                Err(e) => {
                    warn!(
                        "[notebook] Failed to read {:?}: {}. \
                         Preserving as .corrupt and creating fresh doc.",
                        path, e
                    );
                    preserve_corrupt(path);
                }
            }
        }
        info!("[notebook] Creating new doc (path: {:?})", path);
        Self::new(options)
    }

    /// Build a notebook from a record. Nothing written here is undoable.
    pub fn from_record(record: &NotebookRecord, options: NotebookOptions) -> Result<Self> {
        let notebook = Self::new(options)?;
        notebook.set_nbformat(record.nbformat)?;
        notebook.set_nbformat_minor(record.nbformat_minor)?;
        notebook.set_metadata(record.metadata.clone())?;
        notebook.inner.insert_records(0, &record.cells, false)?;
        Ok(notebook)
    }

    /// Wrap a document that already carries the notebook schema.
    pub fn from_document(doc: SharedDocument, options: NotebookOptions) -> Result<Self> {
        let (cells_list, meta) = doc.replica().read(|d| {
            (
                child_id(d, ROOT, CELLS, ObjType::List),
                child_id(d, ROOT, META, ObjType::Map),
            )
        });
        let cells_list =
            cells_list.ok_or_else(|| ModelError::InvalidSchema("missing cells list".into()))?;
        let meta = meta.ok_or_else(|| ModelError::InvalidSchema("missing meta map".into()))?;
        doc.undo_manager().add_to_scope(&cells_list)?;

        let inner = Rc::new(NotebookInner {
            doc,
            cells_list,
            meta,
            options,
            cells: RefCell::new(Vec::new()),
            table: RefCell::new(HashMap::new()),
            changed: Emitter::new(),
            cells_changed: Emitter::new(),
            metadata_changed: Emitter::new(),
            undo_changed: Emitter::new(),
            redo_changed: Emitter::new(),
            can_undo: Cell::new(false),
            can_redo: Cell::new(false),
            subscriptions: RefCell::new(Vec::new()),
        });
        inner.materialize()?;
        inner.subscribe()?;
        Ok(Self { inner })
    }

    pub fn document(&self) -> &SharedDocument {
        &self.inner.doc
    }

    pub fn presence(&self) -> &Rc<Presence> {
        self.inner.doc.presence()
    }

    pub fn options(&self) -> NotebookOptions {
        self.inner.options
    }

    pub fn disable_document_wide_undo_redo(&self) -> bool {
        self.inner.options.disable_document_wide_undo_redo
    }

    // ── Cells ────────────────────────────────────────────────────────────

    pub fn cells(&self) -> Vec<CellHandle> {
        self.inner.cells.borrow().clone()
    }

    pub fn cell_count(&self) -> usize {
        self.inner.cells.borrow().len()
    }

    /// The cell at `index`, or `None` (with a warning) when out of range.
    pub fn get_cell(&self, index: usize) -> Option<CellHandle> {
        let cell = self.inner.cells.borrow().get(index).cloned();
        if cell.is_none() {
            warn!(
                "[notebook] No cell at index {} ({} cells)",
                index,
                self.cell_count()
            );
        }
        cell
    }

    pub fn add_cell(&self, record: &CellRecord) -> Result<CellHandle> {
        self.insert_cell(self.cell_count(), record)
    }

    pub fn insert_cell(&self, index: usize, record: &CellRecord) -> Result<CellHandle> {
        self.insert_cells(index, std::slice::from_ref(record))?
            .pop()
            .ok_or_else(|| ModelError::InvalidSchema("no cell was inserted".into()))
    }

    /// Insert cells for `records` at `index` as one undoable change.
    pub fn insert_cells(&self, index: usize, records: &[CellRecord]) -> Result<Vec<CellHandle>> {
        self.inner.insert_records(index, records, true)
    }

    /// Move the cell at `from` so it ends up at `to`.
    ///
    /// The cell is copied, deleted and reinserted in one change, so the moved
    /// cell gets a new wrapper.
    pub fn move_cell(&self, from: usize, to: usize) -> Result<()> {
        let inner = &self.inner;
        inner.doc.ensure_live()?;
        let len = self.cell_count();
        for index in [from, to] {
            if index >= len {
                return Err(ModelError::InvalidIndex { index, len });
            }
        }
        if from == to {
            return Ok(());
        }
        let (record, kind) = {
            let cells = inner.cells.borrow();
            (cells[from].to_json(), cells[from].kind())
        };

        let mut moved = None;
        inner.doc.transact(true, |txn| {
            txn.delete_range(&inner.cells_list, from, 1)?;
            let map = write_cell(txn, &inner.cells_list, to, &record, kind)?;
            let cell = from_map(txn.replica(), &map, kind, inner.owner());
            inner.table.borrow_mut().insert(map, cell.clone());
            moved = Some(cell);
            Ok(())
        })?;
        if let Some(cell) = moved {
            cell.set_undo_manager()?;
        }
        Ok(())
    }

    pub fn delete_cell(&self, index: usize) -> Result<()> {
        self.delete_cell_range(index, index + 1)
    }

    /// Delete cells `from..to` as one undoable change.
    pub fn delete_cell_range(&self, from: usize, to: usize) -> Result<()> {
        let inner = &self.inner;
        inner.doc.ensure_live()?;
        let len = self.cell_count();
        if from > to || to > len {
            return Err(ModelError::InvalidRange {
                start: from,
                end: to,
                len,
            });
        }
        if from == to {
            return Ok(());
        }
        inner
            .doc
            .transact(true, |txn| Ok(txn.delete_range(&inner.cells_list, from, to - from)?))
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    pub fn get_metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    pub fn get_metadata_key(&self, key: &str) -> Option<Value> {
        self.get_metadata().remove(key)
    }

    /// Replace the whole metadata object. Not undoable.
    pub fn set_metadata(&self, metadata: Metadata) -> Result<()> {
        self.inner.write_metadata(metadata)
    }

    /// Set one key. `None` is rejected; use [`Notebook::delete_metadata`].
    pub fn set_metadata_key(&self, key: &str, value: Option<Value>) -> Result<()> {
        let value = value.ok_or_else(|| ModelError::MetadataValueUndefined(key.to_string()))?;
        let mut update = Metadata::new();
        update.insert(key.to_string(), value);
        self.update_metadata(update)
    }

    /// Shallow-merge `update` into the metadata.
    pub fn update_metadata(&self, update: Metadata) -> Result<()> {
        let mut next = self.get_metadata();
        next.extend(update);
        self.inner.write_metadata(next)
    }

    pub fn delete_metadata(&self, key: &str) -> Result<()> {
        let mut next = self.get_metadata();
        if next.remove(key).is_none() {
            return Ok(());
        }
        self.inner.write_metadata(next)
    }

    pub fn nbformat(&self) -> i64 {
        self.inner
            .read_int(NBFORMAT)
            .unwrap_or_else(default_nbformat)
    }

    pub fn set_nbformat(&self, value: i64) -> Result<()> {
        self.inner.write_int(NBFORMAT, value)
    }

    pub fn nbformat_minor(&self) -> i64 {
        self.inner
            .read_int(NBFORMAT_MINOR)
            .unwrap_or_else(default_nbformat_minor)
    }

    pub fn set_nbformat_minor(&self, value: i64) -> Result<()> {
        self.inner.write_int(NBFORMAT_MINOR, value)
    }

    pub fn to_record(&self) -> NotebookRecord {
        NotebookRecord {
            cells: self.cells().iter().map(|cell| cell.to_json()).collect(),
            metadata: self.get_metadata(),
            nbformat: self.nbformat(),
            nbformat_minor: self.nbformat_minor(),
        }
    }

    // ── Undo ─────────────────────────────────────────────────────────────

    pub fn undo(&self) -> Result<()> {
        self.inner.doc.undo()
    }

    pub fn redo(&self) -> Result<()> {
        self.inner.doc.redo()
    }

    pub fn can_undo(&self) -> bool {
        self.inner.doc.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.doc.can_redo()
    }

    pub fn clear_undo_history(&self) -> Result<()> {
        self.inner.doc.clear_undo_history()
    }

    // ── Events ───────────────────────────────────────────────────────────

    pub fn on_changed(&self, f: impl Fn(&NotebookChange) + 'static) -> Subscription {
        self.inner.changed.subscribe(f)
    }

    /// One event per contiguous run of inserted or removed cells.
    pub fn on_cells_changed(&self, f: impl Fn(&ListChange) + 'static) -> Subscription {
        self.inner.cells_changed.subscribe(f)
    }

    pub fn on_metadata_changed(&self, f: impl Fn(&MapChange) + 'static) -> Subscription {
        self.inner.metadata_changed.subscribe(f)
    }

    /// Fires when `can_undo` flips.
    pub fn on_undo_changed(&self, f: impl Fn(&bool) + 'static) -> Subscription {
        self.inner.undo_changed.subscribe(f)
    }

    /// Fires when `can_redo` flips.
    pub fn on_redo_changed(&self, f: impl Fn(&bool) + 'static) -> Subscription {
        self.inner.redo_changed.subscribe(f)
    }

    // ── Persistence and replication ──────────────────────────────────────

    pub fn save(&self) -> Result<Vec<u8>> {
        Ok(self.inner.doc.replica().save()?)
    }

    pub fn save_incremental(&self) -> Result<Vec<u8>> {
        Ok(self.inner.doc.replica().save_incremental()?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self.save()?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<usize> {
        Ok(self.inner.doc.replica().apply_update(update)?)
    }

    /// Pull in every change `other` has that this notebook lacks.
    pub fn merge_from(&self, other: &Notebook) -> Result<()> {
        Ok(self
            .inner
            .doc
            .replica()
            .merge(other.inner.doc.replica())?)
    }

    pub fn generate_sync_message(&self, peer: &mut SyncState) -> Result<Option<SyncMessage>> {
        Ok(self.inner.doc.replica().generate_sync_message(peer)?)
    }

    pub fn receive_sync_message(&self, peer: &mut SyncState, message: SyncMessage) -> Result<()> {
        Ok(self
            .inner
            .doc
            .replica()
            .receive_sync_message(peer, message)?)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.doc.is_disposed()
    }

    /// Dispose every cell wrapper, then the document. Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.doc.is_disposed() {
            return;
        }
        inner.subscriptions.borrow_mut().clear();
        let cells = std::mem::take(&mut *inner.cells.borrow_mut());
        inner.table.borrow_mut().clear();
        for cell in &cells {
            cell.dispose();
        }
        inner.changed.clear();
        inner.cells_changed.clear();
        inner.metadata_changed.clear();
        inner.undo_changed.clear();
        inner.redo_changed.clear();
        inner.doc.dispose();
    }
}

/// Rename a corrupt persisted file to `{path}.automerge.corrupt` for diagnostics.
fn preserve_corrupt(path: &Path) {
    let corrupt_path = path.with_extension("automerge.corrupt");
    if let Err(e) = std::fs::rename(path, &corrupt_path) {
        warn!(
            "[notebook] Failed to rename corrupt file {:?} → {:?}: {}",
            path, corrupt_path, e
        );
    } else {
        warn!("[notebook] Corrupt file preserved at {:?}", corrupt_path);
    }
}

impl NotebookInner {
    fn owner(self: &Rc<Self>) -> Owner {
        Owner::Attached(Attachment {
            notebook: Rc::downgrade(self),
            doc_origin: self.doc.origin(),
            doc_manager: Rc::clone(self.doc.undo_manager()),
            per_cell: self.options.disable_document_wide_undo_redo,
            presence: Rc::clone(self.doc.presence()),
        })
    }

    fn replica(&self) -> &Replica {
        self.doc.replica()
    }

    /// Wrap every cell already in the document. Unknown cell types are fatal here.
    fn materialize(self: &Rc<Self>) -> Result<()> {
        let maps = self.replica().read(|d| {
            (0..d.length(&self.cells_list))
                .map(|index| {
                    let map = child_id(d, &self.cells_list, index, ObjType::Map);
                    let cell_type = map.as_ref().and_then(|map| read_str(d, map, CELL_TYPE));
                    (index, map, cell_type)
                })
                .collect::<Vec<_>>()
        });

        let mut cells = Vec::with_capacity(maps.len());
        for (index, map, cell_type) in maps {
            let map = map.ok_or_else(|| {
                ModelError::InvalidSchema(format!("cell list entry {index} is not a map"))
            })?;
            let cell_type = cell_type.unwrap_or_default();
            let kind = resolve_kind(&cell_type, self.options.cell_type_adaptor)?;
            let cell = from_map(self.replica(), &map, kind, self.owner());
            cell.set_undo_manager()?;
            self.table.borrow_mut().insert(map, cell.clone());
            cells.push(cell);
        }
        *self.cells.borrow_mut() = cells;
        Ok(())
    }

    fn subscribe(self: &Rc<Self>) -> Result<()> {
        let weak = Rc::downgrade(self);
        let mut subscriptions = vec![
            self.replica().observe(&self.cells_list, {
                let weak = weak.clone();
                move |batch| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_cells_changed(batch);
                    }
                }
            }),
            self.replica().observe(&self.meta, {
                let weak = weak.clone();
                move |batch| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_meta_changed(batch);
                    }
                }
            }),
            self.doc.on_state_change({
                let weak = weak.clone();
                move |changes| {
                    if let Some(inner) = weak.upgrade() {
                        inner.changed.emit(&NotebookChange {
                            state_change: Some(changes.clone()),
                            ..Default::default()
                        });
                    }
                }
            }),
        ];
        subscriptions.push(self.doc.undo_manager().on_stack_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_stack_event(event);
            }
        })?);
        *self.subscriptions.borrow_mut() = subscriptions;
        self.can_undo.set(self.doc.can_undo());
        self.can_redo.set(self.doc.can_redo());
        Ok(())
    }

    fn insert_records(
        self: &Rc<Self>,
        index: usize,
        records: &[CellRecord],
        undoable: bool,
    ) -> Result<Vec<CellHandle>> {
        self.doc.ensure_live()?;
        let len = self.cells.borrow().len();
        if index > len {
            return Err(ModelError::InvalidIndex { index, len });
        }
        let kinds = records
            .iter()
            .map(|record| resolve_kind(&record.cell_type, self.options.cell_type_adaptor))
            .collect::<Result<Vec<CellKind>>>()?;

        let mut created: Vec<CellHandle> = Vec::with_capacity(records.len());
        let written = self.doc.transact(undoable, |txn| {
            for (offset, (record, kind)) in records.iter().zip(&kinds).enumerate() {
                let map = write_cell(txn, &self.cells_list, index + offset, record, *kind)?;
                let cell = from_map(txn.replica(), &map, *kind, self.owner());
                self.table.borrow_mut().insert(map, cell.clone());
                created.push(cell);
            }
            Ok(())
        });
        if let Err(err) = written {
            {
                let mut table = self.table.borrow_mut();
                for cell in &created {
                    table.remove(cell.map_id());
                }
            }
            for cell in &created {
                cell.dispose();
            }
            return Err(err);
        }

        for cell in &created {
            cell.set_undo_manager()?;
        }
        Ok(created)
    }

    /// The wrapper for a cell list entry, created on first sight.
    ///
    /// Every entry gets a wrapper so `cells` stays index-aligned with the
    /// replicated list. A non-map entry gets a detached raw placeholder.
    fn resolve_wrapper(self: &Rc<Self>, entry: &Entry) -> Option<CellHandle> {
        let Some(map) = entry.object() else {
            error!("[notebook] Cell list holds a non-map entry: {:?}", entry);
            return match create_standalone_cell(&CellRecord::raw("")) {
                Ok(placeholder) => Some(placeholder),
                Err(e) => {
                    error!("[notebook] Could not create a placeholder cell: {}", e);
                    None
                }
            };
        };
        if let Some(existing) = self.table.borrow().get(map) {
            return Some(existing.clone());
        }

        let cell_type = self
            .replica()
            .read(|d| read_str(d, map, CELL_TYPE))
            .unwrap_or_default();
        let kind = match resolve_kind(&cell_type, self.options.cell_type_adaptor) {
            Ok(kind) => kind,
            Err(e) => {
                error!("[notebook] {} in a replicated cell; wrapping it as raw", e);
                CellKind::Raw
            }
        };
        let cell = from_map(self.replica(), map, kind, self.owner());
        if let Err(e) = cell.set_undo_manager() {
            warn!("[notebook] Could not bind undo manager for {}: {}", cell.id(), e);
        }
        self.table.borrow_mut().insert(map.clone(), cell.clone());
        Some(cell)
    }

    fn on_cells_changed(self: &Rc<Self>, batch: &ChangeBatch) {
        let Some(delta) = batch.list_delta(&self.cells_list) else {
            return;
        };

        let mut index = 0;
        let mut runs = Vec::new();
        let mut removed = Vec::new();
        let mut cells_change: Delta<Vec<CellHandle>> = Vec::new();
        for op in delta {
            match op {
                DeltaOp::Retain(n) => {
                    index += n;
                    push_op(&mut cells_change, DeltaOp::Retain(*n));
                }
                DeltaOp::Insert(entries) => {
                    let inserted: Vec<CellHandle> = entries
                        .iter()
                        .filter_map(|entry| self.resolve_wrapper(entry))
                        .collect();
                    self.cells
                        .borrow_mut()
                        .splice(index..index, inserted.iter().cloned());
                    runs.push(ListChange {
                        change_type: ListChangeType::Add,
                        new_index: Some(index),
                        new_values: inserted.clone(),
                        old_index: None,
                        old_values: Vec::new(),
                    });
                    index += inserted.len();
                    push_op(&mut cells_change, DeltaOp::Insert(inserted));
                }
                DeltaOp::Delete(n) => {
                    let old_values: Vec<CellHandle> = {
                        let mut cells = self.cells.borrow_mut();
                        let end = (index + n).min(cells.len());
                        cells.drain(index..end).collect()
                    };
                    {
                        let mut table = self.table.borrow_mut();
                        for cell in &old_values {
                            table.remove(cell.map_id());
                        }
                    }
                    removed.extend(old_values.iter().cloned());
                    runs.push(ListChange {
                        change_type: ListChangeType::Remove,
                        new_index: None,
                        new_values: Vec::new(),
                        old_index: Some(index),
                        old_values,
                    });
                    push_op(&mut cells_change, DeltaOp::Delete(*n));
                }
            }
        }

        for cell in &removed {
            cell.dispose();
        }
        for run in &runs {
            self.cells_changed.emit(run);
        }
        self.changed.emit(&NotebookChange {
            cells_change: Some(cells_change),
            ..Default::default()
        });
    }

    fn on_meta_changed(&self, batch: &ChangeBatch) {
        let Some(keys) = batch.map_change(&self.meta) else {
            return;
        };

        if let Some(change) = keys.get(METADATA) {
            let old_value = decode_entry(change.old.as_ref()).and_then(into_object);
            let new_value = self.metadata();
            for key_change in diff_metadata(&old_value.clone().unwrap_or_default(), &new_value) {
                self.metadata_changed.emit(&key_change);
            }
            self.changed.emit(&NotebookChange {
                metadata_change: Some(ValueChange {
                    old_value,
                    new_value: Some(new_value),
                }),
                ..Default::default()
            });
        }

        for key in [NBFORMAT, NBFORMAT_MINOR] {
            if let Some(change) = keys.get(key) {
                self.changed.emit(&NotebookChange {
                    nbformat_changed: Some(NbformatChange {
                        key: key.to_string(),
                        old_value: change.old.as_ref().and_then(Entry::as_i64),
                        new_value: self.read_int(key),
                    }),
                    ..Default::default()
                });
            }
        }
    }

    fn on_stack_event(&self, _event: &StackEvent) {
        let can_redo = self.doc.can_redo();
        if self.can_redo.replace(can_redo) != can_redo {
            self.redo_changed.emit(&can_redo);
        }
        let can_undo = self.doc.can_undo();
        if self.can_undo.replace(can_undo) != can_undo {
            self.undo_changed.emit(&can_undo);
        }
    }

    fn metadata(&self) -> Metadata {
        self.replica()
            .read(|d| read_json(d, &self.meta, METADATA))
            .and_then(into_object)
            .unwrap_or_default()
    }

    fn write_metadata(&self, next: Metadata) -> Result<()> {
        self.doc.ensure_live()?;
        if self.metadata() == next {
            return Ok(());
        }
        let encoded = serde_json::to_string(&next)?;
        self.doc
            .transact(false, |txn| Ok(txn.put(&self.meta, METADATA, encoded)?))
    }

    fn read_int(&self, key: &str) -> Option<i64> {
        self.replica().read(|d| read_i64(d, &self.meta, key))
    }

    fn write_int(&self, key: &str, value: i64) -> Result<()> {
        self.doc.ensure_live()?;
        if self.read_int(key) == Some(value) {
            return Ok(());
        }
        self.doc
            .transact(false, |txn| Ok(txn.put(&self.meta, key, value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::MapChangeType;
    use serde_json::json;

    fn notebook() -> Notebook {
        Notebook::new(NotebookOptions::default()).unwrap()
    }

    fn ids(notebook: &Notebook) -> Vec<String> {
        notebook
            .cells()
            .iter()
            .map(|cell| cell.id().to_string())
            .collect()
    }

    fn raw_ids(notebook: &Notebook) -> Vec<String> {
        let inner = &notebook.inner;
        inner.replica().read(|d| {
            (0..d.length(&inner.cells_list))
                .filter_map(|i| child_id(d, &inner.cells_list, i, ObjType::Map))
                .filter_map(|map| read_str(d, &map, "id"))
                .collect()
        })
    }

    #[test]
    fn test_new_notebook_defaults() {
        let nb = notebook();
        assert_eq!(nb.cell_count(), 0);
        assert_eq!(nb.nbformat(), 4);
        assert_eq!(nb.nbformat_minor(), 5);
        assert!(nb.get_metadata().is_empty());
        assert!(!nb.can_undo());
    }

    #[test]
    fn test_insert_cells_creates_wrappers() {
        let nb = notebook();
        let cells = nb
            .insert_cells(0, &[CellRecord::code("1+1"), CellRecord::code("2+2")])
            .unwrap();
        assert_eq!(nb.cell_count(), 2);
        assert_ne!(cells[0].id(), cells[1].id());
        assert!(Rc::ptr_eq(&cells[0], &nb.cells()[0]));
        assert!(!cells[0].is_standalone());
        assert_eq!(cells[0].as_code().unwrap().execution_count(), None);
        assert_eq!(ids(&nb), raw_ids(&nb));
    }

    #[test]
    fn test_unknown_type_fails_before_writing() {
        let nb = notebook();
        let err = nb
            .insert_cells(0, &[CellRecord::code("ok"), CellRecord::new("sql", "no")])
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownCellType(_)));
        assert_eq!(nb.cell_count(), 0);
        assert!(!nb.can_undo());
    }

    #[test]
    fn test_get_cell_out_of_range_is_none() {
        let nb = notebook();
        nb.add_cell(&CellRecord::markdown("# title")).unwrap();
        assert!(nb.get_cell(0).is_some());
        assert!(nb.get_cell(1).is_none());
    }

    #[test]
    fn test_delete_disposes_wrappers() {
        let nb = notebook();
        let cells = nb
            .insert_cells(
                0,
                &[CellRecord::code("a"), CellRecord::code("b"), CellRecord::code("c")],
            )
            .unwrap();
        nb.delete_cell_range(0, 2).unwrap();
        assert!(cells[0].is_disposed());
        assert!(cells[1].is_disposed());
        assert!(!cells[2].is_disposed());
        assert_eq!(ids(&nb), vec![cells[2].id().to_string()]);
        assert_eq!(nb.inner.table.borrow().len(), 1);
        assert!(matches!(
            nb.delete_cell_range(1, 3),
            Err(ModelError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_move_cell_keeps_content_and_id() {
        let nb = notebook();
        let cells = nb
            .insert_cells(
                0,
                &[CellRecord::code("a"), CellRecord::markdown("b"), CellRecord::raw("c")],
            )
            .unwrap();
        let moved_id = cells[0].id().to_string();
        nb.move_cell(0, 2).unwrap();

        let after = nb.cells();
        assert_eq!(after.len(), 3);
        assert_eq!(after[2].id(), moved_id);
        assert_eq!(after[2].source(), "a");
        assert!(!Rc::ptr_eq(&after[2], &cells[0]));
        assert!(cells[0].is_disposed());
        assert_eq!(ids(&nb), raw_ids(&nb));

        nb.undo().unwrap();
        assert_eq!(
            nb.cells().iter().map(|c| c.source()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_cells_changed_runs() {
        let nb = notebook();
        nb.insert_cells(0, &[CellRecord::code("a"), CellRecord::code("b")])
            .unwrap();
        let runs = Rc::new(RefCell::new(Vec::new()));
        let sink = runs.clone();
        let _sub = nb.on_cells_changed(move |change| {
            sink.borrow_mut().push((
                change.change_type,
                change.new_index,
                change.old_index,
                change.new_values.len() + change.old_values.len(),
            ))
        });

        nb.insert_cell(1, &CellRecord::markdown("# hi")).unwrap();
        nb.delete_cell(0).unwrap();

        assert_eq!(
            *runs.borrow(),
            vec![
                (ListChangeType::Add, Some(1), None, 1),
                (ListChangeType::Remove, None, Some(0), 1),
            ]
        );
    }

    #[test]
    fn test_notebook_metadata_events() {
        let nb = notebook();
        let keys = Rc::new(RefCell::new(Vec::new()));
        let sink = keys.clone();
        let _sub = nb.on_metadata_changed(move |change| {
            sink.borrow_mut().push((change.change_type, change.key.clone()))
        });

        nb.set_metadata_key("language_info", Some(json!({"name": "python"})))
            .unwrap();
        nb.set_metadata_key("language_info", Some(json!({"name": "python"})))
            .unwrap();
        nb.update_metadata(into_object(json!({"kernelspec": {"name": "python3"}})).unwrap())
            .unwrap();
        nb.delete_metadata("language_info").unwrap();

        assert_eq!(
            *keys.borrow(),
            vec![
                (MapChangeType::Add, "language_info".to_string()),
                (MapChangeType::Add, "kernelspec".to_string()),
                (MapChangeType::Remove, "language_info".to_string()),
            ]
        );
        assert!(!nb.can_undo());
        assert!(matches!(
            nb.set_metadata_key("x", None),
            Err(ModelError::MetadataValueUndefined(_))
        ));
    }

    #[test]
    fn test_nbformat_changes_fire_separately() {
        let nb = notebook();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _sub = nb.on_changed(move |change| {
            if let Some(nbformat) = &change.nbformat_changed {
                sink.borrow_mut().push(nbformat.clone());
            }
        });

        nb.set_nbformat_minor(4).unwrap();
        nb.set_nbformat_minor(4).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![NbformatChange {
                key: "nbformat_minor".into(),
                old_value: Some(5),
                new_value: Some(4)
            }]
        );
    }

    #[test]
    fn test_undo_redo_flags_fire_on_flip() {
        let nb = notebook();
        let flips = Rc::new(RefCell::new(Vec::new()));
        let undo_sink = flips.clone();
        let _undo = nb.on_undo_changed(move |v| undo_sink.borrow_mut().push(("undo", *v)));
        let redo_sink = flips.clone();
        let _redo = nb.on_redo_changed(move |v| redo_sink.borrow_mut().push(("redo", *v)));

        nb.add_cell(&CellRecord::code("a")).unwrap();
        nb.add_cell(&CellRecord::code("b")).unwrap();
        nb.undo().unwrap();

        assert_eq!(
            *flips.borrow(),
            vec![("undo", true), ("redo", true)]
        );
    }

    #[test]
    fn test_per_cell_undo_is_independent() {
        let nb = Notebook::new(NotebookOptions::default().per_cell_undo()).unwrap();
        let cells = nb
            .insert_cells(0, &[CellRecord::code("a"), CellRecord::code("b")])
            .unwrap();
        nb.clear_undo_history().unwrap();

        cells[0].set_source("a1").unwrap();
        cells[1].set_source("b1").unwrap();
        assert!(!nb.can_undo());

        cells[0].undo().unwrap();
        assert_eq!(cells[0].source(), "a");
        assert_eq!(cells[1].source(), "b1");
    }

    #[test]
    fn test_document_wide_undo_covers_cell_edits() {
        let nb = notebook();
        let cell = nb.add_cell(&CellRecord::code("x = 1")).unwrap();
        nb.clear_undo_history().unwrap();

        cell.set_source("x = 2").unwrap();
        assert!(nb.can_undo());
        assert!(cell.can_undo());
        nb.undo().unwrap();
        assert_eq!(cell.source(), "x = 1");
    }

    #[test]
    fn test_record_round_trip() {
        let record: NotebookRecord = serde_json::from_value(json!({
            "cells": [
                {"id": "a", "cell_type": "markdown", "source": "# T", "metadata": {}},
                {"id": "b", "cell_type": "code", "source": ["x = 1\n", "x"],
                 "metadata": {"collapsed": false, "jupyter": {"outputs_hidden": false}},
                 "outputs": [], "execution_count": null}
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 4
        }))
        .unwrap();

        let nb = Notebook::from_record(&record, NotebookOptions::default()).unwrap();
        assert!(!nb.can_undo());
        assert_eq!(nb.to_record(), record);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let nb = notebook();
        let cell = nb.add_cell(&CellRecord::code("")).unwrap();
        nb.dispose();
        nb.dispose();
        assert!(nb.is_disposed());
        assert!(cell.is_disposed());
        assert!(matches!(
            nb.add_cell(&CellRecord::code("")),
            Err(ModelError::Disposed)
        ));
    }
}
