//! Notebook behavior end to end: local edits, undo, replication and persistence.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crdt_adapter::{child_id, ObjType, ROOT};
use serde_json::json;
use shared_model::{
    create_standalone_cell, CellRecord, ListChangeType, Metadata, ModelError, Notebook,
    NotebookOptions, NotebookRecord, SyncState,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn notebook() -> Notebook {
    Notebook::new(NotebookOptions::default()).unwrap()
}

fn meta(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn ids(notebook: &Notebook) -> Vec<String> {
    notebook
        .cells()
        .iter()
        .map(|cell| cell.id().to_string())
        .collect()
}

fn sync_pair(a: &Notebook, b: &Notebook) {
    let mut a_state = SyncState::new();
    let mut b_state = SyncState::new();
    for _ in 0..10 {
        if let Some(msg) = a.generate_sync_message(&mut a_state).unwrap() {
            b.receive_sync_message(&mut b_state, msg).unwrap();
        }
        if let Some(msg) = b.generate_sync_message(&mut b_state).unwrap() {
            a.receive_sync_message(&mut a_state, msg).unwrap();
        }
    }
}

#[test]
fn test_insert_two_code_cells() {
    init_logging();
    let nb = notebook();
    let cells = nb
        .insert_cells(0, &[CellRecord::code("1+1"), CellRecord::code("2+2")])
        .unwrap();

    assert_eq!(nb.cell_count(), 2);
    assert_ne!(cells[0].id(), cells[1].id());
    for cell in &cells {
        let code = cell.as_code().unwrap();
        assert!(code.outputs().is_empty());
        assert_eq!(code.execution_count(), None);
    }
    let record = cells[0].to_json();
    assert_eq!(record.outputs, Some(vec![]));
    assert_eq!(record.execution_count, Some(None));
}

#[test]
fn test_collapsed_sets_outputs_hidden() {
    let nb = notebook();
    let cell = nb.add_cell(&CellRecord::code("x")).unwrap();
    cell.set_metadata_key("collapsed", Some(json!(true))).unwrap();

    let metadata = cell.get_metadata();
    assert_eq!(metadata["collapsed"], json!(true));
    assert_eq!(metadata["jupyter"]["outputs_hidden"], json!(true));
}

#[test]
fn test_delete_collapsed_leaves_empty_metadata() {
    let nb = notebook();
    let cell = nb
        .add_cell(&CellRecord::code("x").with_metadata(meta(json!({"collapsed": true}))))
        .unwrap();
    cell.delete_metadata("collapsed").unwrap();
    assert!(cell.get_metadata().is_empty());
}

#[test]
fn test_insert_between_cells() {
    let nb = notebook();
    let cells = nb
        .insert_cells(0, &[CellRecord::code("a"), CellRecord::code("b")])
        .unwrap();
    let inserted = nb.insert_cell(1, &CellRecord::markdown("# hi")).unwrap();
    assert_eq!(
        ids(&nb),
        vec![
            cells[0].id().to_string(),
            inserted.id().to_string(),
            cells[1].id().to_string()
        ]
    );
}

#[test]
fn test_undo_insert_removes_at_insertion_index() {
    let nb = notebook();
    nb.insert_cells(0, &[CellRecord::code("a"), CellRecord::code("b")])
        .unwrap();
    nb.clear_undo_history().unwrap();
    let inserted = nb.insert_cell(1, &CellRecord::raw("r")).unwrap();

    let removals = Rc::new(RefCell::new(Vec::new()));
    let sink = removals.clone();
    let _sub = nb.on_cells_changed(move |change| {
        if change.change_type == ListChangeType::Remove {
            sink.borrow_mut().push((change.old_index, change.old_values.len()));
        }
    });

    nb.undo().unwrap();
    assert_eq!(*removals.borrow(), vec![(Some(1), 1)]);
    assert_eq!(nb.cell_count(), 2);
    assert!(inserted.is_disposed());

    nb.redo().unwrap();
    assert_eq!(nb.cell_count(), 3);
    assert_eq!(nb.cells()[1].source(), "r");
    assert_eq!(nb.cells()[1].id(), inserted.id());
}

#[test]
fn test_undo_steps_back_past_restored_cell() {
    let nb = notebook();
    nb.add_cell(&CellRecord::code("x")).unwrap();
    nb.delete_cell(0).unwrap();

    nb.undo().unwrap();
    assert_eq!(nb.cell_count(), 1);
    assert_eq!(nb.cells()[0].source(), "x");

    nb.undo().unwrap();
    assert_eq!(nb.cell_count(), 0);
    assert!(!nb.can_undo());

    nb.redo().unwrap();
    nb.redo().unwrap();
    assert_eq!(nb.cell_count(), 0);
    nb.undo().unwrap();
    assert_eq!(nb.cell_count(), 1);
}

#[test]
fn test_standalone_source_undo_past_cleared_text() {
    let cell = create_standalone_cell(&CellRecord::code("")).unwrap();
    cell.set_source("abc").unwrap();
    cell.set_source("").unwrap();

    cell.undo().unwrap();
    assert_eq!(cell.source(), "abc");
    cell.undo().unwrap();
    assert_eq!(cell.source(), "");
    assert!(!cell.can_undo());
}

#[test]
fn test_cell_event_sees_deletion_from_same_transaction() {
    let original = notebook();
    original
        .insert_cells(0, &[CellRecord::code("a"), CellRecord::code("b")])
        .unwrap();
    let nb = Notebook::load(&original.save().unwrap(), NotebookOptions::default()).unwrap();
    let cells = nb.cells();

    let seen = Rc::new(Cell::new(None));
    let sink = seen.clone();
    let observed = nb.clone();
    let _sub = cells[1].on_changed(move |_| sink.set(Some(observed.cell_count())));

    nb.document()
        .transact(true, |_| {
            nb.delete_cell(0)?;
            cells[1].set_source("b = 2")?;
            Ok(())
        })
        .unwrap();

    assert_eq!(seen.get(), Some(1));
    assert!(cells[0].is_disposed());
    assert_eq!(nb.cells()[0].source(), "b = 2");
}

#[test]
fn test_bare_remote_cell_map_stays_aligned() {
    init_logging();
    let nb = notebook();
    let kept = nb.add_cell(&CellRecord::code("a").with_id("a")).unwrap();
    let list = nb
        .document()
        .replica()
        .read(|doc| child_id(doc, ROOT, "cells", ObjType::List))
        .unwrap();

    nb.document()
        .transact(false, |txn| {
            let map = txn.insert_object(&list, 0, ObjType::Map)?;
            txn.put(&map, "id", "bare")?;
            txn.put(&map, "cell_type", "code")?;
            Ok(())
        })
        .unwrap();

    assert_eq!(nb.document().replica().length(&list), nb.cell_count());
    assert_eq!(ids(&nb), vec!["bare".to_string(), "a".to_string()]);
    let bare = nb.get_cell(0).unwrap();
    assert_eq!(bare.source(), "");
    assert!(bare.as_code().unwrap().outputs().is_empty());

    bare.set_source("filled").unwrap();
    assert_eq!(bare.source(), "filled");

    nb.delete_cell(0).unwrap();
    assert!(bare.is_disposed());
    assert!(!kept.is_disposed());
    assert_eq!(ids(&nb), vec!["a".to_string()]);
}

#[test]
fn test_outputs_never_touch_undo_state() {
    let nb = notebook();
    let cell = nb.add_cell(&CellRecord::code("print(1)")).unwrap();
    nb.clear_undo_history().unwrap();

    let flips = Rc::new(Cell::new(0));
    let counter = flips.clone();
    let _sub = nb.on_undo_changed(move |_| counter.set(counter.get() + 1));

    let code = cell.as_code().unwrap();
    code.set_outputs(&[json!({"output_type": "stream", "name": "stdout", "text": "1\n"})])
        .unwrap();
    code.update_outputs(0, 1, &[]).unwrap();
    code.set_execution_count(Some(7)).unwrap();

    assert_eq!(flips.get(), 0);
    assert!(!nb.can_undo());
}

#[test]
fn test_id_survives_edits() {
    let nb = notebook();
    let cell = nb.add_cell(&CellRecord::code("a").with_id("fixed-id")).unwrap();
    cell.set_source("b").unwrap();
    cell.update_source(0, 1, "c").unwrap();
    cell.set_metadata_key("tags", Some(json!(["t"]))).unwrap();
    cell.delete_metadata("tags").unwrap();
    assert_eq!(cell.id(), "fixed-id");
    assert_eq!(cell.to_json().id.as_deref(), Some("fixed-id"));
}

#[test]
fn test_attached_cell_round_trips_through_standalone() {
    let nb = notebook();
    let cell = nb
        .add_cell(
            &CellRecord::markdown("see ![a](attachment:a.png)")
                .with_attachments(meta(json!({"a.png": {"image/png": "AA=="}}))),
        )
        .unwrap();
    let record = cell.to_json();
    let copy = create_standalone_cell(&record).unwrap();
    assert_eq!(copy.to_json(), record);
}

#[test]
fn test_equal_metadata_is_a_no_op() {
    let nb = notebook();
    let cell = nb
        .add_cell(&CellRecord::code("").with_metadata(meta(json!({"tags": ["x"]}))))
        .unwrap();
    nb.clear_undo_history().unwrap();

    let events = Rc::new(Cell::new(0));
    let counter = events.clone();
    let _sub = cell.on_metadata_changed(move |_| counter.set(counter.get() + 1));
    let save_before = nb.save_incremental().unwrap();

    cell.set_metadata(meta(json!({"tags": ["x"]}))).unwrap();
    cell.set_metadata_key("tags", Some(json!(["x"]))).unwrap();

    assert_eq!(events.get(), 0);
    assert!(!nb.can_undo());
    assert!(!save_before.is_empty());
    assert!(nb.save_incremental().unwrap().is_empty());
}

#[test]
fn test_alignment_after_mixed_edits() {
    let nb = notebook();
    nb.insert_cells(
        0,
        &[
            CellRecord::code("0"),
            CellRecord::code("1"),
            CellRecord::markdown("2"),
            CellRecord::raw("3"),
        ],
    )
    .unwrap();
    nb.move_cell(3, 0).unwrap();
    nb.delete_cell(2).unwrap();
    nb.insert_cell(1, &CellRecord::code("4")).unwrap();
    nb.undo().unwrap();
    nb.undo().unwrap();

    let sources: Vec<String> = nb.cells().iter().map(|c| c.source()).collect();
    assert_eq!(sources, vec!["3", "0", "1", "2"]);

    let reloaded = Notebook::load(&nb.save().unwrap(), NotebookOptions::default()).unwrap();
    assert_eq!(ids(&reloaded), ids(&nb));
}

#[test]
fn test_same_log_converges() {
    let apply = |nb: &Notebook| {
        nb.insert_cells(
            0,
            &[
                CellRecord::code("a").with_id("a"),
                CellRecord::code("b").with_id("b"),
                CellRecord::markdown("c").with_id("c"),
            ],
        )
        .unwrap();
        nb.delete_cell_range(0, 1).unwrap();
        nb.set_metadata(meta(json!({"kernelspec": {"name": "python3"}})))
            .unwrap();
    };
    let left = notebook();
    let right = notebook();
    apply(&left);
    apply(&right);

    assert_eq!(ids(&left), vec!["b", "c"]);
    assert_eq!(left.to_record(), right.to_record());
}

#[test]
fn test_remote_edits_materialize() {
    init_logging();
    let a = notebook();
    let b = notebook();
    let a_cell = a.add_cell(&CellRecord::code("a").with_id("from-a")).unwrap();
    b.add_cell(&CellRecord::markdown("b").with_id("from-b"))
        .unwrap();

    let added = Rc::new(Cell::new(0));
    let counter = added.clone();
    let _sub = b.on_cells_changed(move |change| {
        if change.change_type == ListChangeType::Add {
            counter.set(counter.get() + change.new_values.len());
        }
    });

    sync_pair(&a, &b);
    assert_eq!(added.get(), 1);
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(a.cell_count(), 2);

    let remote_cell = b
        .cells()
        .into_iter()
        .find(|cell| cell.id() == "from-a")
        .unwrap();
    let keys = Rc::new(RefCell::new(Vec::new()));
    let sink = keys.clone();
    let _meta =
        remote_cell.on_metadata_changed(move |change| sink.borrow_mut().push(change.key.clone()));

    a_cell.set_metadata_key("tags", Some(json!(["shared"]))).unwrap();
    a_cell.set_source("a = 1").unwrap();
    sync_pair(&a, &b);

    assert_eq!(*keys.borrow(), vec!["tags".to_string()]);
    assert_eq!(remote_cell.source(), "a = 1");
    assert_eq!(a.to_record(), b.to_record());
}

#[test]
fn test_remote_delete_disposes_wrapper() {
    let a = notebook();
    let b = Notebook::load(&a.save().unwrap(), NotebookOptions::default()).unwrap();
    a.insert_cells(0, &[CellRecord::code("x"), CellRecord::code("y")])
        .unwrap();
    b.apply_update(&a.save().unwrap()).unwrap();
    let doomed = b.get_cell(0).unwrap();

    a.delete_cell(0).unwrap();
    b.apply_update(&a.save_incremental().unwrap()).unwrap();

    assert!(doomed.is_disposed());
    assert_eq!(ids(&a), ids(&b));
}

#[test]
fn test_save_and_load_from_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("notebook.automerge");

    let nb = notebook();
    nb.insert_cells(0, &[CellRecord::code("x = 1"), CellRecord::markdown("# Notes")])
        .unwrap();
    nb.set_metadata_key("kernelspec", Some(json!({"name": "python3"})))
        .unwrap();
    nb.save_to_file(&path).unwrap();

    let loaded = Notebook::load_or_create(&path, NotebookOptions::default()).unwrap();
    assert_eq!(loaded.to_record(), nb.to_record());
    assert!(!loaded.can_undo());
}

#[test]
fn test_corrupt_file_is_preserved() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("notebook.automerge");
    std::fs::write(&path, b"not an automerge document").unwrap();

    let nb = Notebook::load_or_create(&path, NotebookOptions::default()).unwrap();
    assert_eq!(nb.cell_count(), 0);
    assert!(!path.exists());
    assert!(path.with_extension("automerge.corrupt").exists());
}

#[test]
fn test_unknown_type_on_load_is_fatal() {
    let nb = Notebook::new(
        NotebookOptions::default().with_cell_type_adaptor(|t| match t {
            "sql" => Some(shared_model::CellKind::Code),
            other => shared_model::default_cell_type_adaptor(other),
        }),
    )
    .unwrap();
    nb.add_cell(&CellRecord::new("sql", "select 1")).unwrap();

    let err = Notebook::load(&nb.save().unwrap(), NotebookOptions::default()).unwrap_err();
    assert!(matches!(err, ModelError::UnknownCellType(t) if t == "sql"));
}

#[test]
fn test_record_json_round_trip() {
    let record: NotebookRecord = serde_json::from_value(json!({
        "cells": [
            {"id": "1", "cell_type": "code", "source": "print(1)", "metadata": {},
             "outputs": [{"output_type": "stream", "name": "stdout", "text": "1\n"}],
             "execution_count": 1},
            {"id": "2", "cell_type": "raw", "source": "", "metadata": {"format": "text/plain"}}
        ],
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5
    }))
    .unwrap();
    let nb = Notebook::from_record(&record, NotebookOptions::default()).unwrap();
    let value = serde_json::to_value(nb.to_record()).unwrap();
    assert_eq!(value, serde_json::to_value(&record).unwrap());
}
