//! Integration tests for SyncService (event handling, persistence, lifecycle)
//!
//! These tests drive the worker through its public handle against an in-memory vault:
//! - Block identity across edits, renames and deletions
//! - Event ordering and per-document failure isolation
//! - Debounced and forced store image writes
//! - Reload, shutdown and handle drop
//!
//! Tests focus on observable behavior rather than internal implementation details.

mod common;

use common::{block_ids, eventually, init_logging, memory_vault, spawn_service, test_config};
use std::time::Duration;
use supertag_core::{
    config::SyncConfig,
    db::SchemaStore,
    editor::SchemaEditor,
    event::{DocumentEvent, SyncEvent},
    palette::TAG_COLORS,
    properties::{PropertyType, PropertyValue},
    query::BlockQuery,
    reconcile::DocumentSync,
    sync::SyncService,
    SupertagError,
};

/// Long enough that no debounced write happens while a test runs.
const NO_AUTOSAVE: u64 = 60_000;

fn pairs(values: &[(&str, &str)]) -> Vec<(String, String)> {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_values_survive_inserting_a_block_above() {
    init_logging();
    let vault = memory_vault(&[("daily.md", "Line1 #a\n\nLine2 #b")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;

    let first = block_ids(handle.sync_file("daily.md").await.unwrap());
    assert_eq!(first.len(), 2);
    let stored = handle
        .set_property_values(first[0], "a", pairs(&[("status", "open")]))
        .await
        .unwrap();
    assert_eq!(stored, 1);

    vault.insert_text("daily.md", "Intro\n\nLine1 #a\n\nLine2 #b");
    let second = block_ids(handle.sync_file("daily.md").await.unwrap());
    assert_eq!(second.len(), 3);
    assert_eq!(second[1..], first[..], "shifted blocks keep their identity");
    assert!(!first.contains(&second[0]), "the intro block is new");

    let values = handle.property_values(first[0], "a").await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value.as_deref(), Some("open"));

    let block = handle.find_block("daily.md", "a", Some(2)).await.unwrap().unwrap();
    assert_eq!(block.id, first[0]);
    assert_eq!((block.start_line, block.end_line), (2, 2));
}

#[tokio::test]
async fn test_unchanged_content_is_not_reconciled_again() {
    init_logging();
    let vault = memory_vault(&[("a.md", "one #x")]);
    let (handle, _events) = spawn_service(vault, test_config(NO_AUTOSAVE)).await;

    let first = handle.sync_file("a.md").await.unwrap().unwrap();
    assert!(matches!(first, DocumentSync::Reconciled { created: true, .. }));
    let counts = handle.counts().await.unwrap();

    let second = handle.sync_file("a.md").await.unwrap().unwrap();
    assert!(second.is_unchanged());
    assert_eq!(second.document(), first.document());
    assert_eq!(handle.counts().await.unwrap(), counts);
}

#[tokio::test]
async fn test_submitted_events_are_processed_in_order() {
    init_logging();
    let vault = memory_vault(&[]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;

    vault.insert_text("draft.md", "Plan #todo");
    handle
        .submit(DocumentEvent::Created("draft.md".to_string()))
        .unwrap();
    vault.rename("draft.md", "final.md");
    handle
        .submit(DocumentEvent::Renamed(
            "final.md".to_string(),
            "draft.md".to_string(),
        ))
        .unwrap();

    // Requests queue behind the events, so this waits for both.
    let hits = handle.search(BlockQuery::new().tag("todo")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document_path, "final.md");
    assert_eq!(handle.counts().await.unwrap().documents, 1);
}

#[tokio::test]
async fn test_rename_keeps_block_identity_and_values() {
    init_logging();
    let vault = memory_vault(&[("inbox/task.md", "Call Bob #todo\n\nNotes")]);
    let (handle, mut events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;

    let ids = block_ids(handle.sync_file("inbox/task.md").await.unwrap());
    handle
        .set_property_values(ids[0], "todo", pairs(&[("due", "2024-06-01")]))
        .await
        .unwrap();

    vault.rename("inbox/task.md", "done/task.md");
    assert!(handle
        .handle_rename("done/task.md", "inbox/task.md")
        .await
        .unwrap());

    let block = handle
        .find_block("done/task.md", "todo", None)
        .await
        .unwrap()
        .expect("block is reachable under the new path");
    assert_eq!(block.id, ids[0]);
    assert!(handle
        .find_block("inbox/task.md", "todo", None)
        .await
        .unwrap()
        .is_none());
    assert_eq!(handle.property_values(ids[0], "todo").await.unwrap().len(), 1);

    // The renamed document keeps its content hash, so the follow-up modify is a no-op.
    let outcome = handle.sync_file("done/task.md").await.unwrap().unwrap();
    assert!(outcome.is_unchanged());

    let mut renamed = false;
    while let Ok(event) = events.try_recv() {
        if event == SyncEvent::Renamed("done/task.md".to_string(), "inbox/task.md".to_string()) {
            renamed = true;
        }
    }
    assert!(renamed, "a Renamed event was published");
}

#[tokio::test]
async fn test_rename_of_unsynced_document_syncs_the_target() {
    init_logging();
    let vault = memory_vault(&[("new.md", "fresh #t")]);
    let (handle, _events) = spawn_service(vault, test_config(NO_AUTOSAVE)).await;

    assert!(handle.handle_rename("new.md", "never-seen.md").await.unwrap());
    assert_eq!(handle.counts().await.unwrap().documents, 1);
    assert!(handle.find_block("new.md", "t", None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_rename_to_foreign_extension_drops_the_document() {
    init_logging();
    let vault = memory_vault(&[("a.md", "x #t")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;
    handle.sync_file("a.md").await.unwrap();

    vault.rename("a.md", "a.txt");
    assert!(!handle.handle_rename("a.txt", "a.md").await.unwrap());
    let counts = handle.counts().await.unwrap();
    assert_eq!((counts.documents, counts.blocks, counts.tags), (0, 0, 0));
}

#[tokio::test]
async fn test_delete_cascades_and_sweeps_only_unshared_tags() {
    init_logging();
    let vault = memory_vault(&[("a.md", "x #solo #shared"), ("b.md", "y #shared")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;
    handle.initial_sync().await.unwrap();

    let a = handle.find_block("a.md", "solo", None).await.unwrap().unwrap();
    handle
        .set_property_values(a.id, "solo", pairs(&[("f", "v")]))
        .await
        .unwrap();

    vault.remove("a.md");
    let removed = handle.handle_delete("a.md").await.unwrap().unwrap();
    assert_eq!((removed.blocks, removed.values), (1, 1));

    let tags: Vec<String> = handle
        .tags()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(tags, vec!["shared".to_string()]);
    let counts = handle.counts().await.unwrap();
    assert_eq!((counts.documents, counts.blocks, counts.values), (1, 1, 0));

    // Deleting again is a no-op.
    assert!(handle.handle_delete("a.md").await.unwrap().is_none());
}

#[tokio::test]
async fn test_initial_sync_isolates_failures() {
    init_logging();
    let vault = memory_vault(&[
        ("a.md", "alpha #t"),
        ("b.md", "beta #t"),
        ("c.txt", "not a note #t"),
    ]);
    vault.set_unreadable("b.md", true);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;

    let report = handle.initial_sync().await.unwrap();
    assert_eq!((report.synced, report.unchanged, report.ignored), (1, 0, 1));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "b.md");
    assert!(matches!(report.failed[0].1, SupertagError::Io(_)));

    vault.set_unreadable("b.md", false);
    let report = handle.initial_sync().await.unwrap();
    assert_eq!((report.synced, report.unchanged, report.ignored), (1, 1, 1));
    assert!(report.failed.is_empty());
    assert_eq!(handle.counts().await.unwrap().documents, 2);
}

#[tokio::test]
async fn test_undecodable_document_syncs_as_empty() {
    init_logging();
    let vault = memory_vault(&[]);
    vault.insert_binary("broken.md", vec![0xff, 0xfe, 0xfd]);
    let (handle, _events) = spawn_service(vault, test_config(NO_AUTOSAVE)).await;

    let ids = block_ids(handle.sync_file("broken.md").await.unwrap());
    assert!(ids.is_empty());
    let counts = handle.counts().await.unwrap();
    assert_eq!((counts.documents, counts.blocks), (1, 0));
}

#[tokio::test]
async fn test_ignored_paths_return_none() {
    init_logging();
    let vault = memory_vault(&[("image.png", "binary-ish")]);
    let config = test_config(NO_AUTOSAVE);
    let snapshot = config.snapshot_path.clone();
    let (handle, _events) = spawn_service(vault, config).await;

    assert!(handle.sync_file("image.png").await.unwrap().is_none());
    assert!(handle.sync_file(&snapshot).await.unwrap().is_none());
    assert_eq!(handle.counts().await.unwrap().documents, 0);
}

#[tokio::test]
async fn test_events_report_synced_then_unchanged() {
    init_logging();
    let vault = memory_vault(&[("a.md", "x #t")]);
    let (handle, mut events) = spawn_service(vault, test_config(NO_AUTOSAVE)).await;

    handle.sync_file("a.md").await.unwrap();
    handle.sync_file("a.md").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, SyncEvent::Saved(_)) {
            seen.push(event);
        }
    }
    assert_eq!(seen.len(), 2, "unexpected events: {seen:?}");
    assert!(matches!(&seen[0], SyncEvent::Synced { path, report, .. }
        if path == "a.md" && report.created == 1));
    assert_eq!(seen[1], SyncEvent::Unchanged("a.md".to_string()));
}

#[tokio::test]
async fn test_debounce_coalesces_writes() {
    init_logging();
    let vault = memory_vault(&[("a.md", "a #t"), ("b.md", "b #t"), ("c.md", "c #t")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(300)).await;
    assert_eq!(vault.write_count(), 1, "opening without a snapshot writes one");

    for path in ["a.md", "b.md", "c.md"] {
        handle.sync_file(path).await.unwrap();
    }
    assert_eq!(vault.write_count(), 1, "nothing is written during the burst");

    assert!(
        eventually(Duration::from_secs(5), || vault.write_count() == 2).await,
        "the burst is written once the queue goes quiet"
    );

    // Read-only requests do not re-arm the save.
    handle.tags().await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(vault.write_count(), 2);
    assert!(!handle.flush().await.unwrap(), "nothing left to flush");
}

#[tokio::test]
async fn test_failed_write_keeps_store_dirty() {
    init_logging();
    let vault = memory_vault(&[("a.md", "a #t")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;
    handle.sync_file("a.md").await.unwrap();

    vault.set_fail_writes(true);
    assert!(matches!(handle.flush().await, Err(SupertagError::Io(_))));

    vault.set_fail_writes(false);
    assert!(handle.flush().await.unwrap(), "the retry writes the image");
    assert!(!handle.flush().await.unwrap());

    let snapshot = vault.get(&SyncConfig::default().snapshot_path).unwrap();
    let store = SchemaStore::from_snapshot(&snapshot).await.unwrap();
    assert_eq!(store.counts().await.unwrap().documents, 1);
}

#[tokio::test]
async fn test_debounced_save_retries_after_io_failure() {
    init_logging();
    let vault = memory_vault(&[("a.md", "a #t")]);
    let (handle, mut events) = spawn_service(vault.clone(), test_config(200)).await;
    assert_eq!(vault.write_count(), 1);

    vault.set_fail_writes(true);
    handle.sync_file("a.md").await.unwrap();
    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SyncEvent::Failed(None, _)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(failed, "the debounced save reported its failure");

    // No further mutation: the save is retried on its own.
    vault.set_fail_writes(false);
    assert!(
        eventually(Duration::from_secs(5), || vault.write_count() == 2).await,
        "the image is written once storage recovers"
    );
    assert!(!handle.flush().await.unwrap());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_open_refuses_a_corrupt_snapshot() {
    init_logging();
    let config = test_config(NO_AUTOSAVE);
    let vault = memory_vault(&[]);
    vault.insert_binary(&config.snapshot_path, b"definitely not sqlite".to_vec());

    let opened = SyncService::open(vault.clone(), config.clone(), None).await;
    assert!(opened.is_err());
    assert_eq!(
        vault.get(&config.snapshot_path).unwrap(),
        b"definitely not sqlite".to_vec(),
        "the broken snapshot is left alone"
    );
}

#[tokio::test]
async fn test_reload_picks_up_committed_schema_edits() {
    init_logging();
    let config = test_config(NO_AUTOSAVE);
    let vault = memory_vault(&[("books.md", "Dune #book")]);
    let (handle, mut events) = spawn_service(vault.clone(), config.clone()).await;
    let ids = block_ids(handle.sync_file("books.md").await.unwrap());
    assert!(handle.flush().await.unwrap());

    let mut editor = SchemaEditor::open(vault.clone(), config).await.unwrap();
    editor
        .add_property("book", "author", PropertyType::Text)
        .await
        .unwrap();
    editor
        .set_values(ids[0], "book", &pairs(&[("author", "Herbert")]))
        .await
        .unwrap();
    editor.commit().await.unwrap();

    assert!(handle.supertags().await.unwrap()[0].properties.is_empty());
    handle.reload().await.unwrap();

    let supertags = handle.supertags().await.unwrap();
    assert_eq!(supertags.len(), 1);
    assert_eq!(supertags[0].name, "book");
    assert_eq!(supertags[0].properties[0].name, "author");
    let values = handle.property_values(ids[0], "book").await.unwrap();
    assert_eq!(values[0].value.as_deref(), Some("Herbert"));

    let mut reloaded = false;
    while let Ok(event) = events.try_recv() {
        reloaded |= event == SyncEvent::Reloaded;
    }
    assert!(reloaded);
}

#[tokio::test]
async fn test_reload_failure_keeps_live_store() {
    init_logging();
    let config = test_config(NO_AUTOSAVE);
    let vault = memory_vault(&[("a.md", "a #keep")]);
    let (handle, _events) = spawn_service(vault.clone(), config.clone()).await;
    handle.sync_file("a.md").await.unwrap();

    vault.insert_binary(&config.snapshot_path, b"garbage".to_vec());
    assert!(handle.reload().await.is_err());

    let tags = handle.tags().await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "keep");
}

#[tokio::test]
async fn test_value_edits_are_checked_against_tag_links() {
    init_logging();
    let vault = memory_vault(&[("a.md", "x #t\n\ny #u")]);
    let (handle, _events) = spawn_service(vault, test_config(NO_AUTOSAVE)).await;
    let ids = block_ids(handle.sync_file("a.md").await.unwrap());

    let err = handle
        .set_property_values(ids[0], "u", pairs(&[("f", "v")]))
        .await
        .unwrap_err();
    assert!(matches!(err, SupertagError::NotFound(_)));

    handle
        .upsert_property_value(PropertyValue {
            block_id: ids[1],
            tag_name: "u".to_string(),
            property_name: "rank".to_string(),
            value: Some("3".to_string()),
        })
        .await
        .unwrap();
    let hits = handle.search(BlockQuery::new().field("rank")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].block_id, ids[1]);

    assert!(handle.delete_property_value(ids[1], "u", "rank").await.unwrap());
    assert!(!handle.delete_property_value(ids[1], "u", "rank").await.unwrap());
}

#[tokio::test]
async fn test_tag_colors_are_stable() {
    init_logging();
    let (handle, _events) = spawn_service(memory_vault(&[]), test_config(NO_AUTOSAVE)).await;
    assert_eq!(handle.tag_color("a").await.unwrap(), TAG_COLORS[1]);
    assert_eq!(
        handle.tag_color("project").await.unwrap(),
        handle.tag_color("project").await.unwrap()
    );
}

#[tokio::test]
async fn test_shutdown_flushes_and_stops() {
    init_logging();
    let vault = memory_vault(&[("a.md", "a #t")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;
    let other = handle.clone();
    handle.sync_file("a.md").await.unwrap();
    assert_eq!(vault.write_count(), 1);

    handle.shutdown().await.unwrap();
    assert_eq!(vault.write_count(), 2, "pending changes are written on shutdown");

    assert!(matches!(other.tags().await, Err(SupertagError::Service(_))));
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_dropping_every_handle_flushes() {
    init_logging();
    let vault = memory_vault(&[("a.md", "a #t")]);
    let (handle, _events) = spawn_service(vault.clone(), test_config(NO_AUTOSAVE)).await;
    handle.sync_file("a.md").await.unwrap();
    drop(handle);

    assert!(
        eventually(Duration::from_secs(5), || vault.write_count() == 2).await,
        "the worker writes pending changes before it stops"
    );
}
