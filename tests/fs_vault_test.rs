//! Integration tests against a vault on disk
//!
//! Covers what the in-memory vault cannot: directory walking, the store image living inside the
//! vault, identity across process restarts, and (opt-in) filesystem notifications.

mod common;

use common::{fs_vault, init_logging, test_config, write_doc};
use supertag_core::{
    config::SyncConfig,
    db::{SchemaStore, DEFAULT_SNAPSHOT_PATH},
    documents::FsDocumentStore,
    sync::SyncService,
};

const NO_AUTOSAVE: u64 = 60_000;

async fn start(vault: &FsDocumentStore, config: &SyncConfig) -> supertag_core::sync::SyncHandle {
    SyncService::open(vault.clone(), config.clone(), None)
        .await
        .unwrap()
        .spawn()
}

#[tokio::test]
async fn test_initial_sync_walks_the_vault() {
    init_logging();
    let (dir, vault) = fs_vault(&[
        ("index.md", "Welcome #home"),
        ("projects/alpha.md", "Alpha #project\n\nKickoff #meeting"),
        ("projects/notes.txt", "skipped #project"),
        (".obsidian/workspace.md", "hidden #project"),
    ]);
    let config = test_config(NO_AUTOSAVE);
    let handle = start(&vault, &config).await;

    let report = handle.initial_sync().await.unwrap();
    assert_eq!((report.synced, report.ignored), (2, 1));
    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);

    let counts = handle.counts().await.unwrap();
    assert_eq!((counts.documents, counts.blocks, counts.tags), (2, 3, 3));

    handle.shutdown().await.unwrap();
    let snapshot = dir.path().join(DEFAULT_SNAPSHOT_PATH);
    assert!(snapshot.is_file(), "store image written at {snapshot:?}");
    let image = std::fs::read(&snapshot).unwrap();
    let store = SchemaStore::from_snapshot(&image).await.unwrap();
    assert_eq!(store.counts().await.unwrap(), counts);
}

#[tokio::test]
async fn test_block_identity_survives_restart() {
    init_logging();
    let (dir, vault) = fs_vault(&[("log.md", "Standup #meeting\n\nRetro #meeting")]);
    let config = test_config(NO_AUTOSAVE);

    let handle = start(&vault, &config).await;
    handle.initial_sync().await.unwrap();
    let before = handle
        .find_block("log.md", "meeting", Some(2))
        .await
        .unwrap()
        .unwrap();
    handle.shutdown().await.unwrap();

    // Edited while nothing was running.
    write_doc(dir.path(), "log.md", "Planning\n\nStandup #meeting\n\nRetro #meeting");

    let handle = start(&vault, &config).await;
    let report = handle.initial_sync().await.unwrap();
    assert_eq!(report.synced, 1);
    let after = handle
        .find_block("log.md", "meeting", Some(4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.start_line, 4);

    let report = handle.initial_sync().await.unwrap();
    assert_eq!((report.synced, report.unchanged), (0, 1));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_custom_snapshot_path_is_not_synced() {
    init_logging();
    let (dir, vault) = fs_vault(&[("a.md", "a #t")]);
    let config = SyncConfig {
        snapshot_path: "meta/store.md".to_string(),
        ..test_config(NO_AUTOSAVE)
    };
    let handle = start(&vault, &config).await;
    assert!(dir.path().join("meta/store.md").is_file());

    let report = handle.initial_sync().await.unwrap();
    // The image shares the document extension but is never reconciled.
    assert_eq!((report.synced, report.ignored), (1, 1));
    assert_eq!(handle.counts().await.unwrap().documents, 1);
    handle.shutdown().await.unwrap();
}

#[cfg(feature = "watch")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "depends on platform filesystem notifications"]
async fn test_watcher_follows_edits() {
    use std::time::Duration;
    use supertag_core::watch::VaultWatcher;

    init_logging();
    let (dir, vault) = fs_vault(&[("a.md", "first #t")]);
    let config = SyncConfig {
        watch_debounce_ms: 100,
        ..test_config(NO_AUTOSAVE)
    };
    let handle = start(&vault, &config).await;
    handle.initial_sync().await.unwrap();
    let watcher = VaultWatcher::start(&vault, &config, handle.clone()).unwrap();

    write_doc(dir.path(), "b.md", "second #u");
    std::fs::remove_file(dir.path().join("a.md")).unwrap();

    let mut settled = false;
    for _ in 0..50 {
        let counts = handle.counts().await.unwrap();
        if counts.documents == 1 && handle.find_block("b.md", "u", None).await.unwrap().is_some() {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(settled, "watcher events reached the worker");

    watcher.stop().unwrap();
    handle.shutdown().await.unwrap();
}
