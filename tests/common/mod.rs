//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::{path::Path, time::Duration};
use supertag_core::{
    config::SyncConfig,
    documents::{FsDocumentStore, MemoryDocumentStore},
    event::SyncEvent,
    properties::BlockId,
    reconcile::DocumentSync,
    sync::{SyncHandle, SyncService},
};
use tempfile::TempDir;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Defaults with a save debounce short enough for tests to wait out.
#[allow(dead_code)]
pub fn test_config(save_debounce_ms: u64) -> SyncConfig {
    SyncConfig {
        save_debounce_ms,
        ..SyncConfig::default()
    }
}

/// An in-memory vault holding `docs`.
#[allow(dead_code)]
pub fn memory_vault(docs: &[(&str, &str)]) -> MemoryDocumentStore {
    let vault = MemoryDocumentStore::new();
    for (path, text) in docs {
        vault.insert_text(path, text);
    }
    vault
}

/// A vault directory holding `docs`, with parent directories created as needed.
#[allow(dead_code)]
pub fn fs_vault(docs: &[(&str, &str)]) -> (TempDir, FsDocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    for (path, text) in docs {
        write_doc(dir.path(), path, text);
    }
    let vault = FsDocumentStore::new(dir.path());
    (dir, vault)
}

#[allow(dead_code)]
pub fn write_doc(root: &Path, path: &str, text: &str) {
    let target = root.join(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(target, text).unwrap();
}

/// Open and spawn a service over `vault`, subscribed to its events.
#[allow(dead_code)]
pub async fn spawn_service(
    vault: MemoryDocumentStore,
    config: SyncConfig,
) -> (SyncHandle, UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = unbounded_channel();
    let handle = SyncService::open(vault, config, Some(tx))
        .await
        .unwrap()
        .spawn();
    (handle, rx)
}

/// Block identities produced by a reconciling sync.
#[allow(dead_code)]
pub fn block_ids(outcome: Option<DocumentSync>) -> Vec<BlockId> {
    match outcome {
        Some(DocumentSync::Reconciled { report, .. }) => report.block_ids,
        other => panic!("expected a reconciliation, got {other:?}"),
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
#[allow(dead_code)]
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
