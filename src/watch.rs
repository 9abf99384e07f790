//! Filesystem watching for [`FsDocumentStore`] vaults.
//!
//! [`VaultWatcher`] runs a `notify` debouncer over the vault root and forwards what it sees to a
//! [`SyncHandle`] as [`DocumentEvent`]s. Hidden entries (including the store image directory)
//! and files with other extensions are dropped before they reach the worker.

use crate::{
    config::SyncConfig,
    documents::{has_extension, FsDocumentStore},
    error::SupertagError,
    event::DocumentEvent,
    sync::SyncHandle,
};
use notify::{
    event::{ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::{Path, PathBuf};

pub struct VaultWatcher {
    debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    root: PathBuf,
}

/// Translate one filesystem notification into document events for `vault`.
pub fn translate(vault: &FsDocumentStore, extensions: &[String], event: &Event) -> Vec<DocumentEvent> {
    let document = |path: &Path| -> Option<String> {
        let relative = vault.relativize(path).ok()?;
        let hidden = relative.split('/').any(|part| part.starts_with('.'));
        (!hidden && has_extension(&relative, extensions)).then_some(relative)
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|p| document(p.as_path()))
            .map(DocumentEvent::Created)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            match (document(event.paths[0].as_path()), document(event.paths[1].as_path())) {
                (Some(from), Some(to)) => vec![DocumentEvent::Renamed(to, from)],
                (Some(from), None) => vec![DocumentEvent::Deleted(from)],
                (None, Some(to)) => vec![DocumentEvent::Created(to)],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter_map(|p| document(p.as_path()))
            .map(DocumentEvent::Deleted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter_map(|p| document(p.as_path()))
            .map(DocumentEvent::Created)
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|p| document(p.as_path()))
            .map(DocumentEvent::Modified)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|p| document(p.as_path()))
            .map(DocumentEvent::Deleted)
            .collect(),
        _ => Vec::new(),
    }
}

/// `vault` rooted at its canonical path. Notification backends report resolved absolute paths,
/// which a relative or symlinked root would never prefix.
pub fn canonical_vault(vault: &FsDocumentStore) -> Result<FsDocumentStore, SupertagError> {
    Ok(FsDocumentStore::new(std::fs::canonicalize(vault.root())?))
}

impl VaultWatcher {
    /// Start watching the root of `vault`, submitting events to `handle`.
    pub fn start(
        vault: &FsDocumentStore,
        config: &SyncConfig,
        handle: SyncHandle,
    ) -> Result<VaultWatcher, SupertagError> {
        let debouncer_vault = canonical_vault(vault)?;
        let root = debouncer_vault.root().to_path_buf();
        let extensions = config.extensions.clone();
        let mut debouncer = new_debouncer(
            config.watch_debounce(),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events.iter() {
                        for document_event in translate(&debouncer_vault, &extensions, &event.event)
                        {
                            tracing::debug!("[VaultWatcher] {document_event}");
                            if let Err(e) = handle.submit(document_event) {
                                tracing::warn!("[VaultWatcher] dropping event: {e}");
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    tracing::error!("Notify debouncer returned errors: {:?}", errors);
                }
            },
        )?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
        tracing::info!("[VaultWatcher] watching {:?}", root);
        Ok(VaultWatcher { debouncer, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stop(mut self) -> Result<(), SupertagError> {
        let unwatch_res = self.debouncer.watcher().unwatch(&self.root);
        tracing::debug!("Unwatch_res(path: {:?}) = {:?}", self.root, unwatch_res);
        unwatch_res?;
        Ok(())
    }
}
