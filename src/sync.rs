//! # Sync Service
//!
//! [`SyncService`] owns the live [`SchemaStore`] and keeps it in step with the documents of a
//! vault. It is opened against a [`DocumentStore`], then [`spawn`](SyncService::spawn)ed onto a
//! tokio task; from there on it is reached only through cloneable [`SyncHandle`]s.
//!
//! ## Serialization
//!
//! Every request travels through one unbounded queue and is handled by one worker, in arrival
//! order. Reconciliation transactions and store image writes therefore never interleave, even on
//! slow or flaky storage where a second write could otherwise start before the first finished.
//!
//! ## Persistence
//!
//! Committed mutations mark the store dirty and (re)arm a save deadline of
//! [`SyncConfig::save_debounce_ms`]. When the queue stays quiet until the deadline the image is
//! exported and written to [`SyncConfig::snapshot_path`]. A burst of edits thus costs one write.
//! A failed write leaves the store dirty. Transient failures re-arm the deadline, and the next
//! mutation or [`SyncHandle::flush`] retries as well.
//!
//! ## Out-of-band edits
//!
//! Nothing but the worker touches the live store. Schema edits made elsewhere go through
//! [`crate::editor::SchemaEditor`], which works on its own copy of the snapshot; afterwards
//! [`SyncHandle::reload`] swaps the live store for the freshly written image.
//!
//! ```rust,no_run
//! use supertag_core::{config::SyncConfig, documents::FsDocumentStore, sync::SyncService};
//!
//! # async fn run() -> Result<(), supertag_core::SupertagError> {
//! let documents = FsDocumentStore::new("/path/to/vault");
//! let handle = SyncService::open(documents, SyncConfig::default(), None).await?.spawn();
//! let report = handle.initial_sync().await?;
//! println!("{} documents reconciled", report.synced);
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::SyncConfig,
    db::{self, DeletedDocument, SchemaStore, StoreCounts},
    documents::{has_extension, DocumentStore},
    error::SupertagError,
    event::{DocumentEvent, SyncEvent},
    palette::{TagColor, TagPalette},
    properties::{Block, BlockId, PropertyDefinition, PropertyValue, Supertag, Tag},
    query::{self, BlockQuery, SearchHit},
    reconcile::{reconcile_text, DocumentSync},
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{sleep_until, Instant},
};

type Reply<T> = oneshot::Sender<Result<T, SupertagError>>;

enum Command {
    /// Fire-and-forget lifecycle notification.
    Event(DocumentEvent),
    Sync(String, Reply<Option<DocumentSync>>),
    /// New path, old path
    Rename(String, String, Reply<bool>),
    Delete(String, Reply<Option<DeletedDocument>>),
    InitialSync(Reply<InitialSyncReport>),
    Reload(Reply<()>),
    Flush(Reply<bool>),
    Tags(Reply<Vec<Tag>>),
    Supertags(Reply<Vec<Supertag>>),
    PropertyDefinitions(String, Reply<Vec<PropertyDefinition>>),
    PropertyValues(BlockId, String, Reply<Vec<PropertyValue>>),
    SetPropertyValues(BlockId, String, Vec<(String, String)>, Reply<usize>),
    UpsertPropertyValue(PropertyValue, Reply<()>),
    DeletePropertyValue(BlockId, String, String, Reply<bool>),
    Search(BlockQuery, Reply<Vec<SearchHit>>),
    FindBlock(String, String, Option<u32>, Reply<Option<Block>>),
    TagColor(String, Reply<TagColor>),
    Counts(Reply<StoreCounts>),
    Shutdown(Reply<()>),
}

/// Outcome of a full pass over the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSyncReport {
    /// Documents whose blocks were reconciled.
    pub synced: usize,
    /// Documents whose content hash matched the store.
    pub unchanged: usize,
    /// Paths skipped by the extension filter.
    pub ignored: usize,
    /// Documents that failed, each with its error. Other documents were still processed.
    pub failed: Vec<(String, SupertagError)>,
}

pub struct SyncService<D: DocumentStore> {
    documents: D,
    config: SyncConfig,
    store: SchemaStore,
    palette: TagPalette,
    events: Option<UnboundedSender<SyncEvent>>,
    dirty: bool,
    /// Bumped by every committed mutation; re-arms the save deadline.
    revision: u64,
}

impl<D: DocumentStore> SyncService<D> {
    /// Build the live store from the snapshot at `config.snapshot_path`, or start empty and write
    /// a first image when there is none.
    ///
    /// A snapshot that exists but cannot be loaded is an error: starting over would overwrite it
    /// on the next save.
    #[tracing::instrument(skip_all, fields(snapshot = %config.snapshot_path))]
    pub async fn open(
        documents: D,
        config: SyncConfig,
        events: Option<UnboundedSender<SyncEvent>>,
    ) -> Result<SyncService<D>, SupertagError> {
        let existing = if documents.exists(&config.snapshot_path).await? {
            Some(documents.read_binary(&config.snapshot_path).await?)
        } else {
            None
        };
        let store = match &existing {
            Some(bytes) => SchemaStore::from_snapshot(bytes).await.map_err(|e| {
                tracing::error!("snapshot {} could not be loaded: {e}", config.snapshot_path);
                e
            })?,
            None => SchemaStore::open().await?,
        };
        let mut service = SyncService {
            documents,
            config,
            store,
            palette: TagPalette::new(),
            events,
            dirty: existing.is_none(),
            revision: 0,
        };
        if service.dirty {
            if let Err(e) = service.save().await {
                tracing::warn!("initial store image not written, will retry: {e}");
            }
        }
        Ok(service)
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Move the service onto its own task.
    pub fn spawn(self) -> SyncHandle {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(self.run(rx));
        SyncHandle { tx }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        tracing::info!("[SyncService] worker started");
        let mut deadline: Option<Instant> = None;
        loop {
            let next = match deadline {
                Some(at) => {
                    tokio::select! {
                        command = rx.recv() => Some(command),
                        _ = sleep_until(at) => None,
                    }
                }
                None => Some(rx.recv().await),
            };
            let command = match next {
                // The quiet period elapsed.
                None => {
                    deadline = None;
                    if let Err(e) = self.save().await {
                        if e.is_transient() {
                            tracing::warn!("[SyncService] debounced save failed, retrying: {e}");
                            deadline = Some(Instant::now() + self.config.save_debounce());
                        } else {
                            tracing::error!("[SyncService] debounced save failed: {e}");
                        }
                        self.emit(SyncEvent::Failed(None, e.to_string()));
                    }
                    continue;
                }
                Some(None) => {
                    tracing::debug!("[SyncService] every handle dropped, stopping");
                    if let Err(e) = self.flush().await {
                        tracing::warn!("[SyncService] final save failed: {e}");
                    }
                    break;
                }
                Some(Some(command)) => command,
            };

            if let Command::Shutdown(reply) = command {
                let result = self.flush().await.map(|_| ());
                self.store.close().await;
                let _ = reply.send(result);
                break;
            }
            let revision = self.revision;
            self.handle(command).await;
            if !self.dirty {
                deadline = None;
            } else if self.revision != revision {
                deadline = Some(Instant::now() + self.config.save_debounce());
            }
        }
        tracing::info!("[SyncService] worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Event(event) => {
                tracing::debug!("[SyncService] {event}");
                let path = event.path().to_string();
                let result = match event {
                    DocumentEvent::Created(path) | DocumentEvent::Modified(path) => {
                        self.sync_file(&path).await.map(|_| ())
                    }
                    DocumentEvent::Renamed(path, old_path) => {
                        self.rename(&path, &old_path).await.map(|_| ())
                    }
                    DocumentEvent::Deleted(path) => self.delete(&path).await.map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::warn!("[SyncService] failed handling event for {path}: {e}");
                    self.emit(SyncEvent::Failed(Some(path), e.to_string()));
                }
            }
            Command::Sync(path, reply) => {
                let _ = reply.send(self.sync_file(&path).await);
            }
            Command::Rename(path, old_path, reply) => {
                let _ = reply.send(self.rename(&path, &old_path).await);
            }
            Command::Delete(path, reply) => {
                let _ = reply.send(self.delete(&path).await);
            }
            Command::InitialSync(reply) => {
                let _ = reply.send(self.initial_sync().await);
            }
            Command::Reload(reply) => {
                let _ = reply.send(self.reload().await);
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.flush().await);
            }
            Command::Tags(reply) => {
                let _ = reply.send(self.store.tags().await);
            }
            Command::Supertags(reply) => {
                let _ = reply.send(self.store.supertags().await);
            }
            Command::PropertyDefinitions(tag, reply) => {
                let _ = reply.send(self.store.property_definitions(&tag).await);
            }
            Command::PropertyValues(block, tag, reply) => {
                let _ = reply.send(self.store.property_values(block, &tag).await);
            }
            Command::SetPropertyValues(block, tag, values, reply) => {
                let _ = reply.send(self.set_property_values(block, &tag, &values).await);
            }
            Command::UpsertPropertyValue(value, reply) => {
                let _ = reply.send(self.upsert_property_value(&value).await);
            }
            Command::DeletePropertyValue(block, tag, name, reply) => {
                let _ = reply.send(self.delete_property_value(block, &tag, &name).await);
            }
            Command::Search(query, reply) => {
                let _ = reply.send(self.search(&query).await);
            }
            Command::FindBlock(path, tag, line_hint, reply) => {
                let _ = reply.send(self.find_block(&path, &tag, line_hint).await);
            }
            Command::TagColor(tag, reply) => {
                let _ = reply.send(Ok(self.palette.color(&tag)));
            }
            Command::Counts(reply) => {
                let _ = reply.send(self.store.counts().await);
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                tracing::trace!("[SyncService] event subscriber is gone");
            }
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }

    async fn save(&mut self) -> Result<(), SupertagError> {
        let bytes = self.store.export_snapshot().await?;
        self.documents
            .write_binary(&self.config.snapshot_path, &bytes)
            .await?;
        self.dirty = false;
        tracing::debug!(
            "[SyncService] wrote {} byte store image to {}",
            bytes.len(),
            self.config.snapshot_path
        );
        self.emit(SyncEvent::Saved(bytes.len()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<bool, SupertagError> {
        if !self.dirty {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    fn is_document(&self, path: &str) -> bool {
        path != self.config.snapshot_path && has_extension(path, &self.config.extensions)
    }

    async fn sync_file(&mut self, path: &str) -> Result<Option<DocumentSync>, SupertagError> {
        if !self.is_document(path) {
            tracing::trace!("[SyncService] ignoring {path}");
            return Ok(None);
        }
        let text = match self.documents.read_text(path).await {
            Ok(text) => text,
            Err(SupertagError::Codec(msg)) => {
                tracing::warn!("[SyncService] {path} is unreadable as text, syncing it as empty: {msg}");
                String::new()
            }
            Err(e) => return Err(e),
        };
        let outcome = reconcile_text(&self.store, path, &text).await?;
        match &outcome {
            DocumentSync::Unchanged(_) => self.emit(SyncEvent::Unchanged(path.to_string())),
            DocumentSync::Reconciled {
                document, report, ..
            } => {
                self.mark_dirty();
                self.emit(SyncEvent::Synced {
                    path: path.to_string(),
                    document: *document,
                    report: report.clone(),
                });
            }
        }
        Ok(Some(outcome))
    }

    /// Returns whether the store holds a document at `path` afterwards.
    async fn rename(&mut self, path: &str, old_path: &str) -> Result<bool, SupertagError> {
        match (self.is_document(old_path), self.is_document(path)) {
            (false, false) => return Ok(false),
            (true, false) => {
                self.delete(old_path).await?;
                return Ok(false);
            }
            (false, true) => return Ok(self.sync_file(path).await?.is_some()),
            (true, true) => {}
        }

        let mut tx = self.store.begin().await?;
        // A document moved over another replaces it.
        if let Some(replaced) = db::document_by_path(&mut tx, path).await? {
            if path != old_path {
                db::delete_document(&mut tx, replaced.id).await?;
                db::sweep_orphan_tags(&mut tx).await?;
            }
        }
        let moved = db::rename_document(&mut tx, old_path, path).await?;
        tx.commit().await?;

        if !moved {
            tracing::debug!("[SyncService] {old_path} was never synced, syncing {path} instead");
            return Ok(self.sync_file(path).await?.is_some());
        }
        self.mark_dirty();
        self.emit(SyncEvent::Renamed(path.to_string(), old_path.to_string()));
        Ok(true)
    }

    async fn delete(&mut self, path: &str) -> Result<Option<DeletedDocument>, SupertagError> {
        let mut tx = self.store.begin().await?;
        let Some(document) = db::document_by_path(&mut tx, path).await? else {
            return Ok(None);
        };
        let removed = db::delete_document(&mut tx, document.id).await?;
        let tags = db::sweep_orphan_tags(&mut tx).await?;
        tx.commit().await?;
        tracing::debug!(
            "[SyncService] deleted {path}: {} blocks, {} values, {tags} tags",
            removed.blocks,
            removed.values
        );
        self.mark_dirty();
        self.emit(SyncEvent::Deleted(path.to_string(), removed.blocks));
        Ok(Some(removed))
    }

    async fn initial_sync(&mut self) -> Result<InitialSyncReport, SupertagError> {
        let mut report = InitialSyncReport::default();
        for path in self.documents.list_documents().await? {
            match self.sync_file(&path).await {
                Ok(None) => report.ignored += 1,
                Ok(Some(DocumentSync::Unchanged(_))) => report.unchanged += 1,
                Ok(Some(DocumentSync::Reconciled { .. })) => report.synced += 1,
                Err(e) => {
                    tracing::warn!("[SyncService] initial sync of {path} failed: {e}");
                    self.emit(SyncEvent::Failed(Some(path.clone()), e.to_string()));
                    report.failed.push((path, e));
                }
            }
        }
        tracing::info!(
            "[SyncService] initial sync: {} synced, {} unchanged, {} failed",
            report.synced,
            report.unchanged,
            report.failed.len()
        );
        self.emit(SyncEvent::InitialSyncComplete(
            report.synced + report.unchanged,
            report.failed.len(),
        ));
        Ok(report)
    }

    async fn reload(&mut self) -> Result<(), SupertagError> {
        let bytes = self
            .documents
            .read_binary(&self.config.snapshot_path)
            .await?;
        let fresh = SchemaStore::from_snapshot(&bytes).await?;
        if self.dirty {
            tracing::warn!("[SyncService] reload discards changes that were not yet saved");
        }
        let stale = std::mem::replace(&mut self.store, fresh);
        stale.close().await;
        self.palette.clear();
        self.dirty = false;
        self.emit(SyncEvent::Reloaded);
        Ok(())
    }

    async fn set_property_values(
        &mut self,
        block: BlockId,
        tag: &str,
        values: &[(String, String)],
    ) -> Result<usize, SupertagError> {
        let mut tx = self.store.begin().await?;
        let stored = db::set_property_values(&mut tx, block, tag, values).await?;
        tx.commit().await?;
        self.mark_dirty();
        Ok(stored)
    }

    async fn upsert_property_value(&mut self, value: &PropertyValue) -> Result<(), SupertagError> {
        let mut conn = self.store.connection().await?;
        db::upsert_property_value(&mut conn, value).await?;
        drop(conn);
        self.mark_dirty();
        Ok(())
    }

    async fn delete_property_value(
        &mut self,
        block: BlockId,
        tag: &str,
        name: &str,
    ) -> Result<bool, SupertagError> {
        let mut conn = self.store.connection().await?;
        let removed = db::delete_property_value(&mut conn, block, tag, name).await?;
        drop(conn);
        if removed {
            self.mark_dirty();
        }
        Ok(removed)
    }

    async fn search(&self, query: &BlockQuery) -> Result<Vec<SearchHit>, SupertagError> {
        let mut conn = self.store.connection().await?;
        query::search(&mut conn, query, self.config.search_limit).await
    }

    async fn find_block(
        &self,
        path: &str,
        tag: &str,
        line_hint: Option<u32>,
    ) -> Result<Option<Block>, SupertagError> {
        let mut conn = self.store.connection().await?;
        query::find_block(&mut conn, path, tag, line_hint).await
    }
}

/// Cloneable entry point to a running [`SyncService`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: UnboundedSender<Command>,
}

fn worker_gone() -> SupertagError {
    SupertagError::Service("sync worker has stopped".to_string())
}

impl SyncHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SupertagError> {
        let (reply, response) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| worker_gone())?;
        response.await?
    }

    /// Queue a lifecycle notification without waiting for it. Failures are logged by the worker
    /// and published as [`SyncEvent::Failed`].
    pub fn submit(&self, event: DocumentEvent) -> Result<(), SupertagError> {
        self.tx.send(Command::Event(event)).map_err(|_| worker_gone())
    }

    /// Reconcile the document at `path` with its current content. `None` when the path is not a
    /// synced document type.
    pub async fn sync_file(&self, path: &str) -> Result<Option<DocumentSync>, SupertagError> {
        self.request(|reply| Command::Sync(path.to_string(), reply))
            .await
    }

    pub async fn handle_rename(&self, path: &str, old_path: &str) -> Result<bool, SupertagError> {
        self.request(|reply| Command::Rename(path.to_string(), old_path.to_string(), reply))
            .await
    }

    pub async fn handle_delete(
        &self,
        path: &str,
    ) -> Result<Option<DeletedDocument>, SupertagError> {
        self.request(|reply| Command::Delete(path.to_string(), reply))
            .await
    }

    pub async fn initial_sync(&self) -> Result<InitialSyncReport, SupertagError> {
        self.request(Command::InitialSync).await
    }

    /// Replace the live store with the last written snapshot. On failure the live store is kept.
    pub async fn reload(&self) -> Result<(), SupertagError> {
        self.request(Command::Reload).await
    }

    /// Write the store image now if anything changed since the last write.
    pub async fn flush(&self) -> Result<bool, SupertagError> {
        self.request(Command::Flush).await
    }

    /// Flush and stop the worker. Later requests on any handle fail with a service error.
    pub async fn shutdown(&self) -> Result<(), SupertagError> {
        self.request(Command::Shutdown).await
    }

    pub async fn tags(&self) -> Result<Vec<Tag>, SupertagError> {
        self.request(Command::Tags).await
    }

    pub async fn supertags(&self) -> Result<Vec<Supertag>, SupertagError> {
        self.request(Command::Supertags).await
    }

    pub async fn property_definitions(
        &self,
        tag: &str,
    ) -> Result<Vec<PropertyDefinition>, SupertagError> {
        self.request(|reply| Command::PropertyDefinitions(tag.to_string(), reply))
            .await
    }

    pub async fn property_values(
        &self,
        block: BlockId,
        tag: &str,
    ) -> Result<Vec<PropertyValue>, SupertagError> {
        self.request(|reply| Command::PropertyValues(block, tag.to_string(), reply))
            .await
    }

    /// Replace every value of `tag` on `block`. Empty values are not stored.
    pub async fn set_property_values(
        &self,
        block: BlockId,
        tag: &str,
        values: Vec<(String, String)>,
    ) -> Result<usize, SupertagError> {
        self.request(|reply| Command::SetPropertyValues(block, tag.to_string(), values, reply))
            .await
    }

    pub async fn upsert_property_value(&self, value: PropertyValue) -> Result<(), SupertagError> {
        self.request(|reply| Command::UpsertPropertyValue(value, reply))
            .await
    }

    pub async fn delete_property_value(
        &self,
        block: BlockId,
        tag: &str,
        name: &str,
    ) -> Result<bool, SupertagError> {
        self.request(|reply| {
            Command::DeletePropertyValue(block, tag.to_string(), name.to_string(), reply)
        })
        .await
    }

    pub async fn search(&self, query: BlockQuery) -> Result<Vec<SearchHit>, SupertagError> {
        self.request(|reply| Command::Search(query, reply)).await
    }

    /// The block of `path` that a click on `#tag` near `line_hint` refers to.
    pub async fn find_block(
        &self,
        path: &str,
        tag: &str,
        line_hint: Option<u32>,
    ) -> Result<Option<Block>, SupertagError> {
        self.request(|reply| Command::FindBlock(path.to_string(), tag.to_string(), line_hint, reply))
            .await
    }

    pub async fn tag_color(&self, tag: &str) -> Result<TagColor, SupertagError> {
        self.request(|reply| Command::TagColor(tag.to_string(), reply))
            .await
    }

    pub async fn counts(&self) -> Result<StoreCounts, SupertagError> {
        self.request(Command::Counts).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
