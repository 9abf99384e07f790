use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{properties::DocumentId, reconcile::ReconcileReport};

/// Lifecycle notification for one document, as delivered by the document store or a watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentEvent {
    Created(String),
    Modified(String),
    /// New path, old path
    Renamed(String, String),
    Deleted(String),
}

impl DocumentEvent {
    /// The path the event concerns after it happened.
    pub fn path(&self) -> &str {
        match self {
            DocumentEvent::Created(path)
            | DocumentEvent::Modified(path)
            | DocumentEvent::Renamed(path, _)
            | DocumentEvent::Deleted(path) => path,
        }
    }
}

impl Display for DocumentEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentEvent::Created(path) => write!(f, "created {path}"),
            DocumentEvent::Modified(path) => write!(f, "modified {path}"),
            DocumentEvent::Renamed(path, old) => write!(f, "renamed {old} -> {path}"),
            DocumentEvent::Deleted(path) => write!(f, "deleted {path}"),
        }
    }
}

/// What the sync service did, published to whoever subscribed when it was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A document was reconciled against its new content.
    Synced {
        path: String,
        document: DocumentId,
        report: ReconcileReport,
    },
    /// Content hash matched the stored one; nothing was written.
    Unchanged(String),
    /// New path, old path
    Renamed(String, String),
    /// Path, number of blocks removed
    Deleted(String, u64),
    /// The store image was written, size in bytes.
    Saved(usize),
    /// The live store was replaced by the last durable snapshot.
    Reloaded,
    /// An initial sync pass completed: documents reconciled, documents that failed.
    InitialSyncComplete(usize, usize),
    /// Path (if the failure concerns one document) and a description.
    Failed(Option<String>, String),
}
