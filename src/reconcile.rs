//! Block reconciliation: carry block identities across re-parses of a document.
//!
//! Reconciling a document is split in two. [`plan`] is a pure function from the persisted blocks
//! of a document and its fresh parse to an identity assignment. [`apply`] executes an assignment
//! against the store inside the caller's transaction. [`reconcile_document`] and
//! [`reconcile_text`] wrap both behind the document-level hash gate.
//!
//! Matching runs in priority order, and every persisted block is claimed at most once:
//!
//! 1. exact content hash, first unclaimed candidate in start-line order;
//! 2. identical start line, for blocks edited in place;
//! 3. anything left over becomes a new block.
//!
//! Hash matching has to come first. Inserting a block at the top of a document shifts every
//! following block down; matching by position first would hand the identity (and the property
//! values) of an unchanged block to whichever block now occupies its old line.
//!
//! When a document holds several blocks with byte-identical text, which of them keeps which
//! identity is decided by document order alone and carries no meaning.

use crate::{
    codec::{line_count, parse_blocks, ParsedBlock},
    db::{self, SchemaStore},
    error::SupertagError,
    hash::ContentHash,
    properties::{unix_now, BlockId, Document, DocumentId, StoredBlock},
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// How one freshly parsed block obtained its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockAssignment {
    /// Unchanged text; only the line range moves.
    HashMatch(BlockId),
    /// Edited in place; text, hash, range and tag links are all replaced.
    PositionMatch(BlockId),
    /// No persisted block could be claimed.
    Create,
}

impl BlockAssignment {
    pub fn reused(&self) -> Option<BlockId> {
        match self {
            BlockAssignment::HashMatch(id) | BlockAssignment::PositionMatch(id) => Some(*id),
            BlockAssignment::Create => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    /// One entry per parsed block, in document order.
    pub assignments: Vec<BlockAssignment>,
    /// Persisted blocks nothing claimed, in start-line order.
    pub deleted: Vec<BlockId>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.deleted.is_empty()
            && self
                .assignments
                .iter()
                .all(|a| matches!(a, BlockAssignment::HashMatch(_)))
    }
}

/// Assign identities to `new` blocks from `old` ones.
pub fn plan(old: &[StoredBlock], new: &[ParsedBlock]) -> ReconcilePlan {
    let mut ordered: Vec<&StoredBlock> = old.iter().collect();
    // Stable, so persisted blocks sharing a start line keep their given order.
    ordered.sort_by_key(|b| b.start_line);

    let mut by_hash: HashMap<ContentHash, VecDeque<usize>> = HashMap::new();
    let mut by_line: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (idx, block) in ordered.iter().enumerate() {
        by_hash.entry(block.content_hash).or_default().push_back(idx);
        by_line.entry(block.start_line).or_default().push(idx);
    }

    let mut claimed = vec![false; ordered.len()];
    let mut assignments: Vec<Option<BlockAssignment>> = vec![None; new.len()];

    for (slot, parsed) in assignments.iter_mut().zip(new) {
        let Some(queue) = by_hash.get_mut(&parsed.content_hash) else {
            continue;
        };
        if let Some(idx) = queue.pop_front() {
            claimed[idx] = true;
            *slot = Some(BlockAssignment::HashMatch(ordered[idx].id));
        }
    }

    for (slot, parsed) in assignments.iter_mut().zip(new) {
        if slot.is_some() {
            continue;
        }
        let candidate = by_line
            .get(&parsed.start_line)
            .and_then(|indices| indices.iter().copied().find(|idx| !claimed[*idx]));
        if let Some(idx) = candidate {
            claimed[idx] = true;
            *slot = Some(BlockAssignment::PositionMatch(ordered[idx].id));
        }
    }

    let deleted = ordered
        .iter()
        .zip(&claimed)
        .filter(|(_, claimed)| !**claimed)
        .map(|(block, _)| block.id)
        .collect();

    ReconcilePlan {
        assignments: assignments
            .into_iter()
            .map(|slot| slot.unwrap_or(BlockAssignment::Create))
            .collect(),
        deleted,
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Identity of every parsed block after the pass, in document order.
    pub block_ids: Vec<BlockId>,
    pub hash_matched: usize,
    pub position_matched: usize,
    pub created: usize,
    pub deleted: usize,
    pub values_swept: u64,
    pub tags_swept: u64,
}

/// Execute `plan` for `document`. `new` must be the parse the plan was computed from.
///
/// Every statement runs on `conn`; pass a transaction so that a failure leaves the document as it
/// was.
pub async fn apply(
    conn: &mut SqliteConnection,
    document: DocumentId,
    plan: &ReconcilePlan,
    new: &[ParsedBlock],
    now: i64,
) -> Result<ReconcileReport, SupertagError> {
    if plan.assignments.len() != new.len() {
        return Err(SupertagError::Command(format!(
            "reconcile plan covers {} blocks but the parse has {}",
            plan.assignments.len(),
            new.len()
        )));
    }

    let mut report = ReconcileReport::default();
    for deleted in plan.deleted.iter() {
        db::delete_block(conn, *deleted).await?;
    }
    report.deleted = plan.deleted.len();

    for (assignment, parsed) in plan.assignments.iter().zip(new) {
        let id = match assignment {
            BlockAssignment::HashMatch(id) => {
                db::reposition_block(conn, *id, parsed.start_line, parsed.end_line, now).await?;
                report.hash_matched += 1;
                *id
            }
            BlockAssignment::PositionMatch(id) => {
                db::rewrite_block(conn, *id, parsed, now).await?;
                db::replace_block_tags(conn, *id, &parsed.tags, now).await?;
                report.position_matched += 1;
                *id
            }
            BlockAssignment::Create => {
                let id = BlockId::new();
                db::insert_block(conn, document, id, parsed, now).await?;
                db::insert_block_tags(conn, id, &parsed.tags, now).await?;
                report.created += 1;
                id
            }
        };
        report.block_ids.push(id);
    }

    report.values_swept = db::sweep_orphan_values(conn).await?;
    report.tags_swept = db::sweep_orphan_tags(conn).await?;
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentSync {
    /// The stored content hash equals the new one; nothing was written.
    Unchanged(DocumentId),
    Reconciled {
        document: DocumentId,
        /// The document was seen for the first time.
        created: bool,
        report: ReconcileReport,
    },
}

impl DocumentSync {
    pub fn document(&self) -> DocumentId {
        match self {
            DocumentSync::Unchanged(id) => *id,
            DocumentSync::Reconciled { document, .. } => *document,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, DocumentSync::Unchanged(_))
    }
}

/// Bring the store in line with `text` as the content of the document at `path`.
pub async fn reconcile_document(
    conn: &mut SqliteConnection,
    path: &str,
    text: &str,
    now: i64,
) -> Result<DocumentSync, SupertagError> {
    let content_hash = ContentHash::of(text);
    let existing = db::document_by_path(conn, path).await?;
    if let Some(doc) = &existing {
        if doc.content_hash == content_hash {
            tracing::trace!("{path} unchanged ({content_hash})");
            return Ok(DocumentSync::Unchanged(doc.id));
        }
    }

    let lines = line_count(text);
    let (document, created) = match existing {
        Some(doc) => {
            db::update_document_content(conn, doc.id, text, content_hash, lines, now).await?;
            (doc.id, false)
        }
        None => {
            let doc = Document {
                id: DocumentId::new(),
                path: path.to_string(),
                content: text.to_string(),
                content_hash,
                line_count: lines,
                modified_at: now,
                synced_at: now,
            };
            db::insert_document(conn, &doc).await?;
            (doc.id, true)
        }
    };

    let old = db::stored_blocks(conn, document).await?;
    let new = parse_blocks(text);
    let plan = plan(&old, &new);
    let report = apply(conn, document, &plan, &new, now).await?;
    tracing::debug!(
        "reconciled {path}: {} hash, {} position, {} created, {} deleted",
        report.hash_matched,
        report.position_matched,
        report.created,
        report.deleted
    );
    Ok(DocumentSync::Reconciled {
        document,
        created,
        report,
    })
}

/// [`reconcile_document`] inside its own transaction on `store`.
#[tracing::instrument(skip(store, text), fields(len = text.len()))]
pub async fn reconcile_text(
    store: &SchemaStore,
    path: &str,
    text: &str,
) -> Result<DocumentSync, SupertagError> {
    let mut tx = store.begin().await?;
    match reconcile_document(&mut tx, path, text, unix_now()).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(e) => {
            tracing::warn!("rolling back reconciliation of {path}: {e}");
            tx.rollback().await?;
            Err(e)
        }
    }
}
