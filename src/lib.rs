//! # supertag-core
//!
//! Block synchronization for markdown vaults: stable block identities, tag links, and typed
//! "supertag" properties attached to blocks, kept consistent while documents are edited.
//!
//! ## Overview
//!
//! A document is split into **blocks**, maximal runs of non-blank lines. Every block gets a stable
//! identifier that survives edits elsewhere in the document, moves, and in-place rewrites, so that
//! the property values a user attached to a tag occurrence inside it stay attached. Tags are the
//! `#tokens` found in block text; a tag with declared properties is a **supertag**.
//!
//! ### Key Features
//!
//! - **Identity-preserving reconciliation**: exact-content matching first, then position, then
//!   creation; each persisted block is reused at most once
//! - **Hash-gated syncing**: unchanged documents cost one lookup
//! - **No accidental data loss**: property values are never cascade-deleted; orphans are swept
//!   explicitly once their block or tag link is really gone
//! - **Single writer**: one worker task serializes every mutation and debounces store image writes
//! - **Portable store image**: the whole store is one SQLite image kept inside the vault
//!
//! ## Architecture
//!
//! - **[`hash`]**: content fingerprints
//! - **[`codec`]**: block parsing and tag extraction
//! - **[`db`]**: the schema store and its snapshot image
//! - **[`reconcile`]**: identity assignment and its transactional application
//! - **[`sync`]**: the worker that drives reconciliation from document events
//! - **[`editor`]**: out-of-band schema edits against a snapshot copy
//! - **[`query`]**: block search and click-target lookup
//! - **[`documents`]**: vault access, on disk or in memory
//! - **`watch`**: filesystem notifications to document events (feature `watch`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use supertag_core::{
//!     config::SyncConfig, documents::FsDocumentStore, query::BlockQuery, sync::SyncService,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let documents = FsDocumentStore::new("./vault");
//!     let handle = SyncService::open(documents, SyncConfig::default(), None)
//!         .await?
//!         .spawn();
//!
//!     handle.initial_sync().await?;
//!     for hit in handle.search(BlockQuery::new().tag("project")).await? {
//!         println!("{}:{} {}", hit.document_path, hit.start_line, hit.text);
//!     }
//!
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod documents;
pub mod editor;
pub mod error;
pub mod event;
pub mod hash;
pub mod palette;
pub mod properties;
pub mod query;
pub mod reconcile;
pub mod sync;
#[cfg(feature = "watch")]
pub mod watch;

pub use error::*;
