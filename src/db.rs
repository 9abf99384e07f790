//! The schema store: block, tag and property relations held in an in-memory SQLite database.
//!
//! The live store is an in-memory database behind a single-connection [`Pool`], so the handle
//! that owns it is the only writer. Durability is provided by [`SchemaStore::export_snapshot`],
//! which serializes the whole database into a relocatable byte image, and
//! [`SchemaStore::from_snapshot`], which rebuilds a store from such an image.
//!
//! Table and column names are those of the established image format, so existing snapshots load
//! unchanged:
//!
//! | table            | key                                 | references                                 |
//! |------------------|-------------------------------------|--------------------------------------------|
//! | `files`          | `uuid` (unique `path`)              |                                            |
//! | `blocks`         | `id`                                | `fileUUID → files` (cascade)               |
//! | `tags`           | `name`                              |                                            |
//! | `block_tags`     | `(blockId, tagName)`                | `blockId → blocks` (cascade), `tagName → tags` |
//! | `tag_properties` | `(tagName, name)`                   | `tagName → tags` (cascade)                 |
//! | `tag_values`     | `(blockId, tagName, propName)`      | none; swept explicitly                     |
//!
//! `tag_values` has no foreign keys. Values are removed only by [`sweep_orphan_values`] and by
//! explicit edits, never as a side effect of a block or definition row going away.
//!
//! Every mutating helper takes a `&mut SqliteConnection` so that callers can compose several of
//! them inside one [`sqlx::Transaction`].

use crate::{
    codec::{ParsedBlock, TagOccurrence},
    error::SupertagError,
    hash::ContentHash,
    properties::{
        Block, BlockId, BlockTag, Document, DocumentId, PropertyDefinition, PropertyType,
        PropertyValue, StoredBlock, Supertag, Tag,
    },
};
use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::{PoolConnection, PoolOptions},
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection},
    ConnectOptions, Connection, Pool, Row, Transaction,
};
use std::{collections::BTreeMap, path::Path, result::Result};

/// Default location of the store image, relative to the document root.
pub const DEFAULT_SNAPSHOT_PATH: &str = ".supertag/supertag.db";

/// Relations carried by a snapshot, in foreign-key order.
const SNAPSHOT_COPY: [&str; 6] = [
    "INSERT INTO main.files (uuid, path, content, hash, lineCount, modifiedAt, syncedAt) \
     SELECT uuid, path, content, hash, lineCount, modifiedAt, syncedAt FROM snapshot.files",
    "INSERT INTO main.blocks (id, fileUUID, startLine, endLine, content, contentHash, createdAt, updatedAt) \
     SELECT id, fileUUID, startLine, endLine, content, contentHash, createdAt, updatedAt FROM snapshot.blocks",
    "INSERT OR IGNORE INTO main.tags (name, createdAt) SELECT name, createdAt FROM snapshot.tags",
    "INSERT OR IGNORE INTO main.block_tags (blockId, tagName, position) \
     SELECT blockId, tagName, position FROM snapshot.block_tags",
    "INSERT OR IGNORE INTO main.tag_properties (tagName, name, pos, type) \
     SELECT tagName, name, pos, type FROM snapshot.tag_properties",
    "INSERT OR IGNORE INTO main.tag_values (blockId, tagName, propName, value) \
     SELECT blockId, tagName, propName, value FROM snapshot.tag_values",
];

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::Simple) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_block_sync_tables",
        sql: "\
        CREATE TABLE IF NOT EXISTS files (uuid TEXT PRIMARY KEY, path TEXT NOT NULL UNIQUE, content TEXT, \
            hash TEXT, lineCount INTEGER, modifiedAt INTEGER, syncedAt INTEGER); \
        CREATE TABLE IF NOT EXISTS blocks (id TEXT PRIMARY KEY, fileUUID TEXT NOT NULL, \
            startLine INTEGER NOT NULL, endLine INTEGER NOT NULL, content TEXT NOT NULL, contentHash TEXT NOT NULL, \
            createdAt INTEGER NOT NULL, updatedAt INTEGER NOT NULL, \
            FOREIGN KEY (fileUUID) REFERENCES files(uuid) ON DELETE CASCADE); \
        CREATE TABLE IF NOT EXISTS tags (name TEXT PRIMARY KEY, createdAt INTEGER NOT NULL); \
        CREATE TABLE IF NOT EXISTS block_tags (blockId TEXT NOT NULL, tagName TEXT NOT NULL, position INTEGER, \
            PRIMARY KEY (blockId, tagName), \
            FOREIGN KEY (blockId) REFERENCES blocks(id) ON DELETE CASCADE, \
            FOREIGN KEY (tagName) REFERENCES tags(name)); \
        CREATE TABLE IF NOT EXISTS tag_properties (tagName TEXT NOT NULL, name TEXT NOT NULL, \
            pos INTEGER, type INTEGER NOT NULL DEFAULT 1, PRIMARY KEY (tagName, name), \
            FOREIGN KEY (tagName) REFERENCES tags(name) ON DELETE CASCADE); \
        CREATE TABLE IF NOT EXISTS tag_values (blockId TEXT NOT NULL, tagName TEXT NOT NULL, \
            propName TEXT NOT NULL, value TEXT, PRIMARY KEY (blockId, tagName, propName)); \
        CREATE INDEX IF NOT EXISTS idx_blocks_fileUUID ON blocks(fileUUID); \
        CREATE INDEX IF NOT EXISTS idx_block_tags_blockId ON block_tags(blockId); \
        CREATE INDEX IF NOT EXISTS idx_files_path ON files(path); \
        CREATE INDEX IF NOT EXISTS idx_tag_properties_tagName ON tag_properties(tagName); \
        CREATE INDEX IF NOT EXISTS idx_tag_values_block ON tag_values(blockId);",
        kind: MigrationType::Simple,
    }])
}

/// Open a fresh, empty in-memory store with all tables created.
pub async fn store_init() -> Result<Pool<Sqlite>, SupertagError> {
    // A plain `:memory:` filename rather than the `in_memory` option. The option opens with
    // SQLITE_OPEN_MEMORY, which every attached database inherits, so `VACUUM INTO` and `ATTACH`
    // would never touch the staged image file.
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .foreign_keys(true)
        .disable_statement_logging();

    // One connection that never idles out: the in-memory database lives exactly as long as it.
    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;
    Ok(pool)
}

/// Row counts of every relation, used for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub documents: u64,
    pub blocks: u64,
    pub tags: u64,
    pub block_tags: u64,
    pub properties: u64,
    pub values: u64,
}

#[derive(Debug, Clone)]
pub struct SchemaStore(pub Pool<Sqlite>);

impl SchemaStore {
    /// A new empty store.
    pub async fn open() -> Result<SchemaStore, SupertagError> {
        Ok(SchemaStore(store_init().await?))
    }

    /// A new store populated from a snapshot image such as the ones produced by
    /// [`SchemaStore::export_snapshot`].
    #[tracing::instrument(skip(bytes), fields(len = bytes.len()))]
    pub async fn from_snapshot(bytes: &[u8]) -> Result<SchemaStore, SupertagError> {
        let store = SchemaStore::open().await?;
        store.import_snapshot(bytes).await?;
        Ok(store)
    }

    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>, SupertagError> {
        Ok(self.0.acquire().await?)
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, SupertagError> {
        Ok(self.0.begin().await?)
    }

    pub async fn close(&self) {
        self.0.close().await;
    }

    async fn import_snapshot(&self, bytes: &[u8]) -> Result<(), SupertagError> {
        let staging = tempfile::Builder::new()
            .prefix("supertag-snapshot")
            .tempdir()?;
        let image = staging.path().join("import.db");
        tokio::fs::write(&image, bytes).await?;

        let mut conn = self.connection().await?;
        sqlx::query("ATTACH DATABASE ? AS snapshot")
            .bind(path_to_string(&image))
            .execute(&mut *conn)
            .await?;
        let copied = copy_snapshot(&mut conn).await;
        let detached = sqlx::query("DETACH DATABASE snapshot")
            .execute(&mut *conn)
            .await;
        copied?;
        detached?;
        Ok(())
    }

    /// Serialize the entire store into a byte image.
    #[tracing::instrument(skip(self))]
    pub async fn export_snapshot(&self) -> Result<Vec<u8>, SupertagError> {
        let staging = tempfile::Builder::new()
            .prefix("supertag-snapshot")
            .tempdir()?;
        let image = staging.path().join("export.db");
        sqlx::query("VACUUM INTO ?")
            .bind(path_to_string(&image))
            .execute(&self.0)
            .await
            .map_err(|e| {
                tracing::error!("[SchemaStore.export_snapshot] VACUUM INTO failed: {}", e);
                e
            })?;
        let bytes = tokio::fs::read(&image).await?;
        tracing::debug!("Exported store image of {} bytes", bytes.len());
        Ok(bytes)
    }

    pub async fn counts(&self) -> Result<StoreCounts, SupertagError> {
        let mut conn = self.connection().await?;
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM files), (SELECT COUNT(*) FROM blocks), \
             (SELECT COUNT(*) FROM tags), (SELECT COUNT(*) FROM block_tags), \
             (SELECT COUNT(*) FROM tag_properties), (SELECT COUNT(*) FROM tag_values)",
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(StoreCounts {
            documents: row.get::<i64, usize>(0) as u64,
            blocks: row.get::<i64, usize>(1) as u64,
            tags: row.get::<i64, usize>(2) as u64,
            block_tags: row.get::<i64, usize>(3) as u64,
            properties: row.get::<i64, usize>(4) as u64,
            values: row.get::<i64, usize>(5) as u64,
        })
    }

    pub async fn document_by_path(&self, path: &str) -> Result<Option<Document>, SupertagError> {
        let mut conn = self.connection().await?;
        document_by_path(&mut conn, path).await
    }

    pub async fn blocks(&self, document: DocumentId) -> Result<Vec<Block>, SupertagError> {
        let mut conn = self.connection().await?;
        blocks_for_document(&mut conn, document).await
    }

    pub async fn block(&self, id: BlockId) -> Result<Option<Block>, SupertagError> {
        let mut conn = self.connection().await?;
        block(&mut conn, id).await
    }

    pub async fn block_tags(&self, id: BlockId) -> Result<Vec<BlockTag>, SupertagError> {
        let mut conn = self.connection().await?;
        block_tags(&mut conn, id).await
    }

    pub async fn tags(&self) -> Result<Vec<Tag>, SupertagError> {
        let mut conn = self.connection().await?;
        list_tags(&mut conn).await
    }

    pub async fn supertags(&self) -> Result<Vec<Supertag>, SupertagError> {
        let mut conn = self.connection().await?;
        list_supertags(&mut conn).await
    }

    pub async fn property_definitions(
        &self,
        tag: &str,
    ) -> Result<Vec<PropertyDefinition>, SupertagError> {
        let mut conn = self.connection().await?;
        property_definitions(&mut conn, tag).await
    }

    pub async fn property_values(
        &self,
        block: BlockId,
        tag: &str,
    ) -> Result<Vec<PropertyValue>, SupertagError> {
        let mut conn = self.connection().await?;
        property_values(&mut conn, block, tag).await
    }

    pub async fn field_names(&self) -> Result<Vec<String>, SupertagError> {
        let mut conn = self.connection().await?;
        field_names(&mut conn).await
    }

    pub async fn defined_tag_names(&self) -> Result<Vec<String>, SupertagError> {
        let mut conn = self.connection().await?;
        defined_tag_names(&mut conn).await
    }
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn copy_snapshot(conn: &mut SqliteConnection) -> Result<(), SupertagError> {
    let mut tx = conn.begin().await?;
    for statement in SNAPSHOT_COPY {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[SchemaStore.import_snapshot] failed copying snapshot relation: {}",
                    e
                );
                e
            })?;
    }
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------------------------

pub async fn document_by_path(
    conn: &mut SqliteConnection,
    path: &str,
) -> Result<Option<Document>, SupertagError> {
    Ok(sqlx::query_as::<_, Document>("SELECT * FROM files WHERE path = ?")
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn document(
    conn: &mut SqliteConnection,
    id: DocumentId,
) -> Result<Option<Document>, SupertagError> {
    Ok(sqlx::query_as::<_, Document>("SELECT * FROM files WHERE uuid = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn list_documents(conn: &mut SqliteConnection) -> Result<Vec<Document>, SupertagError> {
    Ok(
        sqlx::query_as::<_, Document>("SELECT * FROM files ORDER BY path")
            .fetch_all(&mut *conn)
            .await?,
    )
}

pub async fn insert_document(
    conn: &mut SqliteConnection,
    doc: &Document,
) -> Result<(), SupertagError> {
    sqlx::query(
        "INSERT INTO files (uuid, path, content, hash, lineCount, modifiedAt, syncedAt) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(doc.id.to_string())
    .bind(&doc.path)
    .bind(&doc.content)
    .bind(doc.content_hash.to_string())
    .bind(doc.line_count)
    .bind(doc.modified_at)
    .bind(doc.synced_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn update_document_content(
    conn: &mut SqliteConnection,
    id: DocumentId,
    content: &str,
    content_hash: ContentHash,
    line_count: u32,
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query(
        "UPDATE files SET content = ?, hash = ?, lineCount = ?, modifiedAt = ?, syncedAt = ? \
         WHERE uuid = ?",
    )
    .bind(content)
    .bind(content_hash.to_string())
    .bind(line_count)
    .bind(now)
    .bind(now)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move a document to `new_path`. Returns `false` when no document is stored at `old_path`.
pub async fn rename_document(
    conn: &mut SqliteConnection,
    old_path: &str,
    new_path: &str,
) -> Result<bool, SupertagError> {
    if old_path == new_path {
        return Ok(document_by_path(conn, old_path).await?.is_some());
    }
    if document_by_path(conn, new_path).await?.is_some() {
        return Err(SupertagError::Conflict(format!(
            "cannot rename {old_path:?}: a document is already stored at {new_path:?}"
        )));
    }
    let result = sqlx::query("UPDATE files SET path = ? WHERE path = ?")
        .bind(new_path)
        .bind(old_path)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// What a document deletion removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedDocument {
    pub blocks: u64,
    pub values: u64,
}

/// Delete a document, its blocks and links (by cascade), and the property values of its blocks
/// (explicitly, since values carry no foreign keys).
pub async fn delete_document(
    conn: &mut SqliteConnection,
    id: DocumentId,
) -> Result<DeletedDocument, SupertagError> {
    let values = sqlx::query(
        "DELETE FROM tag_values WHERE blockId IN (SELECT id FROM blocks WHERE fileUUID = ?)",
    )
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    let blocks = sqlx::query("DELETE FROM blocks WHERE fileUUID = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM files WHERE uuid = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(DeletedDocument { blocks, values })
}

// ---------------------------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------------------------

/// The matching view of every persisted block of a document, in start-line order.
pub async fn stored_blocks(
    conn: &mut SqliteConnection,
    document: DocumentId,
) -> Result<Vec<StoredBlock>, SupertagError> {
    Ok(sqlx::query_as::<_, StoredBlock>(
        "SELECT id, contentHash, startLine FROM blocks WHERE fileUUID = ? ORDER BY startLine, id",
    )
    .bind(document.to_string())
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn blocks_for_document(
    conn: &mut SqliteConnection,
    document: DocumentId,
) -> Result<Vec<Block>, SupertagError> {
    Ok(sqlx::query_as::<_, Block>(
        "SELECT * FROM blocks WHERE fileUUID = ? ORDER BY startLine, id",
    )
    .bind(document.to_string())
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn block(conn: &mut SqliteConnection, id: BlockId) -> Result<Option<Block>, SupertagError> {
    Ok(sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn insert_block(
    conn: &mut SqliteConnection,
    document: DocumentId,
    id: BlockId,
    parsed: &ParsedBlock,
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query(
        "INSERT INTO blocks (id, fileUUID, startLine, endLine, content, contentHash, createdAt, updatedAt) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(document.to_string())
    .bind(parsed.start_line)
    .bind(parsed.end_line)
    .bind(&parsed.text)
    .bind(parsed.content_hash.to_string())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Refresh only the line range of an unchanged block.
pub async fn reposition_block(
    conn: &mut SqliteConnection,
    id: BlockId,
    start_line: u32,
    end_line: u32,
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query("UPDATE blocks SET startLine = ?, endLine = ?, updatedAt = ? WHERE id = ?")
        .bind(start_line)
        .bind(end_line)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Overwrite text, hash and line range of a block edited in place.
pub async fn rewrite_block(
    conn: &mut SqliteConnection,
    id: BlockId,
    parsed: &ParsedBlock,
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query(
        "UPDATE blocks SET content = ?, contentHash = ?, startLine = ?, endLine = ?, updatedAt = ? \
         WHERE id = ?",
    )
    .bind(&parsed.text)
    .bind(parsed.content_hash.to_string())
    .bind(parsed.start_line)
    .bind(parsed.end_line)
    .bind(now)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete a block row; its tag links go with it. Property values are left for the orphan sweep.
pub async fn delete_block(conn: &mut SqliteConnection, id: BlockId) -> Result<(), SupertagError> {
    sqlx::query("DELETE FROM blocks WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// Tags and block-tag links
// ---------------------------------------------------------------------------------------------

pub async fn ensure_tag(
    conn: &mut SqliteConnection,
    name: &str,
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query("INSERT OR IGNORE INTO tags (name, createdAt) VALUES (?, ?)")
        .bind(name)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_tags(conn: &mut SqliteConnection) -> Result<Vec<Tag>, SupertagError> {
    Ok(sqlx::query_as::<_, Tag>("SELECT * FROM tags ORDER BY name")
        .fetch_all(&mut *conn)
        .await?)
}

/// Insert links for `tags`, creating missing tag rows. Only the first occurrence of a tag in the
/// block is kept.
pub async fn insert_block_tags(
    conn: &mut SqliteConnection,
    block: BlockId,
    tags: &[TagOccurrence],
    now: i64,
) -> Result<(), SupertagError> {
    for tag in tags {
        ensure_tag(conn, &tag.name, now).await?;
        sqlx::query("INSERT OR IGNORE INTO block_tags (blockId, tagName, position) VALUES (?, ?, ?)")
            .bind(block.to_string())
            .bind(&tag.name)
            .bind(tag.offset as u32)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Drop every link of `block` and insert `tags` in their place.
pub async fn replace_block_tags(
    conn: &mut SqliteConnection,
    block: BlockId,
    tags: &[TagOccurrence],
    now: i64,
) -> Result<(), SupertagError> {
    sqlx::query("DELETE FROM block_tags WHERE blockId = ?")
        .bind(block.to_string())
        .execute(&mut *conn)
        .await?;
    insert_block_tags(conn, block, tags, now).await
}

pub async fn block_tags(
    conn: &mut SqliteConnection,
    block: BlockId,
) -> Result<Vec<BlockTag>, SupertagError> {
    Ok(sqlx::query_as::<_, BlockTag>(
        "SELECT * FROM block_tags WHERE blockId = ? ORDER BY position, tagName",
    )
    .bind(block.to_string())
    .fetch_all(&mut *conn)
    .await?)
}

/// Delete tags no block links to any more. Tags that carry property definitions are declared
/// supertags and are kept.
pub async fn sweep_orphan_tags(conn: &mut SqliteConnection) -> Result<u64, SupertagError> {
    let result = sqlx::query(
        "DELETE FROM tags WHERE name NOT IN (SELECT DISTINCT tagName FROM block_tags) \
         AND name NOT IN (SELECT DISTINCT tagName FROM tag_properties)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Delete values whose block is gone or whose block no longer links the value's tag.
pub async fn sweep_orphan_values(conn: &mut SqliteConnection) -> Result<u64, SupertagError> {
    let missing_block = sqlx::query("DELETE FROM tag_values WHERE blockId NOT IN (SELECT id FROM blocks)")
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let missing_link = sqlx::query(
        "DELETE FROM tag_values WHERE NOT EXISTS (SELECT 1 FROM block_tags bt \
         WHERE bt.blockId = tag_values.blockId AND bt.tagName = tag_values.tagName)",
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(missing_block + missing_link)
}

// ---------------------------------------------------------------------------------------------
// Property definitions
// ---------------------------------------------------------------------------------------------

pub async fn property_definitions(
    conn: &mut SqliteConnection,
    tag: &str,
) -> Result<Vec<PropertyDefinition>, SupertagError> {
    Ok(sqlx::query_as::<_, PropertyDefinition>(
        "SELECT * FROM tag_properties WHERE tagName = ? ORDER BY pos, name",
    )
    .bind(tag)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn property_definition(
    conn: &mut SqliteConnection,
    tag: &str,
    name: &str,
) -> Result<Option<PropertyDefinition>, SupertagError> {
    Ok(sqlx::query_as::<_, PropertyDefinition>(
        "SELECT * FROM tag_properties WHERE tagName = ? AND name = ?",
    )
    .bind(tag)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?)
}

fn checked_property_name(name: &str) -> Result<&str, SupertagError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SupertagError::Command(
            "property name must not be blank".to_string(),
        ));
    }
    Ok(trimmed)
}

/// Declare a new property for `tag`, creating the tag row if needed.
pub async fn add_property_definition(
    conn: &mut SqliteConnection,
    tag: &str,
    name: &str,
    property_type: PropertyType,
    display_order: u32,
    now: i64,
) -> Result<PropertyDefinition, SupertagError> {
    let name = checked_property_name(name)?;
    if property_definition(conn, tag, name).await?.is_some() {
        return Err(SupertagError::Conflict(format!(
            "supertag #{tag} already has a property named {name:?}"
        )));
    }
    ensure_tag(conn, tag, now).await?;
    sqlx::query("INSERT INTO tag_properties (tagName, name, pos, type) VALUES (?, ?, ?, ?)")
        .bind(tag)
        .bind(name)
        .bind(display_order)
        .bind(property_type.code())
        .execute(&mut *conn)
        .await?;
    Ok(PropertyDefinition {
        tag_name: tag.to_string(),
        name: name.to_string(),
        property_type,
        display_order,
    })
}

/// Rename and/or retype a property. Values stored under the old name follow the rename.
pub async fn update_property_definition(
    conn: &mut SqliteConnection,
    tag: &str,
    old_name: &str,
    new_name: &str,
    property_type: PropertyType,
) -> Result<(), SupertagError> {
    let new_name = checked_property_name(new_name)?;
    if property_definition(conn, tag, old_name).await?.is_none() {
        return Err(SupertagError::NotFound(format!(
            "supertag #{tag} has no property named {old_name:?}"
        )));
    }
    if new_name != old_name && property_definition(conn, tag, new_name).await?.is_some() {
        return Err(SupertagError::Conflict(format!(
            "cannot rename {old_name:?}: supertag #{tag} already has a property named {new_name:?}"
        )));
    }
    sqlx::query("UPDATE tag_properties SET name = ?, type = ? WHERE tagName = ? AND name = ?")
        .bind(new_name)
        .bind(property_type.code())
        .bind(tag)
        .bind(old_name)
        .execute(&mut *conn)
        .await?;
    if new_name != old_name {
        sqlx::query("UPDATE tag_values SET propName = ? WHERE tagName = ? AND propName = ?")
            .bind(new_name)
            .bind(tag)
            .bind(old_name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Remove a property declaration and, explicitly, every value stored for it.
pub async fn delete_property_definition(
    conn: &mut SqliteConnection,
    tag: &str,
    name: &str,
) -> Result<bool, SupertagError> {
    let removed = sqlx::query("DELETE FROM tag_properties WHERE tagName = ? AND name = ?")
        .bind(tag)
        .bind(name)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM tag_values WHERE tagName = ? AND propName = ?")
        .bind(tag)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(removed > 0)
}

/// Assign display order from the position of each name in `names`.
pub async fn reorder_property_definitions(
    conn: &mut SqliteConnection,
    tag: &str,
    names: &[String],
) -> Result<(), SupertagError> {
    for (pos, name) in names.iter().enumerate() {
        let updated = sqlx::query("UPDATE tag_properties SET pos = ? WHERE tagName = ? AND name = ?")
            .bind(pos as u32)
            .bind(tag)
            .bind(name)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(SupertagError::NotFound(format!(
                "supertag #{tag} has no property named {name:?}"
            )));
        }
    }
    Ok(())
}

/// Every tag with its property definitions.
pub async fn list_supertags(conn: &mut SqliteConnection) -> Result<Vec<Supertag>, SupertagError> {
    let mut supertags: BTreeMap<String, Supertag> = list_tags(conn)
        .await?
        .into_iter()
        .map(|tag| {
            (
                tag.name.clone(),
                Supertag {
                    name: tag.name,
                    properties: Vec::new(),
                },
            )
        })
        .collect();
    let definitions = sqlx::query_as::<_, PropertyDefinition>(
        "SELECT * FROM tag_properties ORDER BY tagName, pos, name",
    )
    .fetch_all(&mut *conn)
    .await?;
    for definition in definitions {
        if let Some(supertag) = supertags.get_mut(&definition.tag_name) {
            supertag.properties.push(definition);
        }
    }
    Ok(supertags.into_values().collect())
}

/// Names of tags that declare at least one property.
pub async fn defined_tag_names(conn: &mut SqliteConnection) -> Result<Vec<String>, SupertagError> {
    Ok(
        sqlx::query_scalar::<_, String>("SELECT DISTINCT tagName FROM tag_properties ORDER BY tagName")
            .fetch_all(&mut *conn)
            .await?,
    )
}

/// Distinct property names across all supertags.
pub async fn field_names(conn: &mut SqliteConnection) -> Result<Vec<String>, SupertagError> {
    Ok(
        sqlx::query_scalar::<_, String>("SELECT DISTINCT name FROM tag_properties ORDER BY name")
            .fetch_all(&mut *conn)
            .await?,
    )
}

// ---------------------------------------------------------------------------------------------
// Property values
// ---------------------------------------------------------------------------------------------

async fn ensure_block_carries_tag(
    conn: &mut SqliteConnection,
    block: BlockId,
    tag: &str,
) -> Result<(), SupertagError> {
    let linked = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM block_tags WHERE blockId = ? AND tagName = ?",
    )
    .bind(block.to_string())
    .bind(tag)
    .fetch_one(&mut *conn)
    .await?;
    if linked == 0 {
        return Err(SupertagError::NotFound(format!(
            "block {block} does not carry tag #{tag}"
        )));
    }
    Ok(())
}

pub async fn property_values(
    conn: &mut SqliteConnection,
    block: BlockId,
    tag: &str,
) -> Result<Vec<PropertyValue>, SupertagError> {
    Ok(sqlx::query_as::<_, PropertyValue>(
        "SELECT * FROM tag_values WHERE blockId = ? AND tagName = ? ORDER BY propName",
    )
    .bind(block.to_string())
    .bind(tag)
    .fetch_all(&mut *conn)
    .await?)
}

/// Replace all values of `tag` on `block`. Empty values are dropped rather than stored.
pub async fn set_property_values(
    conn: &mut SqliteConnection,
    block: BlockId,
    tag: &str,
    values: &[(String, String)],
) -> Result<usize, SupertagError> {
    ensure_block_carries_tag(conn, block, tag).await?;
    delete_property_values(conn, block, tag).await?;
    let mut stored = 0;
    for (name, value) in values.iter().filter(|(_, value)| !value.is_empty()) {
        sqlx::query("INSERT OR REPLACE INTO tag_values (blockId, tagName, propName, value) VALUES (?, ?, ?, ?)")
            .bind(block.to_string())
            .bind(tag)
            .bind(name)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        stored += 1;
    }
    Ok(stored)
}

/// Insert or overwrite a single value.
pub async fn upsert_property_value(
    conn: &mut SqliteConnection,
    value: &PropertyValue,
) -> Result<(), SupertagError> {
    ensure_block_carries_tag(conn, value.block_id, &value.tag_name).await?;
    sqlx::query("INSERT OR REPLACE INTO tag_values (blockId, tagName, propName, value) VALUES (?, ?, ?, ?)")
        .bind(value.block_id.to_string())
        .bind(&value.tag_name)
        .bind(&value.property_name)
        .bind(&value.value)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete_property_value(
    conn: &mut SqliteConnection,
    block: BlockId,
    tag: &str,
    name: &str,
) -> Result<bool, SupertagError> {
    let result = sqlx::query("DELETE FROM tag_values WHERE blockId = ? AND tagName = ? AND propName = ?")
        .bind(block.to_string())
        .bind(tag)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_property_values(
    conn: &mut SqliteConnection,
    block: BlockId,
    tag: &str,
) -> Result<u64, SupertagError> {
    let result = sqlx::query("DELETE FROM tag_values WHERE blockId = ? AND tagName = ?")
        .bind(block.to_string())
        .bind(tag)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
