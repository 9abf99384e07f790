//! Schema and value edits made outside the sync worker.
//!
//! The live store belongs to the sync worker alone. A [`SchemaEditor`] loads its own transient
//! store from the last written snapshot, applies edits to it, and writes the image back on
//! [`commit`](SchemaEditor::commit). The caller then asks the worker to
//! [`reload`](crate::sync::SyncHandle::reload).
//!
//! Flush the worker before opening an editor; otherwise the editor starts from an image that
//! lacks the worker's unsaved changes, and the reload after commit discards them.
//!
//! ```rust,no_run
//! use supertag_core::{
//!     config::SyncConfig, documents::FsDocumentStore, editor::SchemaEditor,
//!     properties::PropertyType, sync::SyncService,
//! };
//!
//! # async fn run() -> Result<(), supertag_core::SupertagError> {
//! let documents = FsDocumentStore::new("/path/to/vault");
//! let config = SyncConfig::default();
//! let handle = SyncService::open(documents.clone(), config.clone(), None).await?.spawn();
//!
//! handle.flush().await?;
//! let mut editor = SchemaEditor::open(documents, config).await?;
//! editor.add_property("book", "author", PropertyType::Text).await?;
//! editor.commit().await?;
//! handle.reload().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::SyncConfig,
    db::{self, SchemaStore},
    documents::DocumentStore,
    error::SupertagError,
    properties::{unix_now, BlockId, PropertyDefinition, PropertyType, PropertyValue, Supertag},
};

pub struct SchemaEditor<D: DocumentStore> {
    documents: D,
    config: SyncConfig,
    store: SchemaStore,
    edits: usize,
}

/// Tag names are stored without the leading `#` and may not contain whitespace.
fn normalize_tag(name: &str) -> Result<String, SupertagError> {
    let name = name.trim().trim_start_matches('#');
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(SupertagError::Command(format!(
            "{name:?} is not a valid tag name"
        )));
    }
    Ok(name.to_string())
}

impl<D: DocumentStore> SchemaEditor<D> {
    /// Load the snapshot at `config.snapshot_path`. Without one the editor starts empty.
    #[tracing::instrument(skip_all, fields(snapshot = %config.snapshot_path))]
    pub async fn open(documents: D, config: SyncConfig) -> Result<SchemaEditor<D>, SupertagError> {
        let store = if documents.exists(&config.snapshot_path).await? {
            let bytes = documents.read_binary(&config.snapshot_path).await?;
            SchemaStore::from_snapshot(&bytes).await?
        } else {
            SchemaStore::open().await?
        };
        Ok(SchemaEditor {
            documents,
            config,
            store,
            edits: 0,
        })
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    /// Number of edits applied since the editor was opened.
    pub fn edits(&self) -> usize {
        self.edits
    }

    pub async fn supertags(&self) -> Result<Vec<Supertag>, SupertagError> {
        self.store.supertags().await
    }

    pub async fn property_definitions(
        &self,
        tag: &str,
    ) -> Result<Vec<PropertyDefinition>, SupertagError> {
        self.store.property_definitions(&normalize_tag(tag)?).await
    }

    /// Declare `tag` as a supertag. A tag without property definitions that no block links to is
    /// removed by the next orphan sweep.
    pub async fn create_supertag(&mut self, tag: &str) -> Result<(), SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut conn = self.store.connection().await?;
        db::ensure_tag(&mut conn, &tag, unix_now()).await?;
        self.edits += 1;
        Ok(())
    }

    /// Append a property to the schema of `tag`.
    pub async fn add_property(
        &mut self,
        tag: &str,
        name: &str,
        property_type: PropertyType,
    ) -> Result<PropertyDefinition, SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut tx = self.store.begin().await?;
        let position = db::property_definitions(&mut tx, &tag).await?.len() as u32;
        let definition =
            db::add_property_definition(&mut tx, &tag, name, property_type, position, unix_now())
                .await?;
        tx.commit().await?;
        self.edits += 1;
        Ok(definition)
    }

    /// Rename and/or retype a property. Stored values follow a rename.
    pub async fn update_property(
        &mut self,
        tag: &str,
        name: &str,
        new_name: &str,
        property_type: PropertyType,
    ) -> Result<(), SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut tx = self.store.begin().await?;
        db::update_property_definition(&mut tx, &tag, name, new_name, property_type).await?;
        tx.commit().await?;
        self.edits += 1;
        Ok(())
    }

    /// Remove a property together with every value stored for it.
    pub async fn delete_property(&mut self, tag: &str, name: &str) -> Result<bool, SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut tx = self.store.begin().await?;
        let removed = db::delete_property_definition(&mut tx, &tag, name).await?;
        tx.commit().await?;
        if removed {
            self.edits += 1;
        }
        Ok(removed)
    }

    /// Set the display order of the properties of `tag` to the order of `names`.
    pub async fn reorder_properties(
        &mut self,
        tag: &str,
        names: &[String],
    ) -> Result<(), SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut tx = self.store.begin().await?;
        db::reorder_property_definitions(&mut tx, &tag, names).await?;
        tx.commit().await?;
        self.edits += 1;
        Ok(())
    }

    /// Replace the values of `tag` on `block`. Rejected unless the block currently carries the
    /// tag.
    pub async fn set_values(
        &mut self,
        block: BlockId,
        tag: &str,
        values: &[(String, String)],
    ) -> Result<usize, SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut tx = self.store.begin().await?;
        let stored = db::set_property_values(&mut tx, block, &tag, values).await?;
        tx.commit().await?;
        self.edits += 1;
        Ok(stored)
    }

    pub async fn values(
        &self,
        block: BlockId,
        tag: &str,
    ) -> Result<Vec<PropertyValue>, SupertagError> {
        self.store.property_values(block, &normalize_tag(tag)?).await
    }

    pub async fn delete_value(
        &mut self,
        block: BlockId,
        tag: &str,
        name: &str,
    ) -> Result<bool, SupertagError> {
        let tag = normalize_tag(tag)?;
        let mut conn = self.store.connection().await?;
        let removed = db::delete_property_value(&mut conn, block, &tag, name).await?;
        if removed {
            self.edits += 1;
        }
        Ok(removed)
    }

    /// Write the edited image over the snapshot and close the transient store. Returns the image
    /// size in bytes.
    pub async fn commit(self) -> Result<usize, SupertagError> {
        let bytes = self.store.export_snapshot().await?;
        self.documents
            .write_binary(&self.config.snapshot_path, &bytes)
            .await?;
        self.store.close().await;
        tracing::info!(
            "[SchemaEditor] committed {} edits ({} bytes)",
            self.edits,
            bytes.len()
        );
        Ok(bytes.len())
    }

    /// Drop every edit.
    pub async fn discard(self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::MemoryDocumentStore;

    #[test_log::test]
    fn test_tag_names_are_normalized() {
        assert_eq!(normalize_tag("#book").unwrap(), "book");
        assert_eq!(normalize_tag("  area/work ").unwrap(), "area/work");
        assert!(normalize_tag("#").is_err());
        assert!(normalize_tag("two words").is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_commit_writes_snapshot_that_reopens() {
        let documents = MemoryDocumentStore::new();
        let config = SyncConfig::default();
        let mut editor = SchemaEditor::open(documents.clone(), config.clone())
            .await
            .unwrap();
        editor.add_property("#book", "title", PropertyType::Text).await.unwrap();
        editor.add_property("book", "pages", PropertyType::Number).await.unwrap();
        editor
            .reorder_properties("book", &["pages".to_string(), "title".to_string()])
            .await
            .unwrap();
        assert_eq!(editor.edits(), 3);
        editor.commit().await.unwrap();

        let reopened = SchemaEditor::open(documents, config).await.unwrap();
        let names: Vec<String> = reopened
            .property_definitions("book")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["pages".to_string(), "title".to_string()]);
    }

    #[test_log::test(tokio::test)]
    async fn test_conflicting_rename_leaves_schema_untouched() {
        let mut editor = SchemaEditor::open(MemoryDocumentStore::new(), SyncConfig::default())
            .await
            .unwrap();
        editor.add_property("book", "title", PropertyType::Text).await.unwrap();
        editor.add_property("book", "isbn", PropertyType::Text).await.unwrap();
        let err = editor
            .update_property("book", "isbn", "title", PropertyType::Number)
            .await
            .unwrap_err();
        assert!(matches!(err, SupertagError::Conflict(_)));
        assert_eq!(editor.edits(), 2);
        let defs = editor.property_definitions("book").await.unwrap();
        assert_eq!(defs[1].name, "isbn");
        assert_eq!(defs[1].property_type, PropertyType::Text);
    }

    #[test_log::test(tokio::test)]
    async fn test_discarded_edits_do_not_reach_the_snapshot() {
        let documents = MemoryDocumentStore::new();
        let editor_config = SyncConfig::default();
        let mut editor = SchemaEditor::open(documents.clone(), editor_config.clone())
            .await
            .unwrap();
        editor.create_supertag("idea").await.unwrap();
        editor.discard().await;
        assert!(!documents.exists(&editor_config.snapshot_path).await.unwrap());
    }
}
