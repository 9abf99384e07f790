//! Identifiers and rows of the block/tag/property data model.

use crate::{error::SupertagError, hash::ContentHash};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Seconds since the unix epoch, the timestamp unit of every persisted row.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn nil() -> Self {
                $name(Uuid::nil())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = SupertagError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(Uuid::parse_str(s)?))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = SupertagError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $name::from_str(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }
    };
}

uuid_id!(
    /// Stable document identity. Survives renames; `path` is only a lookup key.
    DocumentId
);
uuid_id!(
    /// Stable block identity, preserved across edits whenever reconciliation can match the block.
    BlockId
);

/// Field types a supertag property may declare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyType {
    #[default]
    Text,
    Number,
    ImageUrl,
    Link,
    Location,
    Phone,
    Email,
    Boolean,
    Date,
    Time,
    DateTime,
    SingleSelect,
    MultiSelect,
}

impl PropertyType {
    pub const ALL: [PropertyType; 13] = [
        PropertyType::Text,
        PropertyType::Number,
        PropertyType::ImageUrl,
        PropertyType::Link,
        PropertyType::Location,
        PropertyType::Phone,
        PropertyType::Email,
        PropertyType::Boolean,
        PropertyType::Date,
        PropertyType::Time,
        PropertyType::DateTime,
        PropertyType::SingleSelect,
        PropertyType::MultiSelect,
    ];

    /// Numeric code persisted in `tag_properties.type`.
    pub fn code(&self) -> u32 {
        match self {
            PropertyType::Text => 1,
            PropertyType::Number => 2,
            PropertyType::ImageUrl => 3,
            PropertyType::Link => 4,
            PropertyType::Location => 5,
            PropertyType::Phone => 6,
            PropertyType::Email => 7,
            PropertyType::Boolean => 8,
            PropertyType::Date => 9,
            PropertyType::Time => 10,
            PropertyType::DateTime => 11,
            PropertyType::SingleSelect => 12,
            PropertyType::MultiSelect => 13,
        }
    }

    pub fn from_code(code: u32) -> Option<PropertyType> {
        PropertyType::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PropertyType::Text => "Text",
            PropertyType::Number => "Number",
            PropertyType::ImageUrl => "Image",
            PropertyType::Link => "Link",
            PropertyType::Location => "Location",
            PropertyType::Phone => "Phone",
            PropertyType::Email => "Email",
            PropertyType::Boolean => "Boolean",
            PropertyType::Date => "Date",
            PropertyType::Time => "Time",
            PropertyType::DateTime => "Date & Time",
            PropertyType::SingleSelect => "Single select",
            PropertyType::MultiSelect => "Multi select",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn parse_hash(row: &SqliteRow, column: &str) -> sqlx::Result<ContentHash> {
    let token: Option<&str> = row.try_get(column)?;
    match token {
        Some(token) => {
            ContentHash::from_str(token).map_err(|e| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(e),
            })
        }
        None => Ok(ContentHash::default()),
    }
}

fn parse_id<T>(row: &SqliteRow, column: &str) -> sqlx::Result<T>
where
    T: FromStr<Err = SupertagError>,
{
    let token: &str = row.try_get(column)?;
    T::from_str(token).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub path: String,
    pub content: String,
    pub content_hash: ContentHash,
    pub line_count: u32,
    pub modified_at: i64,
    pub synced_at: i64,
}

impl FromRow<'_, SqliteRow> for Document {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Document {
            id: parse_id(row, "uuid")?,
            path: row.try_get("path")?,
            content: row.try_get::<Option<String>, _>("content")?.unwrap_or_default(),
            content_hash: parse_hash(row, "hash")?,
            line_count: row.try_get::<Option<u32>, _>("lineCount")?.unwrap_or_default(),
            modified_at: row.try_get::<Option<i64>, _>("modifiedAt")?.unwrap_or_default(),
            synced_at: row.try_get::<Option<i64>, _>("syncedAt")?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub document_id: DocumentId,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub content_hash: ContentHash,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FromRow<'_, SqliteRow> for Block {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Block {
            id: parse_id(row, "id")?,
            document_id: parse_id(row, "fileUUID")?,
            start_line: row.try_get("startLine")?,
            end_line: row.try_get("endLine")?,
            text: row.try_get("content")?,
            content_hash: parse_hash(row, "contentHash")?,
            created_at: row.try_get("createdAt")?,
            updated_at: row.try_get("updatedAt")?,
        })
    }
}

/// The slice of a persisted block the reconciler matches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: BlockId,
    pub content_hash: ContentHash,
    pub start_line: u32,
}

impl FromRow<'_, SqliteRow> for StoredBlock {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(StoredBlock {
            id: parse_id(row, "id")?,
            content_hash: parse_hash(row, "contentHash")?,
            start_line: row.try_get("startLine")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub created_at: i64,
}

impl FromRow<'_, SqliteRow> for Tag {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Tag {
            name: row.try_get("name")?,
            created_at: row.try_get("createdAt")?,
        })
    }
}

/// Where a tag occurs inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTag {
    pub block_id: BlockId,
    pub tag_name: String,
    /// Character offset of the `#` inside the block text.
    pub position: u32,
}

impl FromRow<'_, SqliteRow> for BlockTag {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(BlockTag {
            block_id: parse_id(row, "blockId")?,
            tag_name: row.try_get("tagName")?,
            position: row.try_get::<Option<u32>, _>("position")?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub tag_name: String,
    pub name: String,
    pub property_type: PropertyType,
    pub display_order: u32,
}

impl FromRow<'_, SqliteRow> for PropertyDefinition {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let code: u32 = row.try_get("type")?;
        // Unknown codes come from newer images; show them as plain text rather than failing.
        let property_type = PropertyType::from_code(code).unwrap_or_default();
        Ok(PropertyDefinition {
            tag_name: row.try_get("tagName")?,
            name: row.try_get("name")?,
            property_type,
            display_order: row.try_get::<Option<u32>, _>("pos")?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    pub block_id: BlockId,
    pub tag_name: String,
    pub property_name: String,
    pub value: Option<String>,
}

impl FromRow<'_, SqliteRow> for PropertyValue {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(PropertyValue {
            block_id: parse_id(row, "blockId")?,
            tag_name: row.try_get("tagName")?,
            property_name: row.try_get("propName")?,
            value: row.try_get("value")?,
        })
    }
}

/// A tag together with its declared property schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Supertag {
    pub name: String,
    pub properties: Vec<PropertyDefinition>,
}
