//! Read-only block search over the schema store.

use crate::{
    error::SupertagError,
    properties::{Block, BlockId},
};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnection, FromRow, QueryBuilder, Row, Sqlite};

pub const DEFAULT_SEARCH_LIMIT: u32 = 200;

/// Marker for embedded attachments inside block text.
const EMBED_MARKER: &str = "![[";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum SearchFilter {
    /// The block links this tag. Several `Tag` filters must all hold.
    Tag(String),
    /// The block links at least one of these tags.
    AnyTag(Vec<String>),
    /// The block text contains this substring.
    Text(String),
    /// The block stores a non-empty value for this property name under any tag.
    Field(String),
    /// The block embeds an attachment.
    Attachment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockQuery {
    pub filters: Vec<SearchFilter>,
    pub limit: Option<u32>,
}

impl BlockQuery {
    pub fn new() -> BlockQuery {
        BlockQuery::default()
    }

    pub fn tag(mut self, name: impl Into<String>) -> BlockQuery {
        self.filters.push(SearchFilter::Tag(name.into()));
        self
    }

    pub fn any_tag<I, S>(mut self, names: I) -> BlockQuery
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .push(SearchFilter::AnyTag(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn text(mut self, needle: impl Into<String>) -> BlockQuery {
        self.filters.push(SearchFilter::Text(needle.into()));
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> BlockQuery {
        self.filters.push(SearchFilter::Field(name.into()));
        self
    }

    pub fn attachment(mut self) -> BlockQuery {
        self.filters.push(SearchFilter::Attachment);
        self
    }

    pub fn limit(mut self, limit: u32) -> BlockQuery {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_path: String,
    pub block_id: BlockId,
    pub start_line: u32,
    pub text: String,
}

impl FromRow<'_, sqlx::sqlite::SqliteRow> for SearchHit {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        let token: &str = row.try_get("id")?;
        let block_id = token.parse().map_err(|e: SupertagError| sqlx::Error::ColumnDecode {
            index: "id".to_string(),
            source: Box::new(e),
        })?;
        Ok(SearchHit {
            document_path: row.try_get("path")?,
            block_id,
            start_line: row.try_get("startLine")?,
            text: row.try_get("content")?,
        })
    }
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'` pattern.
fn like_contains(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn push_filter(qb: &mut QueryBuilder<Sqlite>, filter: &SearchFilter) {
    match filter {
        SearchFilter::Tag(name) => {
            qb.push("EXISTS (SELECT 1 FROM block_tags bt WHERE bt.blockId = b.id AND bt.tagName = ");
            qb.push_bind(name.clone());
            qb.push(")");
        }
        SearchFilter::AnyTag(names) if names.is_empty() => {
            qb.push("1 = 1");
        }
        SearchFilter::AnyTag(names) => {
            qb.push("EXISTS (SELECT 1 FROM block_tags bt WHERE bt.blockId = b.id AND bt.tagName IN (");
            let mut separated = qb.separated(", ");
            for name in names {
                separated.push_bind(name.clone());
            }
            separated.push_unseparated("))");
        }
        SearchFilter::Text(needle) => {
            qb.push("b.content LIKE ");
            qb.push_bind(like_contains(needle));
            qb.push(" ESCAPE '\\'");
        }
        SearchFilter::Field(name) => {
            qb.push(
                "EXISTS (SELECT 1 FROM tag_values tv WHERE tv.blockId = b.id \
                 AND tv.value IS NOT NULL AND tv.value != '' AND tv.propName = ",
            );
            qb.push_bind(name.clone());
            qb.push(")");
        }
        SearchFilter::Attachment => {
            qb.push("instr(b.content, ");
            qb.push_bind(EMBED_MARKER);
            qb.push(") > 0");
        }
    }
}

/// Blocks matching every filter, ordered by document path then start line.
#[tracing::instrument(skip(conn))]
pub async fn search(
    conn: &mut SqliteConnection,
    query: &BlockQuery,
    default_limit: u32,
) -> Result<Vec<SearchHit>, SupertagError> {
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT f.path, b.id, b.startLine, b.content FROM blocks b JOIN files f ON f.uuid = b.fileUUID",
    );
    for (idx, filter) in query.filters.iter().enumerate() {
        qb.push(if idx == 0 { " WHERE " } else { " AND " });
        push_filter(&mut qb, filter);
    }
    qb.push(" ORDER BY f.path, b.startLine LIMIT ");
    qb.push_bind(query.limit.unwrap_or(default_limit));

    let hits = qb
        .build_query_as::<SearchHit>()
        .fetch_all(&mut *conn)
        .await?;
    tracing::debug!("search matched {} blocks", hits.len());
    Ok(hits)
}

/// Resolve a click on `#tag` in the document at `path`: the block carrying the tag whose line
/// range contains `line_hint`, else the first such block in document order.
pub async fn find_block(
    conn: &mut SqliteConnection,
    path: &str,
    tag: &str,
    line_hint: Option<u32>,
) -> Result<Option<Block>, SupertagError> {
    let candidates = sqlx::query_as::<_, Block>(
        "SELECT b.* FROM blocks b JOIN files f ON f.uuid = b.fileUUID \
         JOIN block_tags bt ON bt.blockId = b.id \
         WHERE f.path = ? AND bt.tagName = ? ORDER BY b.startLine",
    )
    .bind(path)
    .bind(tag)
    .fetch_all(&mut *conn)
    .await?;

    let hinted = line_hint.and_then(|line| {
        candidates
            .iter()
            .position(|b| b.start_line <= line && line <= b.end_line)
    });
    Ok(match hinted {
        Some(idx) => candidates.into_iter().nth(idx),
        None => candidates.into_iter().next(),
    })
}
