//! Metadata repository trait and record types.
//!
//! Any metadata backend must implement [`MetaDataRepo`].  The trait uses
//! manually desugared async methods (pinned futures) so it can be held as
//! `Arc<dyn MetaDataRepo>` by the service.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cursor::encode_cursor;
use crate::errors::Result;

// ── Record types ───────────────────────────────────────────────────

/// Persisted metadata for one object path.
///
/// `cleaned_up_at` is only ever set on a row whose `deleted_at` is set.
/// Re-writing a path clears both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct MetaData {
    /// Opaque id assigned on first insert; stable across restores.
    pub id: String,
    pub path: String,
    pub content_type: String,
    /// Hex SHA-256 of the content.
    pub etag: String,
    pub file_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned_up_at: Option<DateTime<Utc>>,
}

/// Write intent handed from a storage write to a metadata upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub path: String,
    pub size: i64,
    pub etag: String,
    pub content_type: String,
}

/// Parameters of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Literal path prefix; `%` and `_` are not wildcards.
    pub path_prefix: String,
    /// Page size.  Values below 1 are treated as 1.
    pub limit: usize,
    /// Opaque cursor from a previous page, or empty for the first page.
    pub cursor: String,
}

impl ListQuery {
    pub fn new(path_prefix: impl Into<String>, limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            limit,
            cursor: cursor.into(),
        }
    }

    /// Page size clamped to at least 1.
    pub fn effective_limit(&self) -> usize {
        self.limit.max(1)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ListResult {
    pub items: Vec<MetaData>,
    /// Cursor for the next page; empty on the last page.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub next_cursor: String,
}

impl ListResult {
    /// Build a page from up to `limit + 1` rows fetched in `(created_at,
    /// path)` order.  The extra row only signals that another page exists.
    pub fn from_rows(mut rows: Vec<MetaData>, limit: usize) -> Self {
        let mut next_cursor = String::new();
        if rows.len() > limit {
            rows.truncate(limit);
            if let Some(last) = rows.last() {
                next_cursor = encode_cursor(&last.created_at, &last.path);
            }
        }
        Self {
            items: rows,
            next_cursor,
        }
    }
}

// ── Repository trait ───────────────────────────────────────────────

/// Metadata persistence consumed by the object service.
///
/// Implementations must:
/// - exclude soft-deleted rows from [`get`](Self::get) and
///   [`list`](Self::list);
/// - return only deleted, not-yet-cleaned rows from
///   [`list_pending_cleanup`](Self::list_pending_cleanup);
/// - implement [`upsert`](Self::upsert) as a single atomic write that keeps
///   `id` and `created_at` and clears `deleted_at` / `cleaned_up_at`.
pub trait MetaDataRepo: Send + Sync + 'static {
    /// Active record for `path`, or `NotFound`.
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<MetaData>> + Send + '_>>;

    /// Insert or update; the flag is `true` when a new row was created.
    fn upsert(
        &self,
        entry: ObjectEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(MetaData, bool)>> + Send + '_>>;

    /// Soft-delete the active record for `path`, or `NotFound`.
    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Page through active records.
    fn list(&self, query: ListQuery)
        -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>>;

    /// Page through soft-deleted records whose bytes are not yet purged.
    fn list_pending_cleanup(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>>;

    /// Record that the bytes for row `id` are gone.  `NotFound` unless the
    /// row is deleted and not yet cleaned up.
    fn mark_cleaned_up(&self, id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
