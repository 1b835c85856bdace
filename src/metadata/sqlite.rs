//! SQLite-backed metadata repository.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Timestamps are stored as fixed-width RFC 3339 text with nanoseconds, so
//! `ORDER BY created_at` sorts chronologically.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{ListQuery, ListResult, MetaData, MetaDataRepo, ObjectEntry};
use crate::cursor::{decode_cursor, escape_like_pattern, format_timestamp, parse_timestamp};
use crate::errors::{Result, ResultExt, StowryError};
use crate::path::is_valid_table_name;

const SELECT_COLUMNS: &str = "id, path, content_type, etag, file_size_bytes, \
                              created_at, updated_at, deleted_at, cleaned_up_at";

/// Expected `(column, declared type, nullable)` triples.
const EXPECTED_COLUMNS: &[(&str, &str, bool)] = &[
    ("id", "text", false),
    ("path", "text", false),
    ("content_type", "text", false),
    ("etag", "text", false),
    ("file_size_bytes", "integer", false),
    ("created_at", "text", false),
    ("updated_at", "text", false),
    ("deleted_at", "text", true),
    ("cleaned_up_at", "text", true),
];

/// Metadata repository backed by a single SQLite database file.
pub struct SqliteMetaDataRepo {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteMetaDataRepo {
    /// Open (or create) the database at `path`.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    /// The schema is not touched; call [`migrate`](Self::migrate).
    pub fn open(path: &str, table: &str) -> Result<Self> {
        if !is_valid_table_name(table) {
            return Err(StowryError::invalid(format!("invalid table name: {table}")));
        }
        let conn = Connection::open(path).wrap_err("open sqlite")?;
        let repo = Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        };
        repo.apply_pragmas()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StowryError::Internal(anyhow::anyhow!("sqlite connection mutex poisoned")))
    }

    fn apply_pragmas(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA case_sensitive_like = ON;
            ",
        )
        .wrap_err("apply pragmas")?;
        Ok(())
    }

    /// Create the table and its indexes if they do not already exist.
    /// Idempotent; safe to call on every startup.
    pub fn migrate(&self) -> Result<()> {
        let t = &self.table;
        let conn = self.conn()?;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{t}" (
                id              TEXT NOT NULL PRIMARY KEY,
                path            TEXT NOT NULL UNIQUE,
                content_type    TEXT NOT NULL,
                etag            TEXT NOT NULL,
                file_size_bytes INTEGER NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                deleted_at      TEXT,
                cleaned_up_at   TEXT
            );

            CREATE INDEX IF NOT EXISTS "idx_{t}_deleted_at"
                ON "{t}" (deleted_at);
            CREATE INDEX IF NOT EXISTS "idx_{t}_pending_cleanup"
                ON "{t}" (deleted_at, cleaned_up_at);
            CREATE INDEX IF NOT EXISTS "idx_{t}_active_list"
                ON "{t}" (created_at, path);
            "#
        ))
        .wrap_err_with(|| format!("migrate {t}"))?;
        Ok(())
    }

    /// Check that the table exists with the expected columns.
    pub fn validate_schema(&self) -> Result<()> {
        let t = &self.table;
        let conn = self.conn()?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![t],
                |row| row.get(0),
            )
            .optional()
            .wrap_err("validate schema")?;
        if exists.is_none() {
            return Err(StowryError::Internal(anyhow::anyhow!(
                "validate schema: table {t} does not exist"
            )));
        }

        let mut stmt = conn
            .prepare(&format!(r#"PRAGMA table_info("{t}")"#))
            .wrap_err("validate schema")?;
        let actual = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let data_type: String = row.get(2)?;
                let not_null: i64 = row.get(3)?;
                Ok((name, data_type.to_lowercase(), not_null == 0))
            })
            .wrap_err("validate schema")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .wrap_err("validate schema")?;

        let mut problems = Vec::new();
        for (name, data_type, nullable) in EXPECTED_COLUMNS {
            match actual.iter().find(|(n, _, _)| n == name) {
                None => problems.push(format!("missing column {name}")),
                Some((_, actual_type, actual_nullable)) => {
                    if actual_type != data_type {
                        problems.push(format!("{name}: expected {data_type}, got {actual_type}"));
                    }
                    if actual_nullable != nullable {
                        problems.push(format!(
                            "{name}: expected nullable={nullable}, got nullable={actual_nullable}"
                        ));
                    }
                }
            }
        }

        if !problems.is_empty() {
            return Err(StowryError::Internal(anyhow::anyhow!(
                "table {t} schema validation failed: {}",
                problems.join("; ")
            )));
        }
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(())).wrap_err("ping")?;
        Ok(())
    }

    fn list_with_condition(&self, query: &ListQuery, condition: &str, op: &str) -> Result<ListResult> {
        let cursor = decode_cursor(&query.cursor).wrap_err(op)?;
        let limit = query.effective_limit();
        let fetch = limit as i64 + 1;
        let prefix = escape_like_pattern(&query.path_prefix);
        let t = &self.table;

        let conn = self.conn()?;
        let rows = if cursor.is_zero() {
            let mut stmt = conn
                .prepare(&format!(
                    r#"SELECT {SELECT_COLUMNS} FROM "{t}"
                       WHERE {condition} AND path LIKE ?1 || '%' ESCAPE '\'
                       ORDER BY created_at, path
                       LIMIT ?2"#
                ))
                .wrap_err(op)?;
            let rows = stmt
                .query_map(params![prefix, fetch], map_row)
                .wrap_err(op)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .wrap_err(op)?;
            rows
        } else {
            let mut stmt = conn
                .prepare(&format!(
                    r#"SELECT {SELECT_COLUMNS} FROM "{t}"
                       WHERE {condition} AND path LIKE ?1 || '%' ESCAPE '\'
                         AND (created_at, path) > (?2, ?3)
                       ORDER BY created_at, path
                       LIMIT ?4"#
                ))
                .wrap_err(op)?;
            let rows = stmt
                .query_map(
                    params![prefix, format_timestamp(&cursor.created_at), cursor.path, fetch],
                    map_row,
                )
                .wrap_err(op)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .wrap_err(op)?;
            rows
        };

        Ok(ListResult::from_rows(rows, limit))
    }
}

// -- Row mapping --------------------------------------------------------------

fn map_row(row: &Row<'_>) -> rusqlite::Result<MetaData> {
    Ok(MetaData {
        id: row.get(0)?,
        path: row.get(1)?,
        content_type: row.get(2)?,
        etag: row.get(3)?,
        file_size_bytes: row.get(4)?,
        created_at: time_column(row, 5)?,
        updated_at: time_column(row, 6)?,
        deleted_at: opt_time_column(row, 7)?,
        cleaned_up_at: opt_time_column(row, 8)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        parse_timestamp(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn now() -> String {
    format_timestamp(&Utc::now())
}

// ── MetaDataRepo implementation ────────────────────────────────────

impl MetaDataRepo for SqliteMetaDataRepo {
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<MetaData>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let row = conn
                .query_row(
                    &format!(
                        r#"SELECT {SELECT_COLUMNS} FROM "{}"
                           WHERE path = ?1 AND deleted_at IS NULL"#,
                        self.table
                    ),
                    params![path],
                    map_row,
                )
                .optional()
                .wrap_err("get")?;
            row.ok_or_else(|| StowryError::NotFound.context("get"))
        })
    }

    fn upsert(
        &self,
        entry: ObjectEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(MetaData, bool)>> + Send + '_>> {
        Box::pin(async move {
            let new_id = uuid::Uuid::new_v4().to_string();
            let now = now();
            let conn = self.conn()?;
            let meta = conn
                .query_row(
                    &format!(
                        r#"INSERT INTO "{}"
                               (id, path, content_type, etag, file_size_bytes, created_at, updated_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                           ON CONFLICT(path) DO UPDATE SET
                               content_type    = excluded.content_type,
                               etag            = excluded.etag,
                               file_size_bytes = excluded.file_size_bytes,
                               updated_at      = excluded.updated_at,
                               deleted_at      = NULL,
                               cleaned_up_at   = NULL
                           RETURNING {SELECT_COLUMNS}"#,
                        self.table
                    ),
                    params![
                        new_id,
                        entry.path,
                        entry.content_type,
                        entry.etag,
                        entry.size,
                        now
                    ],
                    map_row,
                )
                .wrap_err("upsert")?;
            let inserted = meta.id == new_id;
            Ok((meta, inserted))
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn
                .execute(
                    &format!(
                        r#"UPDATE "{}" SET deleted_at = ?1
                           WHERE path = ?2 AND deleted_at IS NULL"#,
                        self.table
                    ),
                    params![now(), path],
                )
                .wrap_err("delete")?;
            if changed == 0 {
                return Err(StowryError::NotFound.context("delete"));
            }
            Ok(())
        })
    }

    fn list(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
        Box::pin(async move { self.list_with_condition(&query, "deleted_at IS NULL", "list") })
    }

    fn list_pending_cleanup(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
        Box::pin(async move {
            self.list_with_condition(
                &query,
                "deleted_at IS NOT NULL AND cleaned_up_at IS NULL",
                "list pending cleanup",
            )
        })
    }

    fn mark_cleaned_up(&self, id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let changed = conn
                .execute(
                    &format!(
                        r#"UPDATE "{}" SET cleaned_up_at = ?1
                           WHERE id = ?2 AND deleted_at IS NOT NULL AND cleaned_up_at IS NULL"#,
                        self.table
                    ),
                    params![now(), id],
                )
                .wrap_err("mark cleaned up")?;
            if changed == 0 {
                return Err(StowryError::NotFound.context("mark cleaned up"));
            }
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn test_repo() -> SqliteMetaDataRepo {
        let repo = SqliteMetaDataRepo::open(":memory:", "stowry_metadata").expect("open");
        repo.migrate().expect("migrate");
        repo
    }

    fn entry(path: &str, etag: &str, size: i64) -> ObjectEntry {
        ObjectEntry {
            path: path.to_string(),
            size,
            etag: etag.to_string(),
            content_type: "text/plain".to_string(),
        }
    }

    #[test]
    fn test_rejects_invalid_table_name() {
        let err = SqliteMetaDataRepo::open(":memory:", "bad-name").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_migrate_idempotent_and_schema_valid() {
        let repo = test_repo();
        repo.migrate().unwrap();
        repo.validate_schema().unwrap();
        repo.ping().unwrap();
    }

    #[test]
    fn test_validate_schema_missing_table() {
        let repo = SqliteMetaDataRepo::open(":memory:", "stowry_metadata").unwrap();
        assert!(repo.validate_schema().is_err());
    }

    #[test]
    fn test_validate_schema_detects_missing_column() {
        let repo = SqliteMetaDataRepo::open(":memory:", "partial").unwrap();
        repo.conn()
            .unwrap()
            .execute_batch("CREATE TABLE partial (id TEXT NOT NULL PRIMARY KEY, path TEXT NOT NULL)")
            .unwrap();
        let err = repo.validate_schema().unwrap_err();
        assert!(err.to_string().contains("missing column etag"));
    }

    #[tokio::test]
    async fn test_upsert_insert_then_update() {
        let repo = test_repo();
        let (first, inserted) = repo.upsert(entry("a.txt", "e1", 3)).await.unwrap();
        assert!(inserted);
        assert_eq!(first.etag, "e1");

        let (second, inserted) = repo.upsert(entry("a.txt", "e2", 5)).await.unwrap();
        assert!(!inserted);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.etag, "e2");
        assert_eq!(second.file_size_bytes, 5);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let repo = test_repo();
        let err = repo.get("nope.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_restore_keeps_id() {
        let repo = test_repo();
        let (orig, _) = repo.upsert(entry("a.txt", "e1", 1)).await.unwrap();

        repo.delete("a.txt").await.unwrap();
        assert!(repo.get("a.txt").await.unwrap_err().is_not_found());
        assert!(repo.delete("a.txt").await.unwrap_err().is_not_found());

        let (restored, inserted) = repo.upsert(entry("a.txt", "e2", 2)).await.unwrap();
        assert!(!inserted);
        assert_eq!(restored.id, orig.id);
        assert_eq!(restored.deleted_at, None);
        assert_eq!(repo.get("a.txt").await.unwrap().etag, "e2");
    }

    #[tokio::test]
    async fn test_list_pagination_stable() {
        let repo = test_repo();
        for p in ["a", "b", "c"] {
            repo.upsert(entry(p, "e", 1)).await.unwrap();
        }

        let page1 = repo.list(ListQuery::new("", 2, "")).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(!page1.next_cursor.is_empty());

        let page2 = repo
            .list(ListQuery::new("", 2, page1.next_cursor.clone()))
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 1);
        assert!(page2.next_cursor.is_empty());
        assert!(page1.items.iter().all(|a| page2.items.iter().all(|b| a.id != b.id)));
    }

    #[tokio::test]
    async fn test_list_skips_deleted_mid_pagination() {
        let repo = test_repo();
        for p in ["a", "b", "c", "d"] {
            repo.upsert(entry(p, "e", 1)).await.unwrap();
        }
        let page1 = repo.list(ListQuery::new("", 2, "")).await.unwrap();
        repo.delete("c").await.unwrap();
        let page2 = repo.list(ListQuery::new("", 2, page1.next_cursor)).await.unwrap();
        let paths: Vec<_> = page2.items.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["d"]);
    }

    #[tokio::test]
    async fn test_list_prefix_is_literal() {
        let repo = test_repo();
        for p in ["100%/a", "100x/b", "a_b/c", "axb/d"] {
            repo.upsert(entry(p, "e", 1)).await.unwrap();
        }
        let pct = repo.list(ListQuery::new("100%", 10, "")).await.unwrap();
        assert_eq!(pct.items.len(), 1);
        assert_eq!(pct.items[0].path, "100%/a");

        let underscore = repo.list(ListQuery::new("a_", 10, "")).await.unwrap();
        assert_eq!(underscore.items.len(), 1);
        assert_eq!(underscore.items[0].path, "a_b/c");
    }

    #[tokio::test]
    async fn test_list_prefix_is_case_sensitive() {
        let repo = test_repo();
        repo.upsert(entry("docs/a.txt", "e", 1)).await.unwrap();
        repo.upsert(entry("Docs/b.txt", "e", 1)).await.unwrap();

        let page = repo.list(ListQuery::new("docs/", 10, "")).await.unwrap();
        let paths: Vec<_> = page.items.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, ["docs/a.txt"]);

        repo.delete("Docs/b.txt").await.unwrap();
        let pending = repo
            .list_pending_cleanup(ListQuery::new("docs/", 10, ""))
            .await
            .unwrap();
        assert!(pending.items.is_empty());
    }

    #[tokio::test]
    async fn test_list_bad_cursor() {
        let repo = test_repo();
        let err = repo.list(ListQuery::new("", 10, "%%%")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_pending_cleanup_and_mark() {
        let repo = test_repo();
        let (a, _) = repo.upsert(entry("a", "e", 1)).await.unwrap();
        repo.upsert(entry("b", "e", 1)).await.unwrap();
        repo.delete("a").await.unwrap();

        let pending = repo.list_pending_cleanup(ListQuery::new("", 10, "")).await.unwrap();
        assert_eq!(pending.items.len(), 1);
        assert_eq!(pending.items[0].id, a.id);
        assert!(pending.items[0].deleted_at.is_some());

        repo.mark_cleaned_up(&a.id).await.unwrap();
        let pending = repo.list_pending_cleanup(ListQuery::new("", 10, "")).await.unwrap();
        assert!(pending.items.is_empty());

        assert!(repo.mark_cleaned_up(&a.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mark_cleaned_up_requires_deleted() {
        let repo = test_repo();
        let (a, _) = repo.upsert(entry("a", "e", 1)).await.unwrap();
        assert!(repo.mark_cleaned_up(&a.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restore_clears_cleaned_up() {
        let repo = test_repo();
        let (a, _) = repo.upsert(entry("a", "e", 1)).await.unwrap();
        repo.delete("a").await.unwrap();
        repo.mark_cleaned_up(&a.id).await.unwrap();

        let (restored, _) = repo.upsert(entry("a", "e2", 1)).await.unwrap();
        assert_eq!(restored.cleaned_up_at, None);
        assert_eq!(restored.deleted_at, None);
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let repo = SqliteMetaDataRepo::open(":memory:", "tenant_a_objects").unwrap();
        repo.migrate().unwrap();
        repo.validate_schema().unwrap();
        repo.upsert(entry("x", "e", 1)).await.unwrap();
        assert_eq!(repo.get("x").await.unwrap().path, "x");
    }
}
