//! PostgreSQL-backed metadata repository.
//!
//! Uses a `sqlx` connection pool.  Timestamps are native `TIMESTAMPTZ` and
//! ids are server-generated UUIDs.  The upsert reports whether it inserted
//! through the `xmax = 0` system-column trick, so it stays a single
//! statement.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use super::store::{ListQuery, ListResult, MetaData, MetaDataRepo, ObjectEntry};
use crate::cursor::{decode_cursor, escape_like_pattern};
use crate::errors::{Result, ResultExt, StowryError};
use crate::path::is_valid_table_name;

const SELECT_COLUMNS: &str = "id::text AS id, path, content_type, etag, file_size_bytes, \
                              created_at, updated_at, deleted_at, cleaned_up_at";

/// Expected `(column, information_schema data_type, nullable)` triples.
const EXPECTED_COLUMNS: &[(&str, &str, bool)] = &[
    ("id", "uuid", false),
    ("path", "text", false),
    ("content_type", "text", false),
    ("etag", "text", false),
    ("file_size_bytes", "bigint", false),
    ("created_at", "timestamp with time zone", false),
    ("updated_at", "timestamp with time zone", false),
    ("deleted_at", "timestamp with time zone", true),
    ("cleaned_up_at", "timestamp with time zone", true),
];

/// Metadata repository backed by PostgreSQL.
pub struct PostgresMetaDataRepo {
    pool: PgPool,
    table: String,
}

impl PostgresMetaDataRepo {
    /// Connect a pool to `dsn`.  The schema is not touched; call
    /// [`migrate`](Self::migrate).
    pub async fn connect(dsn: &str, table: &str, max_connections: u32) -> Result<Self> {
        if !is_valid_table_name(table) {
            return Err(StowryError::invalid(format!("invalid table name: {table}")));
        }
        let opts = PgConnectOptions::from_str(dsn).wrap_err("parse postgres dsn")?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await
            .wrap_err("connect postgres")?;
        Self::from_pool(pool, table)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        if !is_valid_table_name(table) {
            return Err(StowryError::invalid(format!("invalid table name: {table}")));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Create the table and its partial indexes if they do not already exist.
    pub async fn migrate(&self) -> Result<()> {
        let t = &self.table;
        let statements = [
            format!(
                r#"CREATE TABLE IF NOT EXISTS "{t}" (
                    id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    path            TEXT NOT NULL UNIQUE,
                    content_type    TEXT NOT NULL,
                    etag            TEXT NOT NULL,
                    file_size_bytes BIGINT NOT NULL,
                    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at      TIMESTAMPTZ,
                    cleaned_up_at   TIMESTAMPTZ
                )"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "idx_{t}_deleted_at"
                   ON "{t}" (deleted_at) WHERE (deleted_at IS NOT NULL)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "idx_{t}_pending_cleanup"
                   ON "{t}" (deleted_at, cleaned_up_at)
                   WHERE (deleted_at IS NOT NULL AND cleaned_up_at IS NULL)"#
            ),
            format!(
                r#"CREATE INDEX IF NOT EXISTS "idx_{t}_active_list"
                   ON "{t}" (created_at, path) WHERE (deleted_at IS NULL)"#
            ),
        ];
        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .wrap_err_with(|| format!("migrate {t}"))?;
        }
        Ok(())
    }

    /// Check that the table exists with the expected columns.
    pub async fn validate_schema(&self) -> Result<()> {
        let t = &self.table;
        let rows = sqlx::query(
            "SELECT column_name::text, data_type::text, is_nullable::text
             FROM information_schema.columns
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(t)
        .fetch_all(&self.pool)
        .await
        .wrap_err("validate schema")?;

        if rows.is_empty() {
            return Err(StowryError::Internal(anyhow::anyhow!(
                "validate schema: table {t} does not exist"
            )));
        }

        let mut actual = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get(0).wrap_err("validate schema")?;
            let data_type: String = row.try_get(1).wrap_err("validate schema")?;
            let nullable: String = row.try_get(2).wrap_err("validate schema")?;
            actual.push((name, data_type, nullable == "YES"));
        }

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

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .wrap_err("ping")?;
        Ok(())
    }

    async fn list_with_condition(
        &self,
        query: &ListQuery,
        condition: &str,
        op: &str,
    ) -> Result<ListResult> {
        let cursor = decode_cursor(&query.cursor).wrap_err(op)?;
        let limit = query.effective_limit();
        let fetch = limit as i64 + 1;
        let prefix = escape_like_pattern(&query.path_prefix);
        let t = &self.table;

        let rows = if cursor.is_zero() {
            let sql = format!(
                r#"SELECT {SELECT_COLUMNS} FROM "{t}"
                   WHERE {condition} AND path LIKE $1 || '%' ESCAPE '\'
                   ORDER BY created_at, path
                   LIMIT $2"#
            );
            sqlx::query(&sql)
                .bind(&prefix)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
                .wrap_err(op)?
        } else {
            let sql = format!(
                r#"SELECT {SELECT_COLUMNS} FROM "{t}"
                   WHERE {condition} AND path LIKE $1 || '%' ESCAPE '\'
                     AND (created_at, path) > ($2, $3)
                   ORDER BY created_at, path
                   LIMIT $4"#
            );
            sqlx::query(&sql)
                .bind(&prefix)
                .bind(cursor.created_at)
                .bind(&cursor.path)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
                .wrap_err(op)?
        };

        let items = rows
            .iter()
            .map(map_row)
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .wrap_err(op)?;
        Ok(ListResult::from_rows(items, limit))
    }
}

fn map_row(row: &PgRow) -> std::result::Result<MetaData, sqlx::Error> {
    Ok(MetaData {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        content_type: row.try_get("content_type")?,
        etag: row.try_get("etag")?,
        file_size_bytes: row.try_get("file_size_bytes")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        deleted_at: row.try_get::<Option<DateTime<Utc>>, _>("deleted_at")?,
        cleaned_up_at: row.try_get::<Option<DateTime<Utc>>, _>("cleaned_up_at")?,
    })
}

// ── MetaDataRepo implementation ────────────────────────────────────

impl MetaDataRepo for PostgresMetaDataRepo {
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<MetaData>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let sql = format!(
                r#"SELECT {SELECT_COLUMNS} FROM "{}"
                   WHERE path = $1 AND deleted_at IS NULL"#,
                self.table
            );
            let row = sqlx::query(&sql)
                .bind(&path)
                .fetch_optional(&self.pool)
                .await
                .wrap_err("get")?;
            match row {
                Some(row) => map_row(&row).wrap_err("get"),
                None => Err(StowryError::NotFound.context("get")),
            }
        })
    }

    fn upsert(
        &self,
        entry: ObjectEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(MetaData, bool)>> + Send + '_>> {
        Box::pin(async move {
            let sql = format!(
                r#"INSERT INTO "{}" (path, content_type, etag, file_size_bytes)
                   VALUES ($1, $2, $3, $4)
                   ON CONFLICT (path) DO UPDATE SET
                       content_type    = EXCLUDED.content_type,
                       etag            = EXCLUDED.etag,
                       file_size_bytes = EXCLUDED.file_size_bytes,
                       updated_at      = NOW(),
                       deleted_at      = NULL,
                       cleaned_up_at   = NULL
                   RETURNING {SELECT_COLUMNS}, (xmax = 0) AS inserted"#,
                self.table
            );
            let row = sqlx::query(&sql)
                .bind(&entry.path)
                .bind(&entry.content_type)
                .bind(&entry.etag)
                .bind(entry.size)
                .fetch_one(&self.pool)
                .await
                .wrap_err("upsert")?;
            let meta = map_row(&row).wrap_err("upsert")?;
            let inserted: bool = row.try_get("inserted").wrap_err("upsert")?;
            Ok((meta, inserted))
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let sql = format!(
                r#"UPDATE "{}" SET deleted_at = NOW()
                   WHERE path = $1 AND deleted_at IS NULL"#,
                self.table
            );
            let result = sqlx::query(&sql)
                .bind(&path)
                .execute(&self.pool)
                .await
                .wrap_err("delete")?;
            if result.rows_affected() == 0 {
                return Err(StowryError::NotFound.context("delete"));
            }
            Ok(())
        })
    }

    fn list(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
        Box::pin(async move {
            self.list_with_condition(&query, "deleted_at IS NULL", "list")
                .await
        })
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
            .await
        })
    }

    fn mark_cleaned_up(&self, id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            // A malformed id cannot match any row.
            let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
                return Err(StowryError::NotFound.context("mark cleaned up"));
            };
            let sql = format!(
                r#"UPDATE "{}" SET cleaned_up_at = NOW()
                   WHERE id = $1 AND deleted_at IS NOT NULL AND cleaned_up_at IS NULL"#,
                self.table
            );
            let result = sqlx::query(&sql)
                .bind(uuid)
                .execute(&self.pool)
                .await
                .wrap_err("mark cleaned up")?;
            if result.rows_affected() == 0 {
                return Err(StowryError::NotFound.context("mark cleaned up"));
            }
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
//
// These run against a live server and are skipped unless
// `STOWRY_TEST_POSTGRES_DSN` is set.
