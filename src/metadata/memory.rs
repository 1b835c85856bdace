//! In-memory metadata repository.
//!
//! Stores all metadata in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};

use super::store::{ListQuery, ListResult, MetaData, MetaDataRepo, ObjectEntry};
use crate::cursor::decode_cursor;
use crate::errors::{Result, ResultExt, StowryError};

#[derive(Debug, Default)]
struct Inner {
    /// Rows keyed by path.
    rows: HashMap<String, MetaData>,
    /// Last timestamp handed out; keeps `created_at` strictly increasing.
    last_ts: Option<DateTime<Utc>>,
}

impl Inner {
    fn tick(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_ts {
            if now <= last {
                now = last + Duration::nanoseconds(1);
            }
        }
        self.last_ts = Some(now);
        now
    }
}

#[derive(Debug, Default)]
pub struct MemoryMetaDataRepo {
    inner: RwLock<Inner>,
}

impl MemoryMetaDataRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StowryError::Internal(anyhow::anyhow!("metadata lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StowryError::Internal(anyhow::anyhow!("metadata lock poisoned")))
    }

    fn list_filtered<F>(&self, query: &ListQuery, keep: F, op: &str) -> Result<ListResult>
    where
        F: Fn(&MetaData) -> bool,
    {
        let cursor = decode_cursor(&query.cursor).wrap_err(op)?;
        let limit = query.effective_limit();
        let inner = self.read()?;

        let mut rows: Vec<MetaData> = inner
            .rows
            .values()
            .filter(|m| keep(m) && m.path.starts_with(&query.path_prefix))
            .filter(|m| {
                cursor.is_zero()
                    || (m.created_at, m.path.as_str()) > (cursor.created_at, cursor.path.as_str())
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.path).cmp(&(b.created_at, &b.path)));
        rows.truncate(limit + 1);

        Ok(ListResult::from_rows(rows, limit))
    }
}

impl MetaDataRepo for MemoryMetaDataRepo {
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<MetaData>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let inner = self.read()?;
            inner
                .rows
                .get(&path)
                .filter(|m| m.deleted_at.is_none())
                .cloned()
                .ok_or_else(|| StowryError::NotFound.context("get"))
        })
    }

    fn upsert(
        &self,
        entry: ObjectEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(MetaData, bool)>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.write()?;
            let now = inner.tick();
            let mut inserted = false;
            let row = inner.rows.entry(entry.path.clone()).or_insert_with(|| {
                inserted = true;
                MetaData {
                    id: uuid::Uuid::new_v4().to_string(),
                    path: entry.path.clone(),
                    content_type: String::new(),
                    etag: String::new(),
                    file_size_bytes: 0,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                    cleaned_up_at: None,
                }
            });
            row.content_type = entry.content_type;
            row.etag = entry.etag;
            row.file_size_bytes = entry.size;
            row.updated_at = now;
            row.deleted_at = None;
            row.cleaned_up_at = None;
            Ok((row.clone(), inserted))
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let now = inner.tick();
            match inner.rows.get_mut(&path) {
                Some(row) if row.deleted_at.is_none() => {
                    row.deleted_at = Some(now);
                    Ok(())
                }
                _ => Err(StowryError::NotFound.context("delete")),
            }
        })
    }

    fn list(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
        Box::pin(async move { self.list_filtered(&query, |m| m.deleted_at.is_none(), "list") })
    }

    fn list_pending_cleanup(
        &self,
        query: ListQuery,
    ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
        Box::pin(async move {
            self.list_filtered(
                &query,
                |m| m.deleted_at.is_some() && m.cleaned_up_at.is_none(),
                "list pending cleanup",
            )
        })
    }

    fn mark_cleaned_up(&self, id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let now = inner.tick();
            let row = inner
                .rows
                .values_mut()
                .find(|m| m.id == id && m.deleted_at.is_some() && m.cleaned_up_at.is_none());
            match row {
                Some(row) => {
                    row.cleaned_up_at = Some(now);
                    Ok(())
                }
                None => Err(StowryError::NotFound.context("mark cleaned up")),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
