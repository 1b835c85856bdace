//! In-memory storage backend.
//!
//! Objects live in a `HashMap<String, Bytes>` behind an `RwLock`; nothing is
//! persisted.  A write buffers the whole body before swapping it in, so
//! readers see either the old or the new content.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::backend::{detect_content_type, FileStorage, ObjectReader, SaveResult};
use crate::errors::{Result, ResultExt, StowryError};
use crate::metadata::ObjectEntry;
use crate::path::is_valid_path;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if an object is stored at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.read().map(|o| o.contains_key(path)).unwrap_or(false)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Bytes>>> {
        self.objects
            .read()
            .map_err(|_| StowryError::Internal(anyhow::anyhow!("storage lock poisoned")))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Bytes>>> {
        self.objects
            .write()
            .map_err(|_| StowryError::Internal(anyhow::anyhow!("storage lock poisoned")))
    }
}

fn check_path(path: &str) -> Result<()> {
    if is_valid_path(path) {
        Ok(())
    } else {
        Err(StowryError::invalid(format!("invalid path: {path:?}")))
    }
}

impl FileStorage for MemoryStorage {
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<ObjectReader>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            check_path(&path)?;
            let data = self.read()?.get(&path).cloned().ok_or(StowryError::NotFound)?;
            Ok(Box::new(Cursor::new(data)) as ObjectReader)
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        content: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Result<SaveResult>> + Send + 'a>> {
        Box::pin(async move {
            check_path(path)?;
            let mut buf = Vec::new();
            content
                .read_to_end(&mut buf)
                .await
                .wrap_err("could not copy file contents")?;
            let result = SaveResult {
                bytes_written: buf.len() as i64,
                etag: hex::encode(Sha256::digest(&buf)),
            };
            self.write_lock()?.insert(path.to_string(), Bytes::from(buf));
            Ok(result)
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            check_path(&path)?;
            self.write_lock()?
                .remove(&path)
                .map(|_| ())
                .ok_or(StowryError::NotFound)
        })
    }

    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectEntry>>> + Send + '_>> {
        Box::pin(async move {
            let objects = self.read()?;
            let mut entries: Vec<ObjectEntry> = objects
                .iter()
                .map(|(path, data)| ObjectEntry {
                    path: path.clone(),
                    size: data.len() as i64,
                    etag: hex::encode(Sha256::digest(data)),
                    content_type: detect_content_type(path),
                })
                .collect();
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
    }
}
