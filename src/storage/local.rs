//! Local filesystem storage backend.
//!
//! Objects are stored as plain files under a configurable root directory;
//! the object path is used directly as the relative file path.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.
//! Temp files live in the reserved `.stowry-tmp/` directory under the root
//! and are removed on any failure, including the write future being dropped.
//! Whatever a crash leaves there is cleared when the storage is opened.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::backend::{detect_content_type, io_error, FileStorage, ObjectReader, SaveResult};
use crate::errors::{Result, ResultExt, StowryError};
use crate::metadata::ObjectEntry;
use crate::path::is_valid_path;

/// Reserved top-level directory for in-flight writes.
const TEMP_DIR: &str = ".stowry-tmp";
/// Temp files untouched for this long are treated as crash leftovers.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Stores objects on the local filesystem.
pub struct FilesystemStorage {
    /// Root directory for all stored objects.
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create a new `FilesystemStorage` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.  Temp files
    /// older than [`STALE_TEMP_AGE`] are left over from a crash and removed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let tmp = root.join(TEMP_DIR);
        std::fs::create_dir_all(&tmp)
            .wrap_err_with(|| format!("create storage root {}", root.display()))?;
        let store = Self { root };
        store
            .reclaim_temp_files(STALE_TEMP_AGE)
            .wrap_err_with(|| format!("clear temp dir {}", tmp.display()))?;
        Ok(store)
    }

    /// Remove temp files not modified within `max_age`.  Younger ones may
    /// belong to a write in progress in another process.
    fn reclaim_temp_files(&self, max_age: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(self.root.join(TEMP_DIR))? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            let age = SystemTime::now().duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            tracing::info!(root = %self.root.display(), removed, "removed stale temp files");
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path to a file path under the root.
    ///
    /// Paths that fail validation are rejected before touching the disk, so
    /// no key can escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if !is_valid_path(path) || is_reserved(path) {
            return Err(StowryError::invalid(format!("invalid path: {path:?}")));
        }
        Ok(self.root.join(path))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TEMP_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }
}

/// `true` for object paths inside the temp directory.
fn is_reserved(path: &str) -> bool {
    path.split('/').next() == Some(TEMP_DIR)
}

/// Removes the temp file on drop unless the write completed.
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl FileStorage for FilesystemStorage {
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<ObjectReader>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let file_path = self.resolve(&path)?;
            let meta = tokio::fs::metadata(&file_path).await.map_err(io_error)?;
            if !meta.is_file() {
                return Err(StowryError::NotFound);
            }
            let file = tokio::fs::File::open(&file_path).await.map_err(io_error)?;
            Ok(Box::new(file) as ObjectReader)
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        content: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Result<SaveResult>> + Send + 'a>> {
        Box::pin(async move {
            let final_path = self.resolve(path)?;
            let tmp_path = self.temp_path();
            if let Some(parent) = tmp_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .wrap_err("could not create temp dir")?;
            }
            let guard = TempFile::new(tmp_path.clone());

            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .wrap_err("could not open temp file")?;

            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            let mut written: i64 = 0;
            loop {
                let n = content
                    .read(&mut buf)
                    .await
                    .wrap_err("could not copy file contents")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n])
                    .await
                    .wrap_err("could not copy file contents")?;
                written += n as i64;
            }

            file.flush().await.wrap_err("could not sync written file")?;
            file.sync_all().await.wrap_err("could not sync written file")?;
            drop(file);

            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .wrap_err("could not create intermediate directories")?;
            }

            tokio::fs::rename(&tmp_path, &final_path)
                .await
                .wrap_err("failed to rename file")?;
            guard.persist();

            Ok(SaveResult {
                bytes_written: written,
                etag: hex::encode(hasher.finalize()),
            })
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let file_path = self.resolve(&path)?;
            tokio::fs::remove_file(&file_path).await.map_err(io_error)?;
            Ok(())
        })
    }

    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectEntry>>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut dirs = vec![self.root.clone()];

            while let Some(dir) = dirs.pop() {
                let mut rd = tokio::fs::read_dir(&dir)
                    .await
                    .wrap_err_with(|| format!("failed to list files: {}", dir.display()))?;
                while let Some(entry) = rd.next_entry().await.wrap_err("failed to list files")? {
                    let file_type = entry.file_type().await.wrap_err("walk dir")?;
                    let full = entry.path();
                    if file_type.is_dir() {
                        if dir != self.root || entry.file_name() != TEMP_DIR {
                            dirs.push(full);
                        }
                        continue;
                    }
                    if !file_type.is_file() {
                        continue;
                    }

                    let rel = match full.strip_prefix(&self.root).ok().and_then(Path::to_str) {
                        Some(rel) => rel.replace(std::path::MAIN_SEPARATOR, "/"),
                        None => {
                            tracing::warn!(path = %full.display(), "skipping file with non UTF-8 name");
                            continue;
                        }
                    };
                    if !is_valid_path(&rel) {
                        tracing::warn!(path = %rel, "skipping file with invalid object path");
                        continue;
                    }

                    let size = entry.metadata().await.wrap_err("walk dir")?.len() as i64;
                    let etag = hash_file(&full).await.wrap_err("walk dir")?;
                    entries.push(ObjectEntry {
                        content_type: detect_content_type(&rel),
                        path: rel,
                        size,
                        etag,
                    });
                }
            }

            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
