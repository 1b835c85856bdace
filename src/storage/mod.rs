//! Physical object storage backends.
//!
//! The [`backend::FileStorage`] trait abstracts over where bytes physically
//! live.  Implementations are the local filesystem and an in-memory map.

pub mod backend;
pub mod local;
pub mod memory;

use std::sync::Arc;

use crate::config::{StorageConfig, StorageType};
use crate::errors::Result;

pub use backend::{FileStorage, ObjectReader, SaveResult};

/// Build the configured storage backend.
pub fn open(cfg: &StorageConfig) -> Result<Arc<dyn FileStorage>> {
    match cfg.storage_type {
        StorageType::Filesystem => {
            let store = local::FilesystemStorage::new(&cfg.path)?;
            tracing::info!(root = %cfg.path, "filesystem storage ready");
            Ok(Arc::new(store))
        }
        StorageType::Memory => {
            tracing::warn!("using in-memory storage; objects are lost on exit");
            Ok(Arc::new(memory::MemoryStorage::new()))
        }
    }
}
