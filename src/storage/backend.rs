//! Abstract file storage trait.
//!
//! Every storage backend must implement [`FileStorage`].  Reads hand back a
//! seekable async stream so the HTTP layer can serve ranges; writes consume
//! an async reader and report the byte count and SHA-256 of what landed.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncSeek};

use crate::errors::{Result, StowryError};
use crate::metadata::ObjectEntry;

/// A readable, seekable object body.
pub trait ObjectStream: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ObjectStream for T {}

/// Boxed object body returned by [`FileStorage::get`].
pub type ObjectReader = Box<dyn ObjectStream>;

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    pub bytes_written: i64,
    /// Hex-encoded SHA-256 of the content.
    pub etag: String,
}

/// Async physical storage contract.
pub trait FileStorage: Send + Sync + 'static {
    /// Open the object at `path`, or `NotFound`.
    fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<ObjectReader>> + Send + '_>>;

    /// Store everything `content` yields at `path`.
    ///
    /// Readers never observe a partially written object: either the previous
    /// content or the complete new content is visible at `path`.
    fn write<'a>(
        &'a self,
        path: &'a str,
        content: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> Pin<Box<dyn Future<Output = Result<SaveResult>> + Send + 'a>>;

    /// Remove the object at `path`, or `NotFound`.
    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Full inventory of stored objects, for reconciliation.
    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectEntry>>> + Send + '_>>;
}

/// Map an I/O error, turning `ENOENT` into [`StowryError::NotFound`].
pub(crate) fn io_error(err: std::io::Error) -> StowryError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StowryError::NotFound
    } else {
        StowryError::Io(err)
    }
}

/// Content type guessed from the file extension.
pub(crate) fn detect_content_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type("index.html"), "text/html");
        assert_eq!(detect_content_type("img/logo.png"), "image/png");
        assert_eq!(detect_content_type("blob"), "application/octet-stream");
        assert_eq!(detect_content_type("data.unknownext"), "application/octet-stream");
    }

    #[test]
    fn test_io_error_mapping() {
        let nf = io_error(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(nf.is_not_found());
        let other = io_error(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!other.is_not_found());
    }
}
