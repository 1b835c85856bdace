//! Object service.
//!
//! [`StowryService`] coordinates the metadata repository and the physical
//! storage backend.  It owns the rules that span both:
//!
//! - a write lands in storage first and the metadata row is upserted after;
//!   if the upsert fails the written bytes are removed again (at most once,
//!   bounded by the configured cleanup timeout);
//! - deletes are soft: only the metadata row is marked, and
//!   [`StowryService::tombstone`] later purges the bytes;
//! - reads resolve paths according to the server mode (`store`, `static`,
//!   `spa`).
//!
//! Every operation takes a [`CancellationToken`] and refuses to start once
//! it has fired.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerMode;
use crate::errors::{Result, ResultExt, StowryError};
use crate::metadata::{ListQuery, ListResult, MetaData, MetaDataRepo, ObjectEntry};
use crate::metrics::{OBJECTS_PURGED_TOTAL, SERVICE_OPERATIONS_TOTAL};
use crate::path::is_valid_path;
use crate::storage::{FileStorage, ObjectReader};

/// Default bound on the compensating delete after a failed upsert.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size used by [`StowryService::tombstone`] when the query has none.
const TOMBSTONE_PAGE: usize = 100;

/// Service construction options.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub mode: ServerMode,
    /// Upper bound for the compensating delete.  Zero means the default.
    pub cleanup_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Store,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

impl ServiceConfig {
    /// Build from the config file values; non-positive seconds fall back to
    /// [`DEFAULT_CLEANUP_TIMEOUT`].
    pub fn new(mode: ServerMode, cleanup_timeout_secs: i64) -> Self {
        let cleanup_timeout = if cleanup_timeout_secs > 0 {
            Duration::from_secs(cleanup_timeout_secs as u64)
        } else {
            DEFAULT_CLEANUP_TIMEOUT
        };
        Self {
            mode,
            cleanup_timeout,
        }
    }
}

/// Input for [`StowryService::create`].
#[derive(Debug, Clone)]
pub struct CreateObject {
    pub path: String,
    pub content_type: String,
}

/// A tombstone run stopped early.  `purged` objects were fully cleaned up
/// before `source` occurred.
#[derive(Debug, Error)]
#[error("tombstone stopped after {purged} object(s): {source}")]
pub struct TombstoneError {
    pub purged: usize,
    #[source]
    pub source: StowryError,
}

pub struct StowryService {
    repo: Arc<dyn MetaDataRepo>,
    storage: Arc<dyn FileStorage>,
    mode: ServerMode,
    cleanup_timeout: Duration,
}

fn check_cancelled(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(StowryError::Cancelled)
    } else {
        Ok(())
    }
}

fn record<T>(operation: &'static str, res: &Result<T>) {
    let status = if res.is_ok() { "ok" } else { "error" };
    counter!(SERVICE_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

impl StowryService {
    pub fn new(
        repo: Arc<dyn MetaDataRepo>,
        storage: Arc<dyn FileStorage>,
        config: ServiceConfig,
    ) -> Self {
        let cleanup_timeout = if config.cleanup_timeout.is_zero() {
            DEFAULT_CLEANUP_TIMEOUT
        } else {
            config.cleanup_timeout
        };
        Self {
            repo,
            storage,
            mode: config.mode,
            cleanup_timeout,
        }
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    /// Reconcile metadata with what storage actually holds: every stored
    /// object gets an upserted row.  Returns the number of entries processed.
    pub async fn populate(&self, ctx: &CancellationToken) -> Result<usize> {
        let res = self.populate_inner(ctx).await;
        record("populate", &res);
        res
    }

    async fn populate_inner(&self, ctx: &CancellationToken) -> Result<usize> {
        check_cancelled(ctx).wrap_err("populate")?;
        let entries = self.storage.list().await.wrap_err("populate")?;

        let mut count = 0;
        for entry in entries {
            check_cancelled(ctx).wrap_err("populate")?;
            let path = entry.path.clone();
            let (_, inserted) = self
                .repo
                .upsert(entry)
                .await
                .wrap_err_with(|| format!("populate '{path}'"))?;
            debug!(path = %path, inserted, "populated");
            count += 1;
        }
        info!(count, "populate complete");
        Ok(count)
    }

    /// Store `content` at `req.path` and upsert its metadata.
    pub async fn create(
        &self,
        ctx: &CancellationToken,
        req: CreateObject,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<MetaData> {
        let res = self.create_inner(ctx, req, content).await;
        record("create", &res);
        res
    }

    async fn create_inner(
        &self,
        ctx: &CancellationToken,
        req: CreateObject,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<MetaData> {
        check_cancelled(ctx).wrap_err("create object")?;
        if req.path.is_empty() {
            return Err(StowryError::invalid("path cannot be empty").context("create object"));
        }
        if req.content_type.is_empty() {
            return Err(
                StowryError::invalid("content type cannot be empty").context("create object")
            );
        }
        let path = req.path;
        if !is_valid_path(&path) {
            return Err(StowryError::invalid(format!("invalid path: {path:?}"))
                .context(format!("create object {path}")));
        }

        let saved = tokio::select! {
            res = self.storage.write(&path, content) => {
                res.wrap_err_with(|| format!("create object {path}: write failed"))?
            }
            _ = ctx.cancelled() => {
                return Err(StowryError::Cancelled.context(format!("create object {path}")));
            }
        };

        let entry = ObjectEntry {
            path: path.clone(),
            size: saved.bytes_written,
            etag: saved.etag,
            content_type: req.content_type,
        };
        match self.repo.upsert(entry).await {
            Ok((meta, inserted)) => {
                debug!(path = %path, id = %meta.id, inserted, "object stored");
                Ok(meta)
            }
            Err(upsert_err) => match self.remove_orphan(&path).await {
                Ok(()) => Err(upsert_err.context(format!("create object {path}: metadata upsert failed"))),
                Err(cleanup_err) => {
                    warn!(path = %path, error = %cleanup_err, "orphaned object left in storage");
                    Err(StowryError::Compensation {
                        context: format!("create object {path}"),
                        metadata: Box::new(upsert_err),
                        cleanup: Box::new(cleanup_err),
                    })
                }
            },
        }
    }

    /// Undo a write whose metadata never landed.  Runs on its own task so the
    /// caller going away does not abort it.
    async fn remove_orphan(&self, path: &str) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let owned = path.to_string();
        let handle = tokio::spawn(async move { storage.delete(&owned).await });

        match tokio::time::timeout(self.cleanup_timeout, handle).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) if e.is_not_found() => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join)) => Err(StowryError::Internal(anyhow::anyhow!(
                "cleanup task failed: {join}"
            ))),
            Err(_) => Err(StowryError::Internal(anyhow::anyhow!(
                "cleanup timed out after {:?}",
                self.cleanup_timeout
            ))),
        }
    }

    /// Resolve `path` according to the server mode and open its content.
    pub async fn get(&self, ctx: &CancellationToken, path: &str) -> Result<(MetaData, ObjectReader)> {
        let res = self.get_inner(ctx, path).await;
        record("get", &res);
        res
    }

    async fn get_inner(&self, ctx: &CancellationToken, path: &str) -> Result<(MetaData, ObjectReader)> {
        let meta = self.resolve(ctx, "get object", path).await?;
        let reader = self
            .storage
            .get(&meta.path)
            .await
            .wrap_err_with(|| format!("get object {}", meta.path))?;
        Ok((meta, reader))
    }

    /// Same resolution as [`get`](Self::get) without opening the content.
    pub async fn info(&self, ctx: &CancellationToken, path: &str) -> Result<MetaData> {
        let res = self.resolve(ctx, "get object", path).await;
        record("info", &res);
        res
    }

    async fn resolve(&self, ctx: &CancellationToken, op: &str, path: &str) -> Result<MetaData> {
        check_cancelled(ctx).wrap_err(op)?;
        if !path.is_empty() && !is_valid_path(path) {
            return Err(StowryError::invalid(format!("invalid path: {path:?}")).context(op));
        }

        let lookup = match (path.is_empty(), self.mode) {
            (true, ServerMode::Store) => return Err(StowryError::NotFound.context(op)),
            (true, _) => "index.html",
            (false, _) => path,
        };

        let err = match self.repo.get(lookup).await {
            Ok(meta) => return Ok(meta),
            Err(e) => e,
        };
        if !err.is_not_found() {
            return Err(err.context(format!("{op} {lookup}")));
        }

        let fallback = match self.mode {
            ServerMode::Store => None,
            ServerMode::Static if path.is_empty() => None,
            ServerMode::Static => Some(format!("{path}/index.html")),
            ServerMode::Spa if lookup == "index.html" => None,
            ServerMode::Spa => Some("index.html".to_string()),
        };
        match fallback {
            Some(fallback) => {
                debug!(path = %path, fallback = %fallback, mode = %self.mode, "falling back");
                self.repo
                    .get(&fallback)
                    .await
                    .wrap_err_with(|| format!("{op} {fallback}"))
            }
            None => Err(err.context(format!("{op} {lookup}"))),
        }
    }

    /// Soft-delete the metadata for `path`.  Bytes stay until
    /// [`tombstone`](Self::tombstone) runs.
    pub async fn delete(&self, ctx: &CancellationToken, path: &str) -> Result<()> {
        let res = self.delete_inner(ctx, path).await;
        record("delete", &res);
        res
    }

    async fn delete_inner(&self, ctx: &CancellationToken, path: &str) -> Result<()> {
        check_cancelled(ctx).wrap_err("delete object")?;
        if path.is_empty() {
            return Err(StowryError::invalid("path cannot be empty").context("delete object"));
        }
        if !is_valid_path(path) {
            return Err(StowryError::invalid(format!("invalid path: {path:?}"))
                .context(format!("delete object {path}")));
        }
        self.repo
            .delete(path)
            .await
            .wrap_err_with(|| format!("delete object {path}"))
    }

    pub async fn list(&self, ctx: &CancellationToken, query: ListQuery) -> Result<ListResult> {
        let res = self.list_inner(ctx, query).await;
        record("list", &res);
        res
    }

    async fn list_inner(&self, ctx: &CancellationToken, query: ListQuery) -> Result<ListResult> {
        check_cancelled(ctx).wrap_err("list object")?;
        self.repo.list(query).await.wrap_err("list object")
    }

    /// Purge the bytes of soft-deleted objects and mark their rows cleaned
    /// up.  Pages through pending rows until none are left; a missing file
    /// counts as purged.
    pub async fn tombstone(
        &self,
        ctx: &CancellationToken,
        query: ListQuery,
    ) -> std::result::Result<usize, TombstoneError> {
        let res = self.tombstone_inner(ctx, query).await;
        let status = if res.is_ok() { "ok" } else { "error" };
        counter!(SERVICE_OPERATIONS_TOTAL, "operation" => "tombstone", "status" => status)
            .increment(1);
        res
    }

    async fn tombstone_inner(
        &self,
        ctx: &CancellationToken,
        query: ListQuery,
    ) -> std::result::Result<usize, TombstoneError> {
        let stop = |purged: usize, source: StowryError| TombstoneError { purged, source };

        let limit = if query.limit == 0 {
            TOMBSTONE_PAGE
        } else {
            query.limit
        };
        let mut cursor = query.cursor;
        let mut purged = 0usize;

        loop {
            check_cancelled(ctx)
                .wrap_err("tombstone")
                .map_err(|e| stop(purged, e))?;

            let page = self
                .repo
                .list_pending_cleanup(ListQuery::new(query.path_prefix.clone(), limit, cursor))
                .await
                .wrap_err("tombstone")
                .map_err(|e| stop(purged, e))?;
            if page.items.is_empty() {
                break;
            }

            for item in &page.items {
                match self.storage.delete(&item.path).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(path = %item.path, "bytes already gone");
                    }
                    Err(e) => return Err(stop(purged, e.context(format!("tombstone '{}'", item.path)))),
                }
                self.repo
                    .mark_cleaned_up(&item.id)
                    .await
                    .wrap_err_with(|| format!("tombstone '{}'", item.path))
                    .map_err(|e| stop(purged, e))?;
                counter!(OBJECTS_PURGED_TOTAL).increment(1);
                purged += 1;
            }

            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }

        info!(purged, "tombstone complete");
        Ok(purged)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::metadata::memory::MemoryMetaDataRepo;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::SaveResult;

    /// Memory repo whose upsert can be made to fail.  A token placed in
    /// `cancel_on_upsert` is cancelled just before the failure is returned.
    #[derive(Default)]
    struct FlakyRepo {
        inner: MemoryMetaDataRepo,
        fail_upsert: AtomicBool,
        cancel_on_upsert: Mutex<Option<CancellationToken>>,
    }

    impl MetaDataRepo for FlakyRepo {
        fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<MetaData>> + Send + '_>> {
            self.inner.get(path)
        }

        fn upsert(
            &self,
            entry: ObjectEntry,
        ) -> Pin<Box<dyn Future<Output = Result<(MetaData, bool)>> + Send + '_>> {
            if self.fail_upsert.load(Ordering::SeqCst) {
                if let Some(token) = self.cancel_on_upsert.lock().unwrap().take() {
                    token.cancel();
                }
                return Box::pin(async {
                    Err(StowryError::Internal(anyhow::anyhow!("database is down")))
                });
            }
            self.inner.upsert(entry)
        }

        fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.inner.delete(path)
        }

        fn list(
            &self,
            query: ListQuery,
        ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
            self.inner.list(query)
        }

        fn list_pending_cleanup(
            &self,
            query: ListQuery,
        ) -> Pin<Box<dyn Future<Output = Result<ListResult>> + Send + '_>> {
            self.inner.list_pending_cleanup(query)
        }

        fn mark_cleaned_up(&self, id: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.inner.mark_cleaned_up(id)
        }
    }

    /// Memory storage whose delete can be made to fail or never finish.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_delete: AtomicBool,
        hang_delete: AtomicBool,
        deletes: AtomicUsize,
    }

    impl FileStorage for FlakyStorage {
        fn get(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<ObjectReader>> + Send + '_>> {
            self.inner.get(path)
        }

        fn write<'a>(
            &'a self,
            path: &'a str,
            content: &'a mut (dyn AsyncRead + Send + Unpin),
        ) -> Pin<Box<dyn Future<Output = Result<SaveResult>> + Send + 'a>> {
            self.inner.write(path, content)
        }

        fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.hang_delete.load(Ordering::SeqCst) {
                return Box::pin(std::future::pending::<Result<()>>());
            }
            if self.fail_delete.load(Ordering::SeqCst) {
                return Box::pin(async {
                    Err(StowryError::Io(std::io::Error::from(
                        std::io::ErrorKind::PermissionDenied,
                    )))
                });
            }
            self.inner.delete(path)
        }

        fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<ObjectEntry>>> + Send + '_>> {
            self.inner.list()
        }
    }

    fn setup(mode: ServerMode) -> (StowryService, Arc<FlakyRepo>, Arc<FlakyStorage>) {
        setup_with_timeout(mode, Duration::from_secs(5))
    }

    fn setup_with_timeout(
        mode: ServerMode,
        cleanup_timeout: Duration,
    ) -> (StowryService, Arc<FlakyRepo>, Arc<FlakyStorage>) {
        let repo = Arc::new(FlakyRepo::default());
        let storage = Arc::new(FlakyStorage::default());
        let svc = StowryService::new(
            repo.clone(),
            storage.clone(),
            ServiceConfig {
                mode,
                cleanup_timeout,
            },
        );
        (svc, repo, storage)
    }

    async fn put(svc: &StowryService, path: &str, body: &[u8]) -> MetaData {
        let mut body = body;
        svc.create(
            &CancellationToken::new(),
            CreateObject {
                path: path.into(),
                content_type: "text/plain".into(),
            },
            &mut body,
        )
        .await
        .unwrap()
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_service_config_defaults_timeout() {
        assert_eq!(
            ServiceConfig::new(ServerMode::Store, 0).cleanup_timeout,
            DEFAULT_CLEANUP_TIMEOUT
        );
        assert_eq!(
            ServiceConfig::new(ServerMode::Store, -3).cleanup_timeout,
            DEFAULT_CLEANUP_TIMEOUT
        );
        assert_eq!(
            ServiceConfig::new(ServerMode::Spa, 7).cleanup_timeout,
            Duration::from_secs(7)
        );
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (svc, _, _) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();

        let meta = put(&svc, "docs/a.txt", b"hello").await;
        assert_eq!(meta.file_size_bytes, 5);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.etag.len(), 64);

        let (got, reader) = svc.get(&ctx, "docs/a.txt").await.ok().unwrap();
        assert_eq!(got.id, meta.id);
        assert_eq!(read_all(reader).await, b"hello");

        let info = svc.info(&ctx, "docs/a.txt").await.unwrap();
        assert_eq!(info.etag, meta.etag);
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();

        for (path, ct) in [("", "text/plain"), ("a.txt", ""), ("../x", "text/plain")] {
            let mut body: &[u8] = b"x";
            let err = svc
                .create(
                    &ctx,
                    CreateObject {
                        path: path.into(),
                        content_type: ct.into(),
                    },
                    &mut body,
                )
                .await
                .unwrap_err();
            assert!(err.is(ErrorKind::InvalidInput), "{path:?}/{ct:?}: {err}");
        }
        assert!(storage.inner.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_overwrite_keeps_id() {
        let (svc, _, _) = setup(ServerMode::Store);
        let first = put(&svc, "a.txt", b"one").await;
        let second = put(&svc, "a.txt", b"second").await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.file_size_bytes, 6);
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn test_create_compensates_failed_upsert() {
        let (svc, repo, storage) = setup(ServerMode::Store);
        repo.fail_upsert.store(true, Ordering::SeqCst);

        let mut body: &[u8] = b"orphan";
        let err = svc
            .create(
                &CancellationToken::new(),
                CreateObject {
                    path: "a.txt".into(),
                    content_type: "text/plain".into(),
                },
                &mut body,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("metadata upsert failed"), "{err}");
        assert!(!matches!(err, StowryError::Compensation { .. }));
        assert!(!storage.inner.contains("a.txt"));
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_reports_both_errors_when_cleanup_fails() {
        let (svc, repo, storage) = setup(ServerMode::Store);
        repo.fail_upsert.store(true, Ordering::SeqCst);
        storage.fail_delete.store(true, Ordering::SeqCst);

        let mut body: &[u8] = b"orphan";
        let err = svc
            .create(
                &CancellationToken::new(),
                CreateObject {
                    path: "a.txt".into(),
                    content_type: "text/plain".into(),
                },
                &mut body,
            )
            .await
            .unwrap_err();

        match &err {
            StowryError::Compensation {
                metadata, cleanup, ..
            } => {
                assert!(metadata.to_string().contains("database is down"));
                assert!(matches!(**cleanup, StowryError::Io(_)));
            }
            other => panic!("expected compensation error, got {other}"),
        }
        // Attempted exactly once.
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
        assert!(storage.inner.contains("a.txt"));
    }

    #[tokio::test]
    async fn test_create_cleanup_is_time_bounded() {
        let (svc, repo, storage) = setup_with_timeout(ServerMode::Store, Duration::from_millis(50));
        repo.fail_upsert.store(true, Ordering::SeqCst);
        storage.hang_delete.store(true, Ordering::SeqCst);

        let mut body: &[u8] = b"orphan";
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            svc.create(
                &CancellationToken::new(),
                CreateObject {
                    path: "a.txt".into(),
                    content_type: "text/plain".into(),
                },
                &mut body,
            ),
        )
        .await
        .expect("create returned before the outer deadline")
        .unwrap_err();

        match &err {
            StowryError::Compensation { cleanup, .. } => {
                assert!(cleanup.to_string().contains("timed out"), "{cleanup}");
            }
            other => panic!("expected compensation error, got {other}"),
        }
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_cleanup_survives_caller_cancellation() {
        let (svc, repo, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        repo.fail_upsert.store(true, Ordering::SeqCst);
        *repo.cancel_on_upsert.lock().unwrap() = Some(ctx.clone());

        let mut body: &[u8] = b"orphan";
        let err = svc
            .create(
                &ctx,
                CreateObject {
                    path: "a.txt".into(),
                    content_type: "text/plain".into(),
                },
                &mut body,
            )
            .await
            .unwrap_err();

        assert!(ctx.is_cancelled());
        assert!(err.to_string().contains("metadata upsert failed"), "{err}");
        assert_eq!(storage.deletes.load(Ordering::SeqCst), 1);
        assert!(!storage.inner.contains("a.txt"));
    }

    #[tokio::test]
    async fn test_restore_cycle_keeps_id() {
        let (svc, _, _) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();

        let original = put(&svc, "a.txt", b"v1").await;
        svc.delete(&ctx, "a.txt").await.unwrap();
        assert!(svc.get(&ctx, "a.txt").await.err().unwrap().is_not_found());

        let restored = put(&svc, "a.txt", b"v2").await;
        assert_eq!(restored.id, original.id);
        assert!(restored.deleted_at.is_none());
        let (_, reader) = svc.get(&ctx, "a.txt").await.ok().unwrap();
        assert_eq!(read_all(reader).await, b"v2");
    }

    #[tokio::test]
    async fn test_delete_missing_and_empty() {
        let (svc, _, _) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        assert!(svc.delete(&ctx, "nope.txt").await.unwrap_err().is_not_found());
        assert!(svc
            .delete(&ctx, "")
            .await
            .unwrap_err()
            .is(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_store_mode_has_no_fallback() {
        let (svc, _, _) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        put(&svc, "index.html", b"<html>").await;

        assert!(svc.get(&ctx, "").await.err().unwrap().is_not_found());
        assert!(svc.get(&ctx, "missing").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_static_mode_fallback() {
        let (svc, _, _) = setup(ServerMode::Static);
        let ctx = CancellationToken::new();
        put(&svc, "index.html", b"root").await;
        put(&svc, "docs/index.html", b"docs").await;

        let (m, _) = svc.get(&ctx, "").await.ok().unwrap();
        assert_eq!(m.path, "index.html");
        let (m, reader) = svc.get(&ctx, "docs").await.ok().unwrap();
        assert_eq!(m.path, "docs/index.html");
        assert_eq!(read_all(reader).await, b"docs");
        assert!(svc.get(&ctx, "other").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_spa_mode_fallback() {
        let (svc, _, _) = setup(ServerMode::Spa);
        let ctx = CancellationToken::new();
        put(&svc, "index.html", b"app").await;
        put(&svc, "app.js", b"js").await;

        let (m, _) = svc.get(&ctx, "any/unknown/route").await.ok().unwrap();
        assert_eq!(m.path, "index.html");
        let (m, _) = svc.get(&ctx, "app.js").await.ok().unwrap();
        assert_eq!(m.path, "app.js");
        assert_eq!(svc.info(&ctx, "").await.unwrap().path, "index.html");
    }

    #[tokio::test]
    async fn test_spa_mode_without_index() {
        let (svc, _, _) = setup(ServerMode::Spa);
        let ctx = CancellationToken::new();
        assert!(svc.get(&ctx, "route").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let (svc, _, _) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        for name in ["a", "b", "c", "d", "e"] {
            put(&svc, &format!("p/{name}.txt"), b"x").await;
        }
        put(&svc, "q/other.txt", b"x").await;

        let mut seen = Vec::new();
        let mut cursor = String::new();
        loop {
            let page = svc
                .list(&ctx, ListQuery::new("p/", 2, cursor.clone()))
                .await
                .unwrap();
            assert!(page.items.len() <= 2);
            seen.extend(page.items.into_iter().map(|m| m.path));
            if page.next_cursor.is_empty() {
                break;
            }
            cursor = page.next_cursor;
        }
        assert_eq!(seen, ["p/a.txt", "p/b.txt", "p/c.txt", "p/d.txt", "p/e.txt"]);
    }

    #[tokio::test]
    async fn test_list_bad_cursor() {
        let (svc, _, _) = setup(ServerMode::Store);
        let err = svc
            .list(&CancellationToken::new(), ListQuery::new("", 10, "!!!"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_populate_from_storage() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        let mut body: &[u8] = b"<p>hi</p>";
        storage.inner.write("site/page.html", &mut body).await.unwrap();
        let mut body: &[u8] = b"raw";
        storage.inner.write("blob", &mut body).await.unwrap();

        assert_eq!(svc.populate(&ctx).await.unwrap(), 2);
        let m = svc.info(&ctx, "site/page.html").await.unwrap();
        assert_eq!(m.content_type, "text/html");
        assert_eq!(m.file_size_bytes, 9);

        // Idempotent.
        assert_eq!(svc.populate(&ctx).await.unwrap(), 2);
        assert_eq!(svc.info(&ctx, "site/page.html").await.unwrap().id, m.id);
    }

    #[tokio::test]
    async fn test_populate_upsert_failure_names_path() {
        let (svc, repo, storage) = setup(ServerMode::Store);
        let mut body: &[u8] = b"x";
        storage.inner.write("a.txt", &mut body).await.unwrap();
        repo.fail_upsert.store(true, Ordering::SeqCst);

        let err = svc.populate(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("populate 'a.txt'"), "{err}");
    }

    #[tokio::test]
    async fn test_tombstone_purges_deleted() {
        let (svc, repo, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        put(&svc, "keep.txt", b"k").await;
        put(&svc, "gone.txt", b"g").await;
        svc.delete(&ctx, "gone.txt").await.unwrap();

        let purged = svc.tombstone(&ctx, ListQuery::new("", 10, "")).await.unwrap();
        assert_eq!(purged, 1);
        assert!(!storage.inner.contains("gone.txt"));
        assert!(storage.inner.contains("keep.txt"));

        let pending = repo
            .list_pending_cleanup(ListQuery::new("", 10, ""))
            .await
            .unwrap();
        assert!(pending.items.is_empty());
        assert_eq!(svc.tombstone(&ctx, ListQuery::new("", 10, "")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tombstone_tolerates_missing_bytes() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        put(&svc, "a.txt", b"a").await;
        svc.delete(&ctx, "a.txt").await.unwrap();
        storage.inner.delete("a.txt").await.unwrap();

        assert_eq!(svc.tombstone(&ctx, ListQuery::new("", 10, "")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_pages_through_everything() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        for i in 0..5 {
            let path = format!("t/{i}.bin");
            put(&svc, &path, b"x").await;
            svc.delete(&ctx, &path).await.unwrap();
        }

        assert_eq!(svc.tombstone(&ctx, ListQuery::new("t/", 2, "")).await.unwrap(), 5);
        assert!(storage.inner.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_stops_on_storage_error() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        put(&svc, "a.txt", b"a").await;
        svc.delete(&ctx, "a.txt").await.unwrap();
        storage.fail_delete.store(true, Ordering::SeqCst);

        let err = svc
            .tombstone(&ctx, ListQuery::new("", 10, ""))
            .await
            .unwrap_err();
        assert_eq!(err.purged, 0);
        assert!(err.source.to_string().contains("tombstone 'a.txt'"));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let (svc, _, storage) = setup(ServerMode::Store);
        let ctx = CancellationToken::new();
        ctx.cancel();

        let mut body: &[u8] = b"x";
        let err = svc
            .create(
                &ctx,
                CreateObject {
                    path: "a.txt".into(),
                    content_type: "text/plain".into(),
                },
                &mut body,
            )
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
        assert!(!storage.inner.contains("a.txt"));

        assert!(svc.get(&ctx, "a.txt").await.err().unwrap().is(ErrorKind::Cancelled));
        assert!(svc.delete(&ctx, "a.txt").await.unwrap_err().is(ErrorKind::Cancelled));
        assert!(svc
            .list(&ctx, ListQuery::new("", 10, ""))
            .await
            .unwrap_err()
            .is(ErrorKind::Cancelled));
        assert!(svc.populate(&ctx).await.unwrap_err().is(ErrorKind::Cancelled));
        let err = svc
            .tombstone(&ctx, ListQuery::new("", 10, ""))
            .await
            .unwrap_err();
        assert_eq!(err.purged, 0);
        assert!(err.source.is(ErrorKind::Cancelled));
    }
}
