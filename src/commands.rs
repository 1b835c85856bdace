//! File import and bulk removal used by the `stowry add` and
//! `stowry remove` subcommands.
//!
//! Both go through [`StowryService`] so imported files get the same
//! write-then-upsert treatment as HTTP uploads, and removals are soft deletes
//! that `stowry cleanup` purges later.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metadata::ListQuery;
use crate::service::{CreateObject, StowryService};
use crate::storage::backend::detect_content_type;

const REMOVE_PAGE: usize = 100;

/// A local file and the storage path it will be written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub source: PathBuf,
    pub dest: String,
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Storage path prefix for every imported file.
    pub dest: String,
    /// Descend into directories.
    pub recursive: bool,
    /// Skip destinations that already exist instead of overwriting.
    pub no_clobber: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddSummary {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    pub removed: usize,
    pub not_found: usize,
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Expand `path` into the files to import.
///
/// A file maps to `prefix + file name`.  A directory requires `recursive`
/// and maps each file below it to `prefix + relative path`.
pub fn collect_files(path: &Path, recursive: bool, dest_prefix: &str) -> anyhow::Result<Vec<FileEntry>> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let prefix = normalize_prefix(dest_prefix);

    if !meta.is_dir() {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        return Ok(vec![FileEntry {
            source: path.to_path_buf(),
            dest: format!("{prefix}{name}"),
        }]);
    }

    if !recursive {
        bail!("{} is a directory (use -r to add recursively)", path.display());
    }

    let mut entries = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let entry = entry?;
            let p = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(p);
                continue;
            }
            let rel = p.strip_prefix(path).with_context(|| format!("relative path of {}", p.display()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_str())
                .collect::<Option<Vec<_>>>()
                .with_context(|| format!("{} is not valid UTF-8", p.display()))?
                .join("/");
            entries.push(FileEntry {
                source: p,
                dest: format!("{prefix}{rel}"),
            });
        }
    }
    entries.sort_by(|a, b| a.dest.cmp(&b.dest));
    Ok(entries)
}

/// Import local files through the service.  Stops at the first failure.
pub async fn add_files(
    svc: &StowryService,
    ctx: &CancellationToken,
    sources: &[PathBuf],
    opts: &AddOptions,
) -> anyhow::Result<AddSummary> {
    let mut files = Vec::new();
    for source in sources {
        files.extend(
            collect_files(source, opts.recursive, &opts.dest)
                .with_context(|| format!("collect files from {}", source.display()))?,
        );
    }

    let mut summary = AddSummary::default();
    if files.is_empty() {
        info!("no files to add");
        return Ok(summary);
    }

    for entry in files {
        if opts.no_clobber {
            match svc.info(ctx, &entry.dest).await {
                Ok(_) => {
                    info!(path = %entry.dest, "skipped (exists)");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).with_context(|| format!("check {}", entry.dest)),
            }
        }

        let mut file = tokio::fs::File::open(&entry.source)
            .await
            .with_context(|| format!("open {}", entry.source.display()))?;
        let content_type = detect_content_type(&entry.dest);
        svc.create(
            ctx,
            CreateObject {
                path: entry.dest.clone(),
                content_type: content_type.clone(),
            },
            &mut file,
        )
        .await
        .with_context(|| format!("add {}", entry.dest))?;

        info!(path = %entry.dest, content_type = %content_type, "added");
        summary.added += 1;
    }

    info!(added = summary.added, skipped = summary.skipped, "add complete");
    Ok(summary)
}

/// Soft-delete `paths`.  With `by_prefix`, each argument is a prefix and
/// every active object under it is removed.  Missing paths are counted, not
/// treated as errors.
pub async fn remove_paths(
    svc: &StowryService,
    ctx: &CancellationToken,
    paths: &[String],
    by_prefix: bool,
) -> anyhow::Result<RemoveSummary> {
    let mut summary = RemoveSummary::default();

    for path in paths {
        if by_prefix {
            remove_prefix(svc, ctx, path, &mut summary).await?;
        } else {
            remove_one(svc, ctx, path, &mut summary).await?;
        }
    }

    info!(removed = summary.removed, not_found = summary.not_found, "remove complete");
    Ok(summary)
}

async fn remove_one(
    svc: &StowryService,
    ctx: &CancellationToken,
    path: &str,
    summary: &mut RemoveSummary,
) -> anyhow::Result<()> {
    match svc.delete(ctx, path).await {
        Ok(()) => {
            info!(path = %path, "removed");
            summary.removed += 1;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            warn!(path = %path, "not found");
            summary.not_found += 1;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("remove {path}")),
    }
}

async fn remove_prefix(
    svc: &StowryService,
    ctx: &CancellationToken,
    prefix: &str,
    summary: &mut RemoveSummary,
) -> anyhow::Result<()> {
    let mut cursor = String::new();
    loop {
        let page = svc
            .list(ctx, ListQuery::new(prefix, REMOVE_PAGE, cursor))
            .await
            .with_context(|| format!("list prefix {prefix}"))?;
        if page.items.is_empty() {
            break;
        }
        for item in &page.items {
            remove_one(svc, ctx, &item.path, summary).await?;
        }
        if page.next_cursor.is_empty() {
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ServerMode;
    use crate::metadata::memory::MemoryMetaDataRepo;
    use crate::service::ServiceConfig;
    use crate::storage::memory::MemoryStorage;

    fn service() -> StowryService {
        StowryService::new(
            Arc::new(MemoryMetaDataRepo::new()),
            Arc::new(MemoryStorage::new()),
            ServiceConfig::new(ServerMode::Store, 30),
        )
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("site/css")).unwrap();
        std::fs::write(dir.path().join("site/index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(dir.path().join("site/css/main.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "notes").unwrap();
        dir
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("img"), "img/");
        assert_eq!(normalize_prefix("/img/"), "img/");
    }

    #[test]
    fn test_collect_single_file() {
        let dir = tree();
        let files = collect_files(&dir.path().join("notes.txt"), false, "docs").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].dest, "docs/notes.txt");
    }

    #[test]
    fn test_collect_directory_requires_recursive() {
        let dir = tree();
        assert!(collect_files(&dir.path().join("site"), false, "").is_err());

        let files = collect_files(&dir.path().join("site"), true, "").unwrap();
        let dests: Vec<_> = files.iter().map(|f| f.dest.as_str()).collect();
        assert_eq!(dests, ["css/main.css", "index.html"]);
    }

    #[tokio::test]
    async fn test_add_files_and_no_clobber() {
        let dir = tree();
        let svc = service();
        let ctx = CancellationToken::new();
        let opts = AddOptions {
            dest: "www".into(),
            recursive: true,
            no_clobber: false,
        };

        let summary = add_files(&svc, &ctx, &[dir.path().join("site")], &opts)
            .await
            .unwrap();
        assert_eq!(summary, AddSummary { added: 2, skipped: 0 });
        let meta = svc.info(&ctx, "www/index.html").await.unwrap();
        assert_eq!(meta.content_type, "text/html");
        assert_eq!(meta.file_size_bytes, 11);

        let opts = AddOptions {
            no_clobber: true,
            ..opts
        };
        let summary = add_files(&svc, &ctx, &[dir.path().join("site")], &opts)
            .await
            .unwrap();
        assert_eq!(summary, AddSummary { added: 0, skipped: 2 });
    }

    #[tokio::test]
    async fn test_remove_paths_and_prefix() {
        let dir = tree();
        let svc = service();
        let ctx = CancellationToken::new();
        let opts = AddOptions {
            recursive: true,
            ..AddOptions::default()
        };
        add_files(&svc, &ctx, &[dir.path().join("site"), dir.path().join("notes.txt")], &opts)
            .await
            .unwrap();

        let summary = remove_paths(&svc, &ctx, &["notes.txt".into(), "missing.txt".into()], false)
            .await
            .unwrap();
        assert_eq!(summary, RemoveSummary { removed: 1, not_found: 1 });

        let summary = remove_paths(&svc, &ctx, &["css/".into()], true).await.unwrap();
        assert_eq!(summary, RemoveSummary { removed: 1, not_found: 0 });

        assert!(svc.info(&ctx, "css/main.css").await.unwrap_err().is_not_found());
        assert!(svc.info(&ctx, "index.html").await.is_ok());
    }
}
