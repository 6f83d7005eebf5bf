//
// file_service.rs
//
// Throttled file reads and cooperative recursive file search
//

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use globset::{Glob, GlobMatcher};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

use crate::perf;
use crate::scheduler::{Priority, Scheduler};
use crate::throttle::Throttle;

/// Default cap on concurrent file reads.
pub const DEFAULT_MAX_FILE_READS: usize = 30;

/// Default hard limit on the size of a single read (5 MiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 5 * 1024 * 1024;

/// How many directory entries a search visits between yields.
const SEARCH_YIELD_EVERY: usize = 1000;

#[derive(Debug, Error)]
pub enum FileReadError {
    #[error("not a local file: {0}")]
    NotFile(Url),
    #[error("file not found: {0}")]
    NotFound(Url),
    #[error("file too large: {uri} is {size} bytes (limit {limit})")]
    TooLarge { uri: Url, size: u64, limit: u64 },
    #[error("cannot open {uri}: {source}")]
    Io {
        uri: Url,
        #[source]
        source: std::io::Error,
    },
}

/// Bounded-concurrency, size-capped file reads.
///
/// Reads go through `tokio::fs`, so other tasks run while a read is in
/// flight. Oversized files fail with [`FileReadError::TooLarge`] before any
/// content is read.
pub struct FileReader {
    throttle: Throttle,
    max_size: u64,
}

impl FileReader {
    pub fn new(max_concurrent: usize, max_size: u64) -> Self {
        Self {
            throttle: Throttle::new(max_concurrent),
            max_size,
        }
    }

    pub async fn read(&self, uri: &Url) -> Result<String, FileReadError> {
        self.throttle
            .run(async {
                let path = uri
                    .to_file_path()
                    .map_err(|()| FileReadError::NotFile(uri.clone()))?;

                perf::increment_file_reads();

                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_error(uri, e))?;
                if metadata.len() > self.max_size {
                    return Err(FileReadError::TooLarge {
                        uri: uri.clone(),
                        size: metadata.len(),
                        limit: self.max_size,
                    });
                }

                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_error(uri, e))
            })
            .await
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }
}

fn io_error(uri: &Url, source: std::io::Error) -> FileReadError {
    if source.kind() == std::io::ErrorKind::NotFound {
        FileReadError::NotFound(uri.clone())
    } else {
        FileReadError::Io {
            uri: uri.clone(),
            source,
        }
    }
}

/// Recursive glob search over a directory tree.
///
/// The walk yields the scheduler turn at background priority every
/// [`SEARCH_YIELD_EVERY`] entries so interactive work is not held up by a
/// huge tree. Unreadable directories and entries are skipped; an unreadable
/// base produces an empty result.
pub struct FileSearch {
    scheduler: Arc<Scheduler>,
    debouncer: ScanDebouncer,
}

impl FileSearch {
    pub fn new(scheduler: Arc<Scheduler>, debounce: Duration) -> Self {
        Self {
            scheduler,
            debouncer: ScanDebouncer::new(debounce),
        }
    }

    /// Walk `base` collecting files matching `pattern` (relative to `base`),
    /// excluding any path matching `blacklist`. Returns uri -> mtime.
    pub async fn search(
        &self,
        base: &Url,
        pattern: &str,
        blacklist: Option<&str>,
    ) -> anyhow::Result<HashMap<Url, SystemTime>> {
        let include = compile_glob(pattern)?;
        let exclude = blacklist.map(compile_glob).transpose()?;

        let Ok(base_path) = base.to_file_path() else {
            log::warn!("file search base is not a local path: {base}");
            return Ok(HashMap::new());
        };

        let mut out = HashMap::new();
        let mut visited = 0usize;
        for entry in WalkDir::new(&base_path).follow_links(false) {
            visited += 1;
            if visited % SEARCH_YIELD_EVERY == 0 {
                self.scheduler.yield_now(Priority::Background).await;
            }

            let entry = match entry {
                Ok(entry) => entry,
                // Unreadable directory or entry: skip, keep walking.
                Err(e) => {
                    log::trace!("skipping unreadable entry under {}: {e}", base);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&base_path).unwrap_or(entry.path());
            if let Some(exclude) = &exclude {
                if exclude.is_match(rel) {
                    continue;
                }
            }
            if !include.is_match(rel) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(mtime) = metadata.modified() else {
                continue;
            };
            let Ok(uri) = Url::from_file_path(entry.path()) else {
                continue;
            };
            out.insert(uri, mtime);
        }

        log::trace!(
            "file search under {} visited {} entries, matched {}",
            base,
            visited,
            out.len()
        );
        Ok(out)
    }

    /// Debounced variant: waits out the configured quiet period first, and a
    /// newer request for the same base supersedes the pending one (which then
    /// resolves to `None`).
    pub async fn search_debounced(
        &self,
        base: &Url,
        pattern: &str,
        blacklist: Option<&str>,
    ) -> anyhow::Result<Option<HashMap<Url, SystemTime>>> {
        let token = self.debouncer.schedule(base.clone());
        tokio::select! {
            _ = token.cancelled() => {
                log::trace!("scan of {base} superseded during debounce");
                return Ok(None);
            }
            _ = tokio::time::sleep(self.debouncer.quiet_period) => {}
        }
        self.debouncer.complete(base);
        self.search(base, pattern, blacklist).await.map(Some)
    }
}

fn compile_glob(pattern: &str) -> anyhow::Result<GlobMatcher> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

/// Collapses bursts of scan requests per base URI: scheduling a scan cancels
/// the pending one for the same base.
struct ScanDebouncer {
    quiet_period: Duration,
    pending: Mutex<HashMap<Url, CancellationToken>>,
}

impl ScanDebouncer {
    fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn schedule(&self, base: Url) -> CancellationToken {
        let mut pending = self.pending.lock().unwrap();
        if let Some(old) = pending.remove(&base) {
            old.cancel();
        }
        let token = CancellationToken::new();
        pending.insert(base, token.clone());
        token
    }

    fn complete(&self, base: &Url) {
        self.pending.lock().unwrap().remove(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn reader() -> FileReader {
        FileReader::new(4, 64)
    }

    #[tokio::test]
    async fn test_read_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "contents").unwrap();
        let uri = Url::from_file_path(&path).unwrap();

        let text = reader().read(&uri).await.unwrap();
        assert_eq!(text, "contents");
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let uri = Url::from_file_path(dir.path().join("missing.txt")).unwrap();

        let err = reader().read(&uri).await.unwrap_err();
        assert!(matches!(err, FileReadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_oversized_file_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        fs::write(&path, "x".repeat(100)).unwrap();
        let uri = Url::from_file_path(&path).unwrap();

        let err = reader().read(&uri).await.unwrap_err();
        match err {
            FileReadError::TooLarge { size, limit, .. } => {
                assert_eq!(size, 100);
                assert_eq!(limit, 64);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_non_file_uri() {
        let uri = Url::parse("https://example.com/a.txt").unwrap();
        let err = reader().read(&uri).await.unwrap_err();
        assert!(matches!(err, FileReadError::NotFile(_)));
    }

    fn search_fixture() -> (tempfile::TempDir, Url) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn lib() {}").unwrap();
        fs::write(dir.path().join("target/debug/gen.rs"), "// generated").unwrap();
        fs::write(dir.path().join("README.md"), "# readme").unwrap();
        let base = Url::from_file_path(dir.path()).unwrap();
        (dir, base)
    }

    #[tokio::test]
    async fn test_search_matches_pattern() {
        let (_dir, base) = search_fixture();
        let search = FileSearch::new(Arc::new(Scheduler::new()), Duration::from_millis(10));

        let found = search.search(&base, "**/*.rs", None).await.unwrap();
        let names: Vec<String> = found
            .keys()
            .map(|u| u.path_segments().unwrap().last().unwrap().to_string())
            .collect();
        assert_eq!(found.len(), 3);
        assert!(names.contains(&"main.rs".to_string()));
        assert!(names.contains(&"gen.rs".to_string()));
    }

    #[tokio::test]
    async fn test_search_blacklist_wins_over_pattern() {
        let (_dir, base) = search_fixture();
        let search = FileSearch::new(Arc::new(Scheduler::new()), Duration::from_millis(10));

        let found = search
            .search(&base, "**/*.rs", Some("target/**"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        for uri in found.keys() {
            assert!(!uri.path().contains("/target/"));
        }
    }

    #[tokio::test]
    async fn test_search_unreadable_base_is_empty() {
        let search = FileSearch::new(Arc::new(Scheduler::new()), Duration::from_millis(10));
        let base = Url::from_file_path("/no/such/directory/heron-test").unwrap();

        let found = search.search(&base, "**/*", None).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_search_reports_mtime() {
        let (_dir, base) = search_fixture();
        let search = FileSearch::new(Arc::new(Scheduler::new()), Duration::from_millis(10));

        let found = search.search(&base, "README.md", None).await.unwrap();
        assert_eq!(found.len(), 1);
        let mtime = found.values().next().unwrap();
        assert!(*mtime > SystemTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_debounce_supersedes_pending_scan() {
        let (_dir, base) = search_fixture();
        let search = Arc::new(FileSearch::new(
            Arc::new(Scheduler::new()),
            Duration::from_millis(80),
        ));

        let first = {
            let search = search.clone();
            let base = base.clone();
            tokio::spawn(async move { search.search_debounced(&base, "**/*.rs", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = search.search_debounced(&base, "**/*.rs", None).await.unwrap();

        assert!(first.await.unwrap().unwrap().is_none());
        assert_eq!(second.unwrap().len(), 3);
    }
}
