//
// workspace_index.rs
//
// Word index over workspace files not open in the editor
//

use std::collections::HashMap;
use std::time::SystemTime;

use dashmap::DashMap;
use regex::Regex;
use url::Url;

use crate::file_service::{FileReadError, FileReader, FileSearch};
use crate::scheduler::{Priority, Scheduler};

struct FileEntry {
    mtime: SystemTime,
    /// First occurrence per word: word -> (line, utf16 column)
    words: HashMap<String, (u32, u32)>,
}

/// A word match from the index.
#[derive(Debug, Clone)]
pub struct WordHit {
    pub word: String,
    pub uri: Url,
    pub line: u32,
    pub character: u32,
}

/// Index of identifier-like words across workspace files, keyed by URI and
/// invalidated by mtime. Open documents are not consulted here; they are
/// authoritative in the session.
pub struct WorkspaceIndex {
    files: DashMap<Url, FileEntry>,
    word: Regex,
}

impl Default for WorkspaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceIndex {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            word: Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn remove(&self, uri: &Url) {
        self.files.remove(uri);
    }

    /// True if the indexed entry for `uri` is still current at `mtime`.
    pub fn is_fresh(&self, uri: &Url, mtime: SystemTime) -> bool {
        self.files
            .get(uri)
            .map(|entry| entry.mtime == mtime)
            .unwrap_or(false)
    }

    /// Extract words from `text` and replace the entry for `uri`.
    pub fn index_text(&self, uri: Url, mtime: SystemTime, text: &str) {
        let mut words = HashMap::new();
        for (line_no, line) in text.lines().enumerate() {
            for m in self.word.find_iter(line) {
                words.entry(m.as_str().to_string()).or_insert_with(|| {
                    let col = line[..m.start()].encode_utf16().count() as u32;
                    (line_no as u32, col)
                });
            }
        }
        self.files.insert(uri, FileEntry { mtime, words });
    }

    /// Words starting with `query_lower` (caller lowercases), up to `limit`.
    pub fn find_words(&self, query_lower: &str, limit: usize) -> Vec<WordHit> {
        let mut out = Vec::new();
        if limit == 0 || query_lower.is_empty() {
            return out;
        }
        for entry in self.files.iter() {
            for (word, (line, character)) in &entry.value().words {
                if !word.to_lowercase().starts_with(query_lower) {
                    continue;
                }
                out.push(WordHit {
                    word: word.clone(),
                    uri: entry.key().clone(),
                    line: *line,
                    character: *character,
                });
                if out.len() >= limit {
                    return out;
                }
            }
        }
        out
    }

    /// Scan `folders` and (re)index every matching file that changed since
    /// the last pass. Runs as a background task on the scheduler; reads are
    /// throttled and release the turn while in flight. Returns the number of
    /// files indexed.
    pub async fn populate(
        &self,
        folders: &[Url],
        pattern: &str,
        blacklist: Option<&str>,
        search: &FileSearch,
        reader: &FileReader,
        scheduler: &Scheduler,
    ) -> anyhow::Result<usize> {
        let mut indexed = 0;
        for folder in folders {
            let found = search.search(folder, pattern, blacklist).await?;
            indexed += self.index_found(found, reader, scheduler).await;
        }
        log::info!("workspace index pass finished: {indexed} files indexed");
        Ok(indexed)
    }

    /// Debounced single-folder pass: collapses bursts of rescan requests.
    /// Returns 0 when superseded by a newer request for the same folder.
    pub async fn populate_debounced(
        &self,
        folder: &Url,
        pattern: &str,
        blacklist: Option<&str>,
        search: &FileSearch,
        reader: &FileReader,
        scheduler: &Scheduler,
    ) -> anyhow::Result<usize> {
        match search.search_debounced(folder, pattern, blacklist).await? {
            Some(found) => Ok(self.index_found(found, reader, scheduler).await),
            None => Ok(0),
        }
    }

    async fn index_found(
        &self,
        found: HashMap<Url, SystemTime>,
        reader: &FileReader,
        scheduler: &Scheduler,
    ) -> usize {
        let mut indexed = 0;
        for (uri, mtime) in found {
            if self.is_fresh(&uri, mtime) {
                continue;
            }
            let text = match scheduler
                .suspend(Priority::Background, reader.read(&uri))
                .await
            {
                Ok(text) => text,
                Err(FileReadError::TooLarge { size, limit, .. }) => {
                    log::trace!("not indexing {uri}: {size} bytes exceeds {limit}");
                    continue;
                }
                Err(e) => {
                    log::trace!("not indexing {uri}: {e}");
                    continue;
                }
            };
            self.index_text(uri, mtime, &text);
            indexed += 1;
        }
        indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_index_and_find() {
        let index = WorkspaceIndex::new();
        let uri = Url::parse("file:///ws/a.rs").unwrap();
        index.index_text(
            uri.clone(),
            SystemTime::UNIX_EPOCH,
            "fn handle_request() {}\nlet other = handle_request();",
        );

        let hits = index.find_words("handle", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].word, "handle_request");
        // First occurrence wins.
        assert_eq!(hits[0].line, 0);
        assert_eq!(hits[0].character, 3);

        assert!(index.find_words("nomatch", 10).is_empty());
        assert!(index.find_words("handle", 0).is_empty());
    }

    #[test]
    fn test_freshness_by_mtime() {
        let index = WorkspaceIndex::new();
        let uri = Url::parse("file:///ws/a.rs").unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(1);

        index.index_text(uri.clone(), t0, "alpha");
        assert!(index.is_fresh(&uri, t0));
        assert!(!index.is_fresh(&uri, t1));

        index.index_text(uri.clone(), t1, "beta");
        assert!(index.is_fresh(&uri, t1));
        assert_eq!(index.find_words("alpha", 10).len(), 0);
        assert_eq!(index.find_words("beta", 10).len(), 1);
    }

    #[tokio::test]
    async fn test_populate_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "first_word second_word").unwrap();
        std::fs::write(dir.path().join("b.txt"), "third_word").unwrap();
        std::fs::write(dir.path().join("skip.log"), "ignored_word").unwrap();
        let folder = Url::from_file_path(dir.path()).unwrap();

        let scheduler = Arc::new(Scheduler::new());
        let search = FileSearch::new(scheduler.clone(), Duration::from_millis(10));
        let reader = FileReader::new(4, 1024);
        let index = WorkspaceIndex::new();

        let indexed = {
            let folders = [folder.clone()];
            let run = index.populate(
                &folders,
                "**/*.txt",
                None,
                &search,
                &reader,
                &scheduler,
            );
            scheduler.run(Priority::Background, run).await.unwrap()
        };
        assert_eq!(indexed, 2);
        assert_eq!(index.find_words("first_word", 10).len(), 1);
        assert!(index.find_words("ignored_word", 10).is_empty());

        // A second pass with unchanged files indexes nothing new.
        let folders = [folder];
        let run = index.populate(
            &folders,
            "**/*.txt",
            None,
            &search,
            &reader,
            &scheduler,
        );
        let indexed = scheduler.run(Priority::Background, run).await.unwrap();
        assert_eq!(indexed, 0);
    }

    #[tokio::test]
    async fn test_populate_skips_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), "tiny_word").unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(4096)).unwrap();
        let folder = Url::from_file_path(dir.path()).unwrap();

        let scheduler = Arc::new(Scheduler::new());
        let search = FileSearch::new(scheduler.clone(), Duration::from_millis(10));
        let reader = FileReader::new(4, 64);
        let index = WorkspaceIndex::new();

        let folders = [folder];
        let run = index.populate(&folders, "**/*.txt", None, &search, &reader, &scheduler);
        let indexed = scheduler.run(Priority::Background, run).await.unwrap();
        assert_eq!(indexed, 1);
        assert_eq!(index.find_words("tiny_word", 10).len(), 1);
    }
}
