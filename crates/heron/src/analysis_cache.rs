//
// analysis_cache.rs
//
// Fingerprint-keyed memoization for expensive per-document analyses
//

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::RwLock;

use lru::LruCache;
use url::Url;

use crate::document_store::DocumentSnapshot;

/// Default capacity for an analysis cache.
const DEFAULT_CAPACITY: usize = 256;

/// Identity of a document's content state.
///
/// Combines the version counter with a content hash, so re-running an
/// analysis against an unchanged document is a hit and any change in either
/// component is a guaranteed miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub version: i32,
    pub content_hash: u64,
}

impl Fingerprint {
    pub fn of(snapshot: &DocumentSnapshot) -> Self {
        // Hash the raw byte stream so equal content fingerprints equally
        // regardless of how the rope happens to be chunked.
        let mut hasher = DefaultHasher::new();
        for chunk in snapshot.contents.chunks() {
            hasher.write(chunk.as_bytes());
        }
        Self {
            version: snapshot.version,
            content_hash: hasher.finish(),
        }
    }
}

/// Bounded memoization table keyed by (subject URI, fingerprint).
///
/// Each URI holds at most its latest entry; an entry is returned only when
/// the fingerprint matches exactly, so a stale fingerprint simply misses.
/// Uses `peek()` for reads (no LRU promotion, works under the read lock) and
/// `push()` for writes, which keeps the read path fully concurrent.
pub struct AnalysisCache<V> {
    inner: RwLock<LruCache<Url, (Fingerprint, V)>>,
}

impl<V: Clone> AnalysisCache<V> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap =
            NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: RwLock::new(LruCache::new(cap)),
        }
    }

    pub fn get_if_fresh(&self, uri: &Url, fingerprint: &Fingerprint) -> Option<V> {
        let guard = self.inner.read().ok()?;
        guard.peek(uri).and_then(|(cached_fp, value)| {
            if cached_fp == fingerprint {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, uri: Url, fingerprint: Fingerprint, value: V) {
        if let Ok(mut guard) = self.inner.write() {
            guard.push(uri, (fingerprint, value));
        }
    }

    pub fn invalidate(&self, uri: &Url) {
        if let Ok(mut guard) = self.inner.write() {
            guard.pop(uri);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut guard) = self.inner.write() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for AnalysisCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for AnalysisCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisCache").finish_non_exhaustive()
    }
}

/// Per-user cache directory for on-disk analysis caches. Contents are opaque
/// to the server core.
pub fn cache_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        xdg::BaseDirectories::with_prefix("heron")
            .ok()
            .map(|dirs| dirs.get_cache_home())
    }
    #[cfg(not(unix))]
    {
        std::env::var_os("LOCALAPPDATA").map(|base| PathBuf::from(base).join("heron"))
    }
}
