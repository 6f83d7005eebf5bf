// perf.rs - Performance timing infrastructure
//
// Opt-in timing instrumentation for diagnosing latency issues, controlled
// via the HERON_PERF environment variable.
//
// Usage:
//   HERON_PERF=1 heron --stdio       # Enable basic timing logs
//   HERON_PERF=verbose heron --stdio # Enable detailed timing with thresholds

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Global flag indicating whether performance timing is enabled
static PERF_ENABLED: OnceLock<bool> = OnceLock::new();

/// Global flag indicating verbose mode (includes threshold warnings)
static PERF_VERBOSE: OnceLock<bool> = OnceLock::new();

static PROCESS_SPAWNS: AtomicU64 = AtomicU64::new(0);
static FILE_READS: AtomicU64 = AtomicU64::new(0);
static DIAGNOSTICS_PUBLISHES: AtomicU64 = AtomicU64::new(0);
static LINT_CACHE_HITS: AtomicU64 = AtomicU64::new(0);

/// Check if performance timing is enabled
pub fn is_enabled() -> bool {
    *PERF_ENABLED.get_or_init(|| {
        std::env::var("HERON_PERF")
            .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
            .unwrap_or(false)
    })
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    *PERF_VERBOSE.get_or_init(|| {
        std::env::var("HERON_PERF")
            .map(|v| v.to_lowercase() == "verbose")
            .unwrap_or(false)
    })
}

pub fn increment_process_spawns() {
    PROCESS_SPAWNS.fetch_add(1, Ordering::Relaxed);
}

pub fn increment_file_reads() {
    FILE_READS.fetch_add(1, Ordering::Relaxed);
}

pub fn increment_diagnostics_publishes() {
    DIAGNOSTICS_PUBLISHES.fetch_add(1, Ordering::Relaxed);
}

pub fn increment_lint_cache_hits() {
    LINT_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

/// Counter totals since process start: (process spawns, file reads,
/// diagnostics publishes, lint cache hits).
pub fn counters() -> (u64, u64, u64, u64) {
    (
        PROCESS_SPAWNS.load(Ordering::Relaxed),
        FILE_READS.load(Ordering::Relaxed),
        DIAGNOSTICS_PUBLISHES.load(Ordering::Relaxed),
        LINT_CACHE_HITS.load(Ordering::Relaxed),
    )
}

/// RAII timing guard that logs duration on drop
///
/// Use this to measure the duration of a scope:
/// ```ignore
/// let _guard = TimingGuard::new("operation_name");
/// // ... do work ...
/// // Duration logged when _guard goes out of scope
/// ```
pub struct TimingGuard {
    start: Instant,
    name: &'static str,
    threshold_warn_ms: Option<u64>,
    enabled: bool,
}

impl TimingGuard {
    /// Create a new timing guard with the given name
    ///
    /// Duration will be logged at INFO level when the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
            threshold_warn_ms: None,
            enabled: is_enabled(),
        }
    }

    /// Create a timing guard with a warning threshold
    ///
    /// If the operation takes longer than `threshold_ms`, a warning will be logged.
    #[allow(dead_code)]
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            name,
            threshold_warn_ms: Some(threshold_ms),
            enabled: is_enabled(),
        }
    }

    /// Get the elapsed time without consuming the guard
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }

        let elapsed = self.start.elapsed();
        log::info!("[PERF] {} completed in {:?}", self.name, elapsed);

        if let Some(threshold) = self.threshold_warn_ms {
            if elapsed.as_millis() > threshold as u128 && is_verbose() {
                log::warn!(
                    "[PERF] {} exceeded threshold ({}ms > {}ms)",
                    self.name,
                    elapsed.as_millis(),
                    threshold
                );
            }
        }
    }
}
