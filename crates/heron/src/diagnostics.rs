//
// diagnostics.rs
//
// Diagnostics aggregation: fan out to providers, merge incrementally,
// publish as results arrive
//

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Diagnostic;
use url::Url;

use crate::document_store::DocumentSnapshot;
use crate::events::{DidChangeListener, DidCloseListener, DidOpenListener};
use crate::perf;

/// One analysis capability producing diagnostics for a document.
/// Providers fail independently; a failure costs only that provider's
/// contribution for the cycle.
#[async_trait]
pub trait DiagnosticsProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn diagnostics(&self, document: &DocumentSnapshot) -> Result<Vec<Diagnostic>>;
}

/// Outbound channel for merged diagnostics. Production wraps the LSP
/// client; tests record.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn publish(&self, uri: Url, version: Option<i32>, diagnostics: Vec<Diagnostic>);
}

/// Monotonic publish gating per URI.
///
/// One cycle publishes several times at the same document version (once per
/// completed provider), so equal versions pass; a version older than the
/// last published one never does.
#[derive(Debug, Default)]
pub struct PublishGate {
    last_published: DashMap<Url, i32>,
}

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_publish(&self, uri: &Url, version: i32) -> bool {
        match self.last_published.get(uri) {
            Some(last) => version >= *last,
            None => true,
        }
    }

    pub fn record_publish(&self, uri: &Url, version: i32) {
        self.last_published.insert(uri.clone(), version);
    }

    /// Clear state for a URI (when the document closes)
    pub fn clear(&self, uri: &Url) {
        self.last_published.remove(uri);
    }
}

/// Per-document scratch state for the current diagnostics cycle.
struct DocumentTable {
    /// Document version this cycle belongs to
    version: i32,
    /// Cancels in-flight provider tasks when a newer cycle starts
    cancel: CancellationToken,
    /// Latest result per provider, in registration order
    results: Vec<Option<Vec<Diagnostic>>>,
}

impl DocumentTable {
    fn new(provider_count: usize) -> Self {
        Self {
            version: 0,
            cancel: CancellationToken::new(),
            results: vec![None; provider_count],
        }
    }
}

/// Fans each document change out to every registered provider and publishes
/// the growing merged set as providers complete.
///
/// Cycles are keyed per document version. Starting a cycle cancels the
/// previous one's in-flight provider tasks, and results that arrive for a
/// superseded version are discarded, so a slow old cycle can never overwrite
/// a newer publish.
pub struct DiagnosticsEngine {
    providers: Arc<IndexMap<String, Arc<dyn DiagnosticsProvider>>>,
    sink: Arc<dyn DiagnosticsSink>,
    gate: Arc<PublishGate>,
    tables: Arc<Mutex<HashMap<Url, DocumentTable>>>,
}

impl DiagnosticsEngine {
    pub fn new(providers: Vec<Arc<dyn DiagnosticsProvider>>, sink: Arc<dyn DiagnosticsSink>) -> Self {
        let mut registry: IndexMap<String, Arc<dyn DiagnosticsProvider>> = IndexMap::new();
        for provider in providers {
            let name = provider.name().to_string();
            if registry.insert(name.clone(), provider).is_some() {
                log::warn!("diagnostics provider {name} registered twice, later wins");
            }
        }
        Self {
            providers: Arc::new(registry),
            sink,
            gate: Arc::new(PublishGate::new()),
            tables: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Number of documents with live cycle state.
    pub async fn tracked_documents(&self) -> usize {
        self.tables.lock().await.len()
    }

    /// Start a diagnostics cycle for this snapshot.
    ///
    /// Returns as soon as the provider tasks are spawned; publishes happen
    /// as they complete.
    pub async fn run_cycle(&self, snapshot: DocumentSnapshot) {
        if self.providers.is_empty() {
            return;
        }

        let token = {
            let mut tables = self.tables.lock().await;
            let table = tables
                .entry(snapshot.uri.clone())
                .or_insert_with(|| DocumentTable::new(self.providers.len()));
            if snapshot.version < table.version {
                log::trace!(
                    "ignoring stale diagnostics trigger for {} (version {} < {})",
                    snapshot.uri,
                    snapshot.version,
                    table.version
                );
                return;
            }
            table.cancel.cancel();
            let token = CancellationToken::new();
            table.version = snapshot.version;
            table.cancel = token.clone();
            table.results = vec![None; self.providers.len()];
            token
        };

        for (index, provider) in self.providers.values().enumerate() {
            let provider = Arc::clone(provider);
            let snapshot = snapshot.clone();
            let token = token.clone();
            let tables = Arc::clone(&self.tables);
            let gate = Arc::clone(&self.gate);
            let sink = Arc::clone(&self.sink);

            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => {
                        log::trace!(
                            "provider {} superseded for {} v{}",
                            provider.name(),
                            snapshot.uri,
                            snapshot.version
                        );
                        return;
                    }
                    result = provider.diagnostics(&snapshot) => result,
                };

                // A failed provider contributes an empty list this cycle;
                // siblings and their publishes are unaffected.
                let list = match result {
                    Ok(list) => list,
                    Err(e) => {
                        log::warn!(
                            "diagnostics provider {} failed for {}: {e:#}",
                            provider.name(),
                            snapshot.uri
                        );
                        Vec::new()
                    }
                };

                let mut tables = tables.lock().await;
                let Some(table) = tables.get_mut(&snapshot.uri) else {
                    // Document closed while we ran.
                    return;
                };
                if table.version != snapshot.version {
                    return;
                }
                table.results[index] = Some(list);
                let merged: Vec<Diagnostic> = table
                    .results
                    .iter()
                    .filter_map(|r| r.as_ref())
                    .flat_map(|list| list.iter().cloned())
                    .collect();

                if !gate.can_publish(&snapshot.uri, snapshot.version) {
                    return;
                }
                gate.record_publish(&snapshot.uri, snapshot.version);
                perf::increment_diagnostics_publishes();
                // Keep the table lock across the publish so merges for one
                // document go out in completion order.
                sink.publish(snapshot.uri.clone(), Some(snapshot.version), merged)
                    .await;
            });
        }
    }

    /// Drop the document's cycle state and send the final empty publish.
    pub async fn finish_document(&self, uri: &Url) {
        let mut tables = self.tables.lock().await;
        if let Some(table) = tables.remove(uri) {
            table.cancel.cancel();
        }
        self.gate.clear(uri);
        perf::increment_diagnostics_publishes();
        self.sink.publish(uri.clone(), None, Vec::new()).await;
    }
}

#[async_trait]
impl DidOpenListener for DiagnosticsEngine {
    async fn did_open(&self, document: DocumentSnapshot) -> Result<()> {
        self.run_cycle(document).await;
        Ok(())
    }
}

#[async_trait]
impl DidChangeListener for DiagnosticsEngine {
    async fn did_change(&self, document: DocumentSnapshot) -> Result<()> {
        self.run_cycle(document).await;
        Ok(())
    }
}

#[async_trait]
impl DidCloseListener for DiagnosticsEngine {
    async fn did_close(&self, uri: Url) -> Result<()> {
        self.finish_document(&uri).await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::time::Duration;

    /// Sink that records every publish in order.
    #[derive(Default)]
    pub struct RecordingSink {
        publishes: std::sync::Mutex<Vec<(Url, Option<i32>, Vec<Diagnostic>)>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn all(&self) -> Vec<(Url, Option<i32>, Vec<Diagnostic>)> {
            self.publishes.lock().unwrap().clone()
        }

        pub fn len(&self) -> usize {
            self.publishes.lock().unwrap().len()
        }

        /// Poll until `count` publishes have been recorded.
        pub async fn wait_for(&self, count: usize) -> Vec<(Url, Option<i32>, Vec<Diagnostic>)> {
            for _ in 0..200 {
                if self.len() >= count {
                    return self.all();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {count} publishes, saw {}", self.len());
        }
    }

    #[async_trait]
    impl DiagnosticsSink for RecordingSink {
        async fn publish(&self, uri: Url, version: Option<i32>, diagnostics: Vec<Diagnostic>) {
            self.publishes.lock().unwrap().push((uri, version, diagnostics));
        }
    }

    pub fn diag(message: &str) -> Diagnostic {
        Diagnostic {
            message: message.to_string(),
            ..Default::default()
        }
    }

    pub fn messages(diagnostics: &[Diagnostic]) -> Vec<String> {
        diagnostics.iter().map(|d| d.message.clone()).collect()
    }
}
