//
// session.rs
//
// Document session: store mutations followed by lifecycle event dispatch
//

use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;
use url::Url;

use crate::document_store::{DocumentSnapshot, DocumentStore, StoreError};
use crate::events::{EventBus, SessionEvent};

/// Client activity hints used to order interactive work.
#[derive(Debug, Clone, Default)]
pub struct ActivityState {
    /// Currently active document URI (if any)
    pub active_uri: Option<Url>,
    /// Currently visible document URIs
    pub visible_uris: Vec<Url>,
    /// Timestamp of the last activity update (for ordering)
    pub timestamp_ms: u64,
    /// Most recently changed/opened URIs (fallback ordering)
    pub recent_uris: Vec<Url>,
}

impl ActivityState {
    /// Record a document as recently changed/opened
    pub fn record_recent(&mut self, uri: Url) {
        self.recent_uris.retain(|u| u != &uri);
        self.recent_uris.insert(0, uri);
        if self.recent_uris.len() > 100 {
            self.recent_uris.truncate(100);
        }
    }

    pub fn remove(&mut self, uri: &Url) {
        self.recent_uris.retain(|u| u != uri);
        if self.active_uri.as_ref() == Some(uri) {
            self.active_uri = None;
        }
        self.visible_uris.retain(|u| u != uri);
    }

    /// Priority score for a URI (lower = higher priority).
    pub fn priority_score(&self, uri: &Url) -> usize {
        if Some(uri) == self.active_uri.as_ref() {
            return 0;
        }
        if self.visible_uris.contains(uri) {
            return 1;
        }
        self.recent_uris
            .iter()
            .position(|u| u == uri)
            .map(|p| p + 2)
            .unwrap_or(usize::MAX)
    }
}

/// The single mutable shared resource at the center of the server.
///
/// Every mutation runs to completion under the store's write lock before the
/// matching lifecycle event is dispatched, so listeners only ever observe a
/// fully consistent store. Dispatch is asynchronous and its outcome never
/// rolls a mutation back.
pub struct Session {
    store: RwLock<DocumentStore>,
    events: Arc<EventBus>,
    activity: Mutex<ActivityState>,
}

impl Session {
    pub fn new(store: DocumentStore, events: Arc<EventBus>) -> Self {
        Self {
            store: RwLock::new(store),
            events,
            activity: Mutex::new(ActivityState::default()),
        }
    }

    pub async fn open(
        &self,
        uri: Url,
        language_id: String,
        text: &str,
    ) -> Result<DocumentSnapshot, StoreError> {
        let outcome = {
            let mut store = self.store.write().await;
            store.open(uri.clone(), language_id, text)?
        };
        self.activity.lock().unwrap().record_recent(uri);

        if let Some(root_uri) = outcome.created_project {
            self.events.dispatch(SessionEvent::ProjectOpened { root_uri });
        }
        self.events
            .dispatch(SessionEvent::DocumentOpened(outcome.snapshot.clone()));
        Ok(outcome.snapshot)
    }

    pub async fn change(
        &self,
        uri: &Url,
        changes: &[TextDocumentContentChangeEvent],
    ) -> Result<DocumentSnapshot, StoreError> {
        let snapshot = {
            let mut store = self.store.write().await;
            store.change(uri, changes)?
        };
        self.activity.lock().unwrap().record_recent(uri.clone());

        self.events
            .dispatch(SessionEvent::DocumentChanged(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn close(&self, uri: &Url) -> Result<(), StoreError> {
        let outcome = {
            let mut store = self.store.write().await;
            store.close(uri)?
        };
        self.activity.lock().unwrap().remove(uri);

        self.events
            .dispatch(SessionEvent::DocumentClosed { uri: outcome.uri });
        if let Some(root_uri) = outcome.removed_project {
            self.events.dispatch(SessionEvent::ProjectClosed { root_uri });
        }
        Ok(())
    }

    pub async fn open_project(&self, root: Url) {
        {
            let mut store = self.store.write().await;
            store.open_project(root.clone());
        }
        self.events
            .dispatch(SessionEvent::ProjectOpened { root_uri: root });
    }

    pub async fn close_project(&self, root: &Url) -> Result<(), StoreError> {
        {
            let mut store = self.store.write().await;
            store.close_project(root)?;
        }
        self.events.dispatch(SessionEvent::ProjectClosed {
            root_uri: root.clone(),
        });
        Ok(())
    }

    pub async fn add_workspace_root(&self, root: Url) {
        self.store.write().await.add_workspace_root(root);
    }

    pub async fn snapshot(&self, uri: &Url) -> Option<DocumentSnapshot> {
        self.store.read().await.snapshot(uri)
    }

    pub async fn snapshots(&self) -> Vec<DocumentSnapshot> {
        self.store.read().await.snapshots()
    }

    pub async fn open_count(&self) -> usize {
        self.store.read().await.len()
    }

    pub fn update_activity(
        &self,
        active_uri: Option<Url>,
        visible_uris: Vec<Url>,
        timestamp_ms: u64,
    ) {
        let mut activity = self.activity.lock().unwrap();
        activity.active_uri = active_uri;
        activity.visible_uris = visible_uris;
        activity.timestamp_ms = timestamp_ms;
    }

    pub fn activity_score(&self, uri: &Url) -> usize {
        self.activity.lock().unwrap().priority_score(uri)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
