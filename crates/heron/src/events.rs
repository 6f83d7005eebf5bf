//! Lifecycle event dispatch.
//!
//! Listeners implement one small trait per event kind and are registered
//! explicitly at startup; there is no runtime lookup by name. Dispatch fans
//! out to every listener for the event concurrently. `dispatch` is
//! fire-and-forget for the caller; `dispatch_and_wait` awaits the whole
//! fan-out under a single bounded timeout.
//!
//! Timeout policy: the timeout bounds the *wait*, not the work. Listener
//! tasks that already started are detached tokio tasks and keep running
//! after the wait fails. A listener failure is reported to whoever awaits
//! the dispatch; sibling listeners still run to completion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use crate::document_store::DocumentSnapshot;

/// Default bound on how long `dispatch_and_wait` waits for listeners.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle events, one variant per listener trait.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Initialized,
    DocumentOpened(DocumentSnapshot),
    DocumentChanged(DocumentSnapshot),
    DocumentClosed { uri: Url },
    ProjectOpened { root_uri: Url },
    ProjectClosed { root_uri: Url },
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Initialized => "initialized",
            SessionEvent::DocumentOpened(_) => "document-opened",
            SessionEvent::DocumentChanged(_) => "document-changed",
            SessionEvent::DocumentClosed { .. } => "document-closed",
            SessionEvent::ProjectOpened { .. } => "project-opened",
            SessionEvent::ProjectClosed { .. } => "project-closed",
        }
    }
}

#[async_trait]
pub trait InitializedListener: Send + Sync {
    async fn initialized(&self) -> Result<()>;
}

#[async_trait]
pub trait DidOpenListener: Send + Sync {
    async fn did_open(&self, document: DocumentSnapshot) -> Result<()>;
}

#[async_trait]
pub trait DidChangeListener: Send + Sync {
    async fn did_change(&self, document: DocumentSnapshot) -> Result<()>;
}

#[async_trait]
pub trait DidCloseListener: Send + Sync {
    async fn did_close(&self, uri: Url) -> Result<()>;
}

#[async_trait]
pub trait DidOpenProjectListener: Send + Sync {
    async fn did_open_project(&self, root_uri: Url) -> Result<()>;
}

#[async_trait]
pub trait DidCloseProjectListener: Send + Sync {
    async fn did_close_project(&self, root_uri: Url) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event dispatch timed out after {0:?}")]
    Timeout(Duration),
    #[error("listener failed: {0}")]
    ListenerFailed(#[source] anyhow::Error),
}

/// Explicit listener registry, populated once at startup.
pub struct EventBus {
    timeout: Duration,
    initialized: Vec<Arc<dyn InitializedListener>>,
    open: Vec<Arc<dyn DidOpenListener>>,
    change: Vec<Arc<dyn DidChangeListener>>,
    close: Vec<Arc<dyn DidCloseListener>>,
    project_open: Vec<Arc<dyn DidOpenProjectListener>>,
    project_close: Vec<Arc<dyn DidCloseProjectListener>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_DISPATCH_TIMEOUT)
    }
}

impl EventBus {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            initialized: Vec::new(),
            open: Vec::new(),
            change: Vec::new(),
            close: Vec::new(),
            project_open: Vec::new(),
            project_close: Vec::new(),
        }
    }

    pub fn register_initialized(&mut self, listener: Arc<dyn InitializedListener>) {
        self.initialized.push(listener);
    }

    pub fn register_did_open(&mut self, listener: Arc<dyn DidOpenListener>) {
        self.open.push(listener);
    }

    pub fn register_did_change(&mut self, listener: Arc<dyn DidChangeListener>) {
        self.change.push(listener);
    }

    pub fn register_did_close(&mut self, listener: Arc<dyn DidCloseListener>) {
        self.close.push(listener);
    }

    pub fn register_did_open_project(&mut self, listener: Arc<dyn DidOpenProjectListener>) {
        self.project_open.push(listener);
    }

    pub fn register_did_close_project(&mut self, listener: Arc<dyn DidCloseProjectListener>) {
        self.project_close.push(listener);
    }

    /// Fan the event out and return immediately; the wait (and any timeout
    /// or listener failure) happens on a detached task and is logged there.
    pub fn dispatch(&self, event: SessionEvent) {
        let kind = event.kind();
        let handles = self.start_listeners(event);
        if handles.is_empty() {
            return;
        }
        let timeout = self.timeout;
        tokio::spawn(async move {
            if let Err(e) = wait_all(handles, timeout).await {
                log::warn!("dispatch of {kind} event failed: {e}");
            }
        });
    }

    /// Invoke every listener registered for `event` concurrently and wait
    /// for all of them, bounded by one timeout over the whole wait.
    pub async fn dispatch_and_wait(&self, event: SessionEvent) -> Result<(), DispatchError> {
        let handles = self.start_listeners(event);
        if handles.is_empty() {
            return Ok(());
        }
        wait_all(handles, self.timeout).await
    }

    /// Spawn one detached task per registered listener. The tasks are
    /// already running when this returns; dropping the handles does not
    /// cancel them.
    fn start_listeners(&self, event: SessionEvent) -> Vec<JoinHandle<Result<()>>> {
        match event {
            SessionEvent::Initialized => self
                .initialized
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    tokio::spawn(async move { l.initialized().await })
                })
                .collect(),
            SessionEvent::DocumentOpened(snapshot) => self
                .open
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    let snapshot = snapshot.clone();
                    tokio::spawn(async move { l.did_open(snapshot).await })
                })
                .collect(),
            SessionEvent::DocumentChanged(snapshot) => self
                .change
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    let snapshot = snapshot.clone();
                    tokio::spawn(async move { l.did_change(snapshot).await })
                })
                .collect(),
            SessionEvent::DocumentClosed { uri } => self
                .close
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    let uri = uri.clone();
                    tokio::spawn(async move { l.did_close(uri).await })
                })
                .collect(),
            SessionEvent::ProjectOpened { root_uri } => self
                .project_open
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    let root_uri = root_uri.clone();
                    tokio::spawn(async move { l.did_open_project(root_uri).await })
                })
                .collect(),
            SessionEvent::ProjectClosed { root_uri } => self
                .project_close
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    let root_uri = root_uri.clone();
                    tokio::spawn(async move { l.did_close_project(root_uri).await })
                })
                .collect(),
        }
    }
}

/// Await every handle, bounded by a single timeout over the whole wait.
/// The first listener failure (if any) is reported after all handles are
/// drained; a timeout abandons the wait but not the listener tasks.
async fn wait_all(
    handles: Vec<JoinHandle<Result<()>>>,
    timeout: Duration,
) -> Result<(), DispatchError> {
    let wait = async {
        let mut first_failure: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_failure.get_or_insert(e);
                }
                Err(join_error) => {
                    first_failure.get_or_insert(anyhow!("listener panicked: {join_error}"));
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(DispatchError::ListenerFailed(e)),
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn snapshot(text: &str) -> DocumentSnapshot {
        DocumentSnapshot {
            uri: Url::parse("file:///a.txt").unwrap(),
            language_id: "plaintext".to_string(),
            contents: ropey::Rope::from_str(text),
            version: 1,
            project_root: None,
        }
    }

    struct CountingListener {
        calls: AtomicUsize,
        done: Notify,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                done: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl DidOpenListener for CountingListener {
        async fn did_open(&self, _document: DocumentSnapshot) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.done.notify_waiters();
            Ok(())
        }
    }

    struct SlowListener {
        delay: Duration,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DidOpenListener for SlowListener {
        async fn did_open(&self, _document: DocumentSnapshot) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl DidOpenListener for FailingListener {
        async fn did_open(&self, _document: DocumentSnapshot) -> Result<()> {
            Err(anyhow!("listener exploded"))
        }
    }

    struct StuckListener;

    #[async_trait]
    impl DidOpenListener for StuckListener {
        async fn did_open(&self, _document: DocumentSnapshot) -> Result<()> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_all_listeners_invoked() {
        let first = CountingListener::new();
        let second = CountingListener::new();
        let mut bus = EventBus::new(DEFAULT_DISPATCH_TIMEOUT);
        bus.register_did_open(first.clone());
        bus.register_did_open(second.clone());

        bus.dispatch_and_wait(SessionEvent::DocumentOpened(snapshot("x")))
            .await
            .unwrap();

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_returns_immediately() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new(DEFAULT_DISPATCH_TIMEOUT);
        bus.register_did_open(Arc::new(SlowListener {
            delay: Duration::from_millis(150),
            finished: finished.clone(),
        }));
        let bus = Arc::new(bus);

        let start = std::time::Instant::now();
        bus.dispatch(SessionEvent::DocumentOpened(snapshot("x")));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // The fan-out still happened in the background.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_listener() {
        let mut bus = EventBus::new(Duration::from_millis(50));
        bus.register_did_open(Arc::new(StuckListener));

        let err = bus
            .dispatch_and_wait(SessionEvent::DocumentOpened(snapshot("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_started_listeners_survive_timeout() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new(Duration::from_millis(40));
        bus.register_did_open(Arc::new(SlowListener {
            delay: Duration::from_millis(120),
            finished: finished.clone(),
        }));

        let err = bus
            .dispatch_and_wait(SessionEvent::DocumentOpened(snapshot("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        // Not forcibly cancelled: the listener still runs to completion.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_failure_observable_and_isolated() {
        let healthy = CountingListener::new();
        let mut bus = EventBus::new(DEFAULT_DISPATCH_TIMEOUT);
        bus.register_did_open(Arc::new(FailingListener));
        bus.register_did_open(healthy.clone());

        let err = bus
            .dispatch_and_wait(SessionEvent::DocumentOpened(snapshot("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ListenerFailed(_)));
        // The sibling ran to completion despite the failure.
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_with_no_listeners_is_ok() {
        let bus = EventBus::new(DEFAULT_DISPATCH_TIMEOUT);
        bus.dispatch_and_wait(SessionEvent::Initialized).await.unwrap();
    }
}
