//
// document_store.rs
//
// Versioned registry of open documents and their owning projects
//

use std::collections::{HashMap, HashSet};

use ropey::Rope;
use thiserror::Error;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;
use url::Url;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document already open: {0}")]
    AlreadyOpen(Url),
    #[error("document not open: {0}")]
    NotOpen(Url),
    #[error("project not open: {0}")]
    ProjectNotOpen(Url),
}

/// An open document. The store owns the canonical instance; everything else
/// sees read-only [`DocumentSnapshot`]s.
pub struct Document {
    uri: Url,
    language_id: String,
    contents: Rope,
    version: i32,
    project_root: Option<Url>,
}

impl Document {
    fn new(uri: Url, language_id: String, text: &str, project_root: Option<Url>) -> Self {
        Self {
            uri,
            language_id,
            contents: Rope::from_str(text),
            version: 1,
            project_root,
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }

    /// Apply one change: a ranged edit (LSP positions, UTF-16 columns) or a
    /// full-text replacement when no range is given.
    fn apply_change(&mut self, change: &TextDocumentContentChangeEvent) {
        if let Some(range) = change.range {
            let last_line = self.contents.len_lines().saturating_sub(1);
            let start_line = (range.start.line as usize).min(last_line);
            let end_line = (range.end.line as usize).min(last_line);

            let start_line_text = self.contents.line(start_line).to_string();
            let end_line_text = self.contents.line(end_line).to_string();

            let start_char =
                utf16_offset_to_char_offset(&start_line_text, range.start.character as usize);
            let end_char =
                utf16_offset_to_char_offset(&end_line_text, range.end.character as usize);

            let start_idx = self.contents.line_to_char(start_line) + start_char;
            let end_idx = self.contents.line_to_char(end_line) + end_char;

            self.contents.remove(start_idx..end_idx);
            self.contents.insert(start_idx, &change.text);
        } else {
            // Full document sync
            self.contents = Rope::from_str(&change.text);
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            uri: self.uri.clone(),
            language_id: self.language_id.clone(),
            contents: self.contents.clone(),
            version: self.version,
            project_root: self.project_root.clone(),
        }
    }
}

fn utf16_offset_to_char_offset(line_text: &str, utf16_offset: usize) -> usize {
    let mut utf16_count = 0;
    let mut char_count = 0;

    for ch in line_text.chars() {
        if utf16_count >= utf16_offset {
            return char_count;
        }
        utf16_count += ch.len_utf16();
        char_count += 1;
    }
    char_count
}

/// Read-only view of a document at a point in time. Rope clones are cheap,
/// so snapshots can be handed to provider tasks freely.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub uri: Url,
    pub language_id: String,
    pub contents: Rope,
    pub version: i32,
    pub project_root: Option<Url>,
}

impl DocumentSnapshot {
    pub fn text(&self) -> String {
        self.contents.to_string()
    }
}

/// A project groups the open documents under one workspace root. Membership
/// is by reference: documents outlive the projects that contain them.
#[derive(Debug, Clone)]
pub struct Project {
    pub root_uri: Url,
    pub members: HashSet<Url>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    pub documents_opened: u64,
    pub documents_closed: u64,
    pub changes_applied: u64,
}

/// Result of a successful `open`: the new snapshot, plus the root of a
/// project this open implicitly created (if any).
#[derive(Debug)]
pub struct OpenOutcome {
    pub snapshot: DocumentSnapshot,
    pub created_project: Option<Url>,
}

/// Result of a successful `close`: the root of the project destroyed because
/// this was its last member (if any).
#[derive(Debug)]
pub struct CloseOutcome {
    pub uri: Url,
    pub removed_project: Option<Url>,
}

/// In-memory registry of open documents, keyed by URI.
///
/// Lifecycle per document: closed -> open -> open(+edits)* -> closed.
/// Re-opening an already-open URI is an error. All operations are
/// synchronous: mutations complete atomically before any event about them is
/// dispatched, so listeners never observe a half-updated store.
#[derive(Default)]
pub struct DocumentStore {
    documents: HashMap<Url, Document>,
    projects: HashMap<Url, Project>,
    workspace_roots: Vec<Url>,
    metrics: StoreMetrics,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workspace root as a candidate project root for documents
    /// opened later.
    pub fn add_workspace_root(&mut self, root: Url) {
        if !self.workspace_roots.contains(&root) {
            self.workspace_roots.push(root);
        }
    }

    pub fn open(
        &mut self,
        uri: Url,
        language_id: String,
        text: &str,
    ) -> Result<OpenOutcome, StoreError> {
        if self.documents.contains_key(&uri) {
            return Err(StoreError::AlreadyOpen(uri));
        }

        let project_root = self.matching_root(&uri);
        let mut created_project = None;
        if let Some(root) = &project_root {
            let project = self
                .projects
                .entry(root.clone())
                .or_insert_with(|| {
                    created_project = Some(root.clone());
                    Project {
                        root_uri: root.clone(),
                        members: HashSet::new(),
                    }
                });
            project.members.insert(uri.clone());
        }

        let document = Document::new(uri.clone(), language_id, text, project_root);
        let snapshot = document.snapshot();
        self.documents.insert(uri, document);
        self.metrics.documents_opened += 1;

        Ok(OpenOutcome {
            snapshot,
            created_project,
        })
    }

    /// Apply `changes` in order and bump the version by exactly one.
    ///
    /// Fails with [`StoreError::NotOpen`] for an unknown URI; it never
    /// silently creates a document.
    pub fn change(
        &mut self,
        uri: &Url,
        changes: &[TextDocumentContentChangeEvent],
    ) -> Result<DocumentSnapshot, StoreError> {
        let document = self
            .documents
            .get_mut(uri)
            .ok_or_else(|| StoreError::NotOpen(uri.clone()))?;

        for change in changes {
            document.apply_change(change);
        }
        document.version += 1;
        self.metrics.changes_applied += 1;

        Ok(document.snapshot())
    }

    pub fn close(&mut self, uri: &Url) -> Result<CloseOutcome, StoreError> {
        let document = self
            .documents
            .remove(uri)
            .ok_or_else(|| StoreError::NotOpen(uri.clone()))?;
        self.metrics.documents_closed += 1;

        let mut removed_project = None;
        if let Some(root) = &document.project_root {
            if let Some(project) = self.projects.get_mut(root) {
                project.members.remove(uri);
                if project.members.is_empty() {
                    self.projects.remove(root);
                    removed_project = Some(root.clone());
                }
            }
        }

        Ok(CloseOutcome {
            uri: uri.clone(),
            removed_project,
        })
    }

    /// Explicit workspace-open: create the project up front (idempotent) and
    /// register its root.
    pub fn open_project(&mut self, root: Url) -> &Project {
        self.add_workspace_root(root.clone());
        self.projects.entry(root.clone()).or_insert_with(|| Project {
            root_uri: root,
            members: HashSet::new(),
        })
    }

    /// Explicit workspace-close: drop the project; member documents stay
    /// open with their back-reference cleared.
    pub fn close_project(&mut self, root: &Url) -> Result<Project, StoreError> {
        let project = self
            .projects
            .remove(root)
            .ok_or_else(|| StoreError::ProjectNotOpen(root.clone()))?;
        for member in &project.members {
            if let Some(doc) = self.documents.get_mut(member) {
                doc.project_root = None;
            }
        }
        Ok(project)
    }

    pub fn snapshot(&self, uri: &Url) -> Option<DocumentSnapshot> {
        self.documents.get(uri).map(Document::snapshot)
    }

    pub fn snapshots(&self) -> Vec<DocumentSnapshot> {
        self.documents.values().map(Document::snapshot).collect()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.documents.contains_key(uri)
    }

    pub fn project(&self, root: &Url) -> Option<&Project> {
        self.projects.get(root)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Longest registered workspace root that contains `uri`.
    fn matching_root(&self, uri: &Url) -> Option<Url> {
        self.workspace_roots
            .iter()
            .filter(|root| {
                let root_str = root.as_str();
                let candidate = uri.as_str();
                if let Some(rest) = candidate.strip_prefix(root_str) {
                    root_str.ends_with('/') || rest.starts_with('/')
                } else {
                    false
                }
            })
            .max_by_key(|root| root.as_str().len())
            .cloned()
    }
}
