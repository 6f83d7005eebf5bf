//
// backend.rs
//
// LSP frontend: wires the session, event bus, providers, and diagnostics
// engine behind a tower-lsp server
//

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::diagnostics::{DiagnosticsEngine, DiagnosticsProvider, DiagnosticsSink};
use crate::document_store::DocumentStore;
use crate::events::{EventBus, SessionEvent};
use crate::file_service::{
    FileReader, FileSearch, DEFAULT_MAX_FILE_READS, DEFAULT_MAX_FILE_SIZE_BYTES,
};
use crate::process_runner::{ProcessRunner, ThrottledProcessRunner};
use crate::providers::{
    ExternalLintProvider, StyleConfig, StyleDiagnosticsProvider, SymbolProvider,
    WordSymbolProvider,
};
use crate::scheduler::{Priority, Scheduler};
use crate::session::Session;
use crate::workspace_index::WorkspaceIndex;

/// Server settings, read once from `initializationOptions`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cap on concurrently live external processes
    pub max_processes: usize,
    /// Cap on concurrent file reads
    pub max_file_reads: usize,
    /// Hard limit on a single file read
    pub max_file_size_bytes: u64,
    /// Bound on a whole listener fan-out wait
    pub dispatch_timeout_ms: u64,
    /// Quiet period for collapsing workspace rescans
    pub scan_debounce_ms: u64,
    /// Glob selecting files for the workspace index
    pub scan_pattern: String,
    /// Glob excluding files from scans, applied before the pattern
    pub scan_blacklist: Option<String>,
    /// Style lint settings
    pub max_line_length: usize,
    /// External lint command (argv); document text arrives on stdin
    pub external_lint_command: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_processes: 4,
            max_file_reads: DEFAULT_MAX_FILE_READS,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            dispatch_timeout_ms: 30_000,
            scan_debounce_ms: 200,
            scan_pattern: "**/*".to_string(),
            scan_blacklist: Some("**/.git/**".to_string()),
            max_line_length: 100,
            external_lint_command: None,
        }
    }
}

/// Parse server configuration from LSP initialization options.
///
/// Only fields present in the provided JSON are applied; absent fields keep
/// their defaults from `ServerConfig::default()`.
fn parse_server_config(settings: &serde_json::Value) -> ServerConfig {
    let mut config = ServerConfig::default();

    if let Some(processes) = settings.get("processes") {
        if let Some(v) = processes.get("maxConcurrent").and_then(|v| v.as_u64()) {
            if v > 0 {
                config.max_processes = v as usize;
            }
        }
    }

    if let Some(files) = settings.get("files") {
        if let Some(v) = files.get("maxConcurrentReads").and_then(|v| v.as_u64()) {
            if v > 0 {
                config.max_file_reads = v as usize;
            }
        }
        if let Some(v) = files.get("maxFileSizeBytes").and_then(|v| v.as_u64()) {
            config.max_file_size_bytes = v;
        }
        if let Some(v) = files.get("scanPattern").and_then(|v| v.as_str()) {
            if !v.is_empty() {
                config.scan_pattern = v.to_string();
            }
        }
        if let Some(v) = files.get("scanBlacklist") {
            // Explicit null disables the default blacklist.
            config.scan_blacklist = v.as_str().map(str::to_string);
        }
        if let Some(v) = files.get("scanDebounceMs").and_then(|v| v.as_u64()) {
            config.scan_debounce_ms = v;
        }
    }

    if let Some(events) = settings.get("events") {
        if let Some(v) = events.get("dispatchTimeoutMs").and_then(|v| v.as_u64()) {
            if v > 0 {
                config.dispatch_timeout_ms = v;
            }
        }
    }

    if let Some(style) = settings.get("style") {
        if let Some(v) = style.get("maxLineLength").and_then(|v| v.as_u64()) {
            if v > 0 {
                config.max_line_length = v as usize;
            }
        }
    }

    if let Some(lint) = settings.get("externalLint") {
        if let Some(command) = lint.get("command").and_then(|v| v.as_array()) {
            let argv: Vec<String> = command
                .iter()
                .filter_map(|p| p.as_str())
                .filter(|s| !s.is_empty() && !s.contains('\0'))
                .map(str::to_string)
                .collect();
            if !argv.is_empty() {
                config.external_lint_command = Some(argv);
            }
        }
    }

    log::info!("Server configuration loaded from LSP settings:");
    log::info!("  max_processes: {}", config.max_processes);
    log::info!("  max_file_reads: {}", config.max_file_reads);
    log::info!("  max_file_size_bytes: {}", config.max_file_size_bytes);
    log::info!("  dispatch_timeout_ms: {}", config.dispatch_timeout_ms);
    log::info!("  scan_debounce_ms: {}", config.scan_debounce_ms);
    log::info!("  scan_pattern: {}", config.scan_pattern);
    log::info!("  scan_blacklist: {:?}", config.scan_blacklist);
    log::info!("  max_line_length: {}", config.max_line_length);
    log::info!(
        "  external_lint_command: {:?}",
        config.external_lint_command
    );

    config
}

/// Parameters for the heron/activeDocumentsChanged notification
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveDocumentsChangedParams {
    active_uri: Option<String>,
    visible_uris: Vec<String>,
    timestamp_ms: u64,
}

/// Publishes merged diagnostics through the LSP client.
struct ClientSink {
    client: Client,
}

#[async_trait]
impl DiagnosticsSink for ClientSink {
    async fn publish(&self, uri: Url, version: Option<i32>, diagnostics: Vec<Diagnostic>) {
        self.client.publish_diagnostics(uri, diagnostics, version).await;
    }
}

/// Everything built once the client's configuration is known.
pub struct Pipeline {
    pub config: ServerConfig,
    pub folders: Vec<Url>,
    pub scheduler: Arc<Scheduler>,
    pub session: Arc<Session>,
    pub events: Arc<EventBus>,
    pub engine: Arc<DiagnosticsEngine>,
    pub file_reader: Arc<FileReader>,
    pub file_search: Arc<FileSearch>,
    pub index: Arc<WorkspaceIndex>,
    pub symbols: Arc<WordSymbolProvider>,
    pub process_runner: Arc<ThrottledProcessRunner>,
}

impl Pipeline {
    pub fn build(sink: Arc<dyn DiagnosticsSink>, config: ServerConfig, folders: Vec<Url>) -> Self {
        let scheduler = Arc::new(Scheduler::new());
        let process_runner = Arc::new(ThrottledProcessRunner::new(
            ProcessRunner::new(),
            config.max_processes,
        ));
        let file_reader = Arc::new(FileReader::new(
            config.max_file_reads,
            config.max_file_size_bytes,
        ));
        let file_search = Arc::new(FileSearch::new(
            scheduler.clone(),
            Duration::from_millis(config.scan_debounce_ms),
        ));
        let index = Arc::new(WorkspaceIndex::new());

        let mut providers: Vec<Arc<dyn DiagnosticsProvider>> =
            vec![Arc::new(StyleDiagnosticsProvider::new(StyleConfig {
                max_line_length: config.max_line_length,
            }))];
        if let Some(command) = &config.external_lint_command {
            providers.push(Arc::new(ExternalLintProvider::new(
                "external-lint",
                command.clone(),
                process_runner.clone(),
            )));
        }
        let engine = Arc::new(DiagnosticsEngine::new(providers, sink));

        let mut events = EventBus::new(Duration::from_millis(config.dispatch_timeout_ms));
        events.register_did_open(engine.clone());
        events.register_did_change(engine.clone());
        events.register_did_close(engine.clone());
        let events = Arc::new(events);

        let mut store = DocumentStore::new();
        for folder in &folders {
            store.add_workspace_root(folder.clone());
        }
        let session = Arc::new(Session::new(store, events.clone()));
        let symbols = Arc::new(WordSymbolProvider::new(session.clone(), index.clone()));

        Self {
            config,
            folders,
            scheduler,
            session,
            events,
            engine,
            file_reader,
            file_search,
            index,
            symbols,
            process_runner,
        }
    }

    /// Kick off a background workspace index pass over `folders`.
    pub fn spawn_index_pass(self: Arc<Self>, folders: Vec<Url>) {
        let pipeline = Arc::clone(&self);
        let _task = self.scheduler.spawn(Priority::Background, async move {
            pipeline
                .index
                .populate(
                    &folders,
                    &pipeline.config.scan_pattern,
                    pipeline.config.scan_blacklist.as_deref(),
                    &pipeline.file_search,
                    &pipeline.file_reader,
                    &pipeline.scheduler,
                )
                .await?;
            Ok(())
        });
    }
}

pub struct Backend {
    client: Client,
    pipeline: OnceLock<Arc<Pipeline>>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            pipeline: OnceLock::new(),
        }
    }

    fn pipeline(&self) -> Option<&Arc<Pipeline>> {
        let pipeline = self.pipeline.get();
        if pipeline.is_none() {
            log::warn!("request received before initialize");
        }
        pipeline
    }

    /// Handle the heron/activeDocumentsChanged notification
    async fn handle_active_documents_changed(&self, params: ActiveDocumentsChangedParams) {
        log::trace!(
            "activeDocumentsChanged: active={:?}, visible={}, timestamp={}",
            params.active_uri,
            params.visible_uris.len(),
            params.timestamp_ms
        );
        let Some(pipeline) = self.pipeline() else {
            return;
        };

        let active_uri = params.active_uri.and_then(|s| Url::parse(&s).ok());
        let visible_uris: Vec<Url> = params
            .visible_uris
            .iter()
            .filter_map(|s| Url::parse(s).ok())
            .collect();
        pipeline
            .session
            .update_activity(active_uri, visible_uris, params.timestamp_ms);
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing heron");

        let mut folders = Vec::new();
        if let Some(workspace_folders) = params.workspace_folders {
            for folder in workspace_folders {
                log::info!("Adding workspace folder: {}", folder.uri);
                folders.push(folder.uri);
            }
        } else if let Some(root_uri) = params.root_uri {
            log::info!("Adding root URI as workspace folder: {}", root_uri);
            folders.push(root_uri);
        }

        let config = params
            .initialization_options
            .as_ref()
            .map(parse_server_config)
            .unwrap_or_default();

        let sink = Arc::new(ClientSink {
            client: self.client.clone(),
        });
        let pipeline = Arc::new(Pipeline::build(sink, config, folders));
        if self.pipeline.set(pipeline).is_err() {
            log::warn!("initialize received twice; keeping the first configuration");
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::INCREMENTAL,
                )),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                workspace: Some(WorkspaceServerCapabilities {
                    workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                        supported: Some(true),
                        change_notifications: Some(OneOf::Left(true)),
                    }),
                    file_operations: None,
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("heron"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("heron initialized");
        let Some(pipeline) = self.pipeline() else {
            return;
        };

        pipeline.events.dispatch(SessionEvent::Initialized);
        Arc::clone(pipeline).spawn_index_pass(pipeline.folders.clone());
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("heron shutting down");
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(pipeline) = self.pipeline() else {
            return;
        };
        let doc = params.text_document;
        match pipeline
            .session
            .open(doc.uri.clone(), doc.language_id, &doc.text)
            .await
        {
            Ok(snapshot) => {
                log::trace!("opened {} at version {}", snapshot.uri, snapshot.version)
            }
            Err(e) => log::warn!("did_open: {e}"),
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(pipeline) = self.pipeline() else {
            return;
        };
        let uri = params.text_document.uri;
        match pipeline.session.change(&uri, &params.content_changes).await {
            Ok(snapshot) => log::trace!("changed {} to version {}", uri, snapshot.version),
            Err(e) => log::warn!("did_change: {e}"),
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let Some(pipeline) = self.pipeline() else {
            return;
        };
        let uri = params.text_document.uri;
        if let Err(e) = pipeline.session.close(&uri).await {
            log::warn!("did_close: {e}");
        }
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        let Some(pipeline) = self.pipeline() else {
            return;
        };

        for removed in params.event.removed {
            log::info!("Workspace folder removed: {}", removed.uri);
            if let Err(e) = pipeline.session.close_project(&removed.uri).await {
                log::trace!("workspace folder removal: {e}");
            }
        }

        for added in params.event.added {
            log::info!("Workspace folder added: {}", added.uri);
            pipeline.session.open_project(added.uri.clone()).await;

            // Debounced rescan of the new folder at background priority.
            let folder = added.uri;
            let _task = pipeline.scheduler.spawn(Priority::Background, {
                let pipeline = Arc::clone(pipeline);
                async move {
                    pipeline
                        .index
                        .populate_debounced(
                            &folder,
                            &pipeline.config.scan_pattern,
                            pipeline.config.scan_blacklist.as_deref(),
                            &pipeline.file_search,
                            &pipeline.file_reader,
                            &pipeline.scheduler,
                        )
                        .await?;
                    Ok(())
                }
            });
        }
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        let Some(pipeline) = self.pipeline() else {
            return Ok(None);
        };

        let query = pipeline.symbols.symbols(&params.query);
        match pipeline.scheduler.run(Priority::Interactive, query).await {
            Ok(symbols) => Ok(Some(symbols)),
            Err(e) => {
                // A failing provider degrades to an empty answer; it never
                // takes the server down.
                log::warn!("workspace symbol query failed: {e:#}");
                Ok(Some(Vec::new()))
            }
        }
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(Backend::new)
        .custom_method(
            "heron/activeDocumentsChanged",
            Backend::handle_active_documents_changed,
        )
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
