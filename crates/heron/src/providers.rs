//
// providers.rs
//
// Built-in analysis providers: text style lints, external lint commands,
// and word-based symbol search
//

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, Location, Position, Range, SymbolInformation, SymbolKind,
};
use url::Url;

use crate::analysis_cache::{AnalysisCache, Fingerprint};
use crate::diagnostics::DiagnosticsProvider;
use crate::document_store::DocumentSnapshot;
use crate::perf;
use crate::process_runner::ThrottledProcessRunner;
use crate::session::Session;
use crate::workspace_index::WorkspaceIndex;

#[derive(Debug, Clone)]
pub struct StyleConfig {
    pub max_line_length: usize,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            max_line_length: 100,
        }
    }
}

/// Language-agnostic text lints: trailing whitespace, overlong lines, and
/// leftover merge conflict markers.
pub struct StyleDiagnosticsProvider {
    config: StyleConfig,
    trailing_whitespace: Regex,
    conflict_marker: Regex,
}

impl StyleDiagnosticsProvider {
    pub fn new(config: StyleConfig) -> Self {
        Self {
            config,
            trailing_whitespace: Regex::new(r"[ \t]+$").unwrap(),
            conflict_marker: Regex::new(r"^(<{7}|={7}|>{7})").unwrap(),
        }
    }

    fn lint_line(&self, line_no: u32, line: &str, out: &mut Vec<Diagnostic>) {
        if let Some(m) = self.trailing_whitespace.find(line) {
            out.push(diagnostic(
                line_no,
                utf16_col(line, m.start()),
                utf16_col(line, m.end()),
                DiagnosticSeverity::WARNING,
                "trailing whitespace",
            ));
        }
        if self.conflict_marker.is_match(line) {
            out.push(diagnostic(
                line_no,
                0,
                7,
                DiagnosticSeverity::ERROR,
                "merge conflict marker",
            ));
        }
        let width = line.encode_utf16().count();
        if width > self.config.max_line_length {
            out.push(diagnostic(
                line_no,
                self.config.max_line_length as u32,
                width as u32,
                DiagnosticSeverity::INFORMATION,
                &format!(
                    "line exceeds {} characters ({width})",
                    self.config.max_line_length
                ),
            ));
        }
    }
}

#[async_trait]
impl DiagnosticsProvider for StyleDiagnosticsProvider {
    fn name(&self) -> &str {
        "style"
    }

    async fn diagnostics(&self, document: &DocumentSnapshot) -> Result<Vec<Diagnostic>> {
        let text = document.text();
        let mut out = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            self.lint_line(line_no as u32, line, &mut out);
        }
        Ok(out)
    }
}

fn diagnostic(
    line: u32,
    start_col: u32,
    end_col: u32,
    severity: DiagnosticSeverity,
    message: &str,
) -> Diagnostic {
    Diagnostic {
        range: Range {
            start: Position {
                line,
                character: start_col,
            },
            end: Position {
                line,
                character: end_col,
            },
        },
        severity: Some(severity),
        source: Some("heron".to_string()),
        message: message.to_string(),
        ..Default::default()
    }
}

fn utf16_col(line: &str, byte_offset: usize) -> u32 {
    line[..byte_offset].encode_utf16().count() as u32
}

/// Pipes the document through an external lint command and parses one
/// finding per output line: `LINE:COL:SEVERITY:MESSAGE` (1-based line and
/// column). Results are memoized per content fingerprint so an unchanged
/// document never re-runs the command.
pub struct ExternalLintProvider {
    name: String,
    command: Vec<String>,
    runner: Arc<ThrottledProcessRunner>,
    cache: AnalysisCache<Vec<Diagnostic>>,
}

impl ExternalLintProvider {
    pub fn new(name: &str, command: Vec<String>, runner: Arc<ThrottledProcessRunner>) -> Self {
        Self {
            name: name.to_string(),
            command,
            runner,
            cache: AnalysisCache::new(),
        }
    }
}

#[async_trait]
impl DiagnosticsProvider for ExternalLintProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn diagnostics(&self, document: &DocumentSnapshot) -> Result<Vec<Diagnostic>> {
        let fingerprint = Fingerprint::of(document);
        if let Some(hit) = self.cache.get_if_fresh(&document.uri, &fingerprint) {
            perf::increment_lint_cache_hits();
            return Ok(hit);
        }

        let result = self
            .runner
            .run(&self.command, Some(document.text().as_bytes()))
            .await?;
        if let Some(signal) = result.signal {
            return Err(anyhow!(
                "lint command {} terminated by signal {signal}",
                self.name
            ));
        }

        // Linters conventionally exit non-zero when they have findings, so
        // any exit code with parseable output counts as success.
        let diagnostics: Vec<Diagnostic> = result
            .stdout
            .lines()
            .filter_map(|line| parse_lint_line(line, &self.name))
            .collect();

        self.cache
            .insert(document.uri.clone(), fingerprint, diagnostics.clone());
        Ok(diagnostics)
    }
}

fn parse_lint_line(line: &str, source: &str) -> Option<Diagnostic> {
    let mut parts = line.splitn(4, ':');
    let line_no: u32 = parts.next()?.trim().parse().ok()?;
    let col: u32 = parts.next()?.trim().parse().ok()?;
    let severity = parse_severity(parts.next()?.trim());
    let message = parts.next()?.trim();
    if message.is_empty() {
        return None;
    }

    let position = Position {
        line: line_no.saturating_sub(1),
        character: col.saturating_sub(1),
    };
    Some(Diagnostic {
        range: Range {
            start: position,
            end: position,
        },
        severity: Some(severity),
        source: Some(source.to_string()),
        message: message.to_string(),
        ..Default::default()
    })
}

fn parse_severity(s: &str) -> DiagnosticSeverity {
    match s.to_lowercase().as_str() {
        "error" => DiagnosticSeverity::ERROR,
        "warning" => DiagnosticSeverity::WARNING,
        "information" | "info" => DiagnosticSeverity::INFORMATION,
        "hint" => DiagnosticSeverity::HINT,
        _ => DiagnosticSeverity::WARNING,
    }
}

/// Navigation provider contract: one analysis capability answering a query
/// against the session, independently failing.
#[async_trait]
pub trait SymbolProvider: Send + Sync {
    async fn symbols(&self, query: &str) -> Result<Vec<SymbolInformation>>;
}

/// Word-scan symbol search over open documents and the workspace word
/// index. Open documents are ranked by client activity.
pub struct WordSymbolProvider {
    session: Arc<Session>,
    index: Arc<WorkspaceIndex>,
    word: Regex,
    max_results: usize,
}

impl WordSymbolProvider {
    pub fn new(session: Arc<Session>, index: Arc<WorkspaceIndex>) -> Self {
        Self {
            session,
            index,
            word: Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap(),
            max_results: 200,
        }
    }
}

#[async_trait]
impl SymbolProvider for WordSymbolProvider {
    async fn symbols(&self, query: &str) -> Result<Vec<SymbolInformation>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let query_lower = query.to_lowercase();
        let mut out = Vec::new();

        // Open documents are authoritative; rank them by client activity.
        let mut snapshots = self.session.snapshots().await;
        snapshots.sort_by_key(|s| self.session.activity_score(&s.uri));
        for snapshot in snapshots {
            let text = snapshot.text();
            let mut seen = std::collections::HashSet::new();
            for (line_no, line) in text.lines().enumerate() {
                for m in self.word.find_iter(line) {
                    if !m.as_str().to_lowercase().starts_with(&query_lower) {
                        continue;
                    }
                    if !seen.insert(m.as_str().to_string()) {
                        continue;
                    }
                    out.push(symbol_at(
                        m.as_str(),
                        &snapshot.uri,
                        line_no as u32,
                        utf16_col(line, m.start()),
                    ));
                    if out.len() >= self.max_results {
                        return Ok(out);
                    }
                }
            }
        }

        // Then words indexed from closed workspace files.
        for hit in self.index.find_words(&query_lower, self.max_results - out.len()) {
            out.push(symbol_at(&hit.word, &hit.uri, hit.line, hit.character));
        }

        Ok(out)
    }
}

#[allow(deprecated)]
fn symbol_at(name: &str, uri: &Url, line: u32, character: u32) -> SymbolInformation {
    let position = Position { line, character };
    SymbolInformation {
        name: name.to_string(),
        kind: SymbolKind::KEY,
        tags: None,
        deprecated: None,
        location: Location {
            uri: uri.clone(),
            range: Range {
                start: position,
                end: position,
            },
        },
        container_name: None,
    }
}
