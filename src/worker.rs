//! The Swift language-service worker.
//!
//! All state lives behind a single FIFO lane: a dedicated thread draining a
//! job channel. Every public operation posts a closure onto the lane and
//! awaits its reply, async daemon callbacks re-post onto the same lane, and
//! daemon notifications arrive as lane jobs too. The lane is the
//! serialization point; no internal mutex exists.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tower_lsp_server::ls_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, Command, CompletionItem, Diagnostic,
    DocumentHighlight, DocumentHighlightKind, Documentation, FoldingRange, Hover, HoverContents,
    MarkupContent, MarkupKind, Position, Range, SemanticToken, SemanticTokens,
    TextDocumentContentChangeEvent, TextEdit, Uri, WorkspaceEdit,
};
use tracing::warn;

use crate::diagnostics::{DiagnosticCache, diagnostics_from_response, quick_fix_actions};
use crate::document::{DocumentError, DocumentManager, Snapshot};
use crate::sourcekitd::{
    ServiceError, SkDict, SkNotification, SkValue, SwiftService, Uid, Vocabulary,
};
use crate::translate::{
    self, FoldingOptions, color_presentations, document_colors_from_response,
    document_symbols_from_response, folding_ranges_from_response, hover_markdown,
    semantic_tokens_from_response,
};

/// The LSP command backing refactor code actions.
pub const SEMANTIC_REFACTOR_COMMAND: &str = "swift.semantic.refactor";

/// Worker lifecycle with respect to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Healthy.
    Connected,
    /// The daemon died; in-memory document state has been dropped.
    ConnectionInterrupted,
    /// The daemon restarted; waiting for its semantic warm-up signal.
    SemanticFunctionalityDisabled,
}

/// What the build-settings provider reported for a document.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildSettingsChange {
    /// Settings inferred without the real build system.
    Fallback(BuildSettings),
    Modified(BuildSettings),
    RemovedOrUnavailable,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuildSettings {
    pub compiler_arguments: Vec<String>,
    pub working_directory: Option<String>,
}

/// Compiler arguments as sent to the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileCommand {
    pub argv: Vec<String>,
    pub is_fallback: bool,
}

impl CompileCommand {
    /// `None` means the provider no longer has settings for the document.
    pub fn from_change(change: &BuildSettingsChange) -> Option<Self> {
        let (settings, is_fallback) = match change {
            BuildSettingsChange::Fallback(s) => (s, true),
            BuildSettingsChange::Modified(s) => (s, false),
            BuildSettingsChange::RemovedOrUnavailable => return None,
        };
        let mut argv = settings.compiler_arguments.clone();
        if let Some(dir) = &settings.working_directory
            && !argv.iter().any(|a| a == "-working-directory")
        {
            argv.push("-working-directory".to_string());
            argv.push(dir.clone());
        }
        Some(Self { argv, is_fallback })
    }
}

/// Errors surfaced at the LSP boundary.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Unknown(String),
    #[error("connection to sourcekitd interrupted")]
    ConnectionInterrupted,
}

impl From<ServiceError> for WorkerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Cancelled => WorkerError::Cancelled,
            ServiceError::ConnectionInterrupted => WorkerError::ConnectionInterrupted,
            ServiceError::TimedOut => WorkerError::Unknown("request timed out".to_string()),
            ServiceError::Failed(msg) => WorkerError::Unknown(msg),
            ServiceError::MissingRequiredSymbol(sym) => {
                WorkerError::Unknown(format!("missing symbol {sym}"))
            }
        }
    }
}

/// Subset of cursor-info the `symbolInfo` request exposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolDetails {
    pub name: Option<String>,
    pub usr: Option<String>,
}

/// Arguments round-tripped through the client for the refactor command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticRefactorArgs {
    pub title: String,
    pub uri: String,
    pub line: u32,
    pub character: u32,
    pub action_uid: u64,
}

pub type StateChangeHandler = Box<dyn Fn(WorkerState, WorkerState) + Send>;
/// Publishes `textDocument/publishDiagnostics`.
pub type DiagnosticsPublisher = Box<dyn Fn(Uri, Vec<Diagnostic>, Option<i32>) + Send>;
/// Asks the owning server to re-open every document after a daemon restart.
pub type ReopenCallback = Box<dyn Fn() + Send>;

type Job<S> = Box<dyn FnOnce(&mut WorkerInner<S>) + Send>;

/// Handle to the worker lane. Cheap to clone; dropping every handle shuts
/// the lane thread down.
pub struct SwiftWorker<S: SwiftService> {
    lane: mpsc::UnboundedSender<Job<S>>,
}

impl<S: SwiftService> Clone for SwiftWorker<S> {
    fn clone(&self) -> Self {
        Self {
            lane: self.lane.clone(),
        }
    }
}

struct WorkerInner<S: SwiftService> {
    service: Arc<S>,
    lane: mpsc::UnboundedSender<Job<S>>,
    state: WorkerState,
    documents: DocumentManager,
    diagnostics: DiagnosticCache,
    commands: HashMap<Uri, CompileCommand>,
    state_handlers: Vec<StateChangeHandler>,
    publisher: DiagnosticsPublisher,
    reopener: ReopenCallback,
    excluded_schemes: Vec<String>,
    completion_session: Option<(Uri, Position)>,
    /// Bumped on every interruption; stale async callbacks check it.
    epoch: u64,
    notification_handler: Option<crate::sourcekitd::HandlerId>,
}

impl<S: SwiftService> SwiftWorker<S> {
    pub fn new(
        service: Arc<S>,
        excluded_schemes: Vec<String>,
        publisher: DiagnosticsPublisher,
        reopener: ReopenCallback,
    ) -> Self {
        let (lane, mut jobs) = mpsc::unbounded_channel::<Job<S>>();

        let handler_lane = lane.clone();
        let handler_id = service.add_notification_handler(Arc::new(move |notification| {
            let notification = notification.clone();
            let _ = handler_lane.send(Box::new(move |inner| {
                inner.handle_notification(notification);
            }));
        }));

        let mut inner = WorkerInner {
            service,
            lane: lane.clone(),
            state: WorkerState::Connected,
            documents: DocumentManager::new(),
            diagnostics: DiagnosticCache::new(),
            commands: HashMap::new(),
            state_handlers: Vec::new(),
            publisher,
            reopener,
            excluded_schemes,
            completion_session: None,
            epoch: 0,
            notification_handler: Some(handler_id),
        };

        std::thread::Builder::new()
            .name("swift-worker".to_string())
            .spawn(move || {
                while let Some(job) = jobs.blocking_recv() {
                    job(&mut inner);
                }
            })
            .expect("failed to spawn worker lane thread");

        Self { lane }
    }

    /// Post a job and await its reply.
    async fn run<R, F>(&self, f: F) -> Result<R, WorkerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerInner<S>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |inner| {
            let _ = tx.send(f(inner));
        });
        self.lane
            .send(job)
            .map_err(|_| WorkerError::Unknown("worker lane is gone".to_string()))?;
        rx.await
            .map_err(|_| WorkerError::Unknown("worker lane dropped the reply".to_string()))
    }

    /// Post a job whose reply is produced later (by an async daemon callback
    /// or a join of several lane tasks).
    async fn run_deferred<R, F>(&self, f: F) -> Result<R, WorkerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerInner<S>, oneshot::Sender<R>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |inner| f(inner, tx));
        self.lane
            .send(job)
            .map_err(|_| WorkerError::Unknown("worker lane is gone".to_string()))?;
        rx.await
            .map_err(|_| WorkerError::Unknown("worker lane dropped the reply".to_string()))
    }

    pub async fn add_state_change_handler(&self, handler: StateChangeHandler) {
        let _ = self
            .run(move |inner| inner.state_handlers.push(handler))
            .await;
    }

    pub async fn state(&self) -> Result<WorkerState, WorkerError> {
        self.run(|inner| inner.state).await
    }

    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.run(|inner| {
            if let Some(id) = inner.notification_handler.take() {
                inner.service.remove_notification_handler(id);
            }
            inner.documents = DocumentManager::new();
        })
        .await
    }

    pub async fn open_document(
        &self,
        uri: Uri,
        version: i64,
        text: String,
    ) -> Result<(), WorkerError> {
        self.run(move |inner| inner.open_document(uri, version, text))
            .await?
    }

    pub async fn close_document(&self, uri: Uri) -> Result<(), WorkerError> {
        self.run(move |inner| inner.close_document(&uri)).await?
    }

    pub async fn change_document(
        &self,
        uri: Uri,
        version: i64,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<(), WorkerError> {
        self.run(move |inner| inner.change_document(&uri, version, &changes))
            .await?
    }

    /// willSave/didSave produce no daemon traffic; the daemon re-reads
    /// nothing from disk for open documents.
    pub async fn will_save_document(&self, _uri: Uri) -> Result<(), WorkerError> {
        Ok(())
    }

    pub async fn did_save_document(&self, _uri: Uri) -> Result<(), WorkerError> {
        Ok(())
    }

    pub async fn document_updated_build_settings(
        &self,
        uri: Uri,
        change: BuildSettingsChange,
    ) -> Result<(), WorkerError> {
        self.run(move |inner| inner.build_settings_changed(&uri, &change))
            .await?
    }

    pub async fn document_dependencies_updated(&self, uri: Uri) -> Result<(), WorkerError> {
        self.run(move |inner| inner.reopen_with_current_command(&uri))
            .await?
    }

    pub async fn hover(&self, uri: Uri, position: Position) -> Result<Option<Hover>, WorkerError> {
        self.run(move |inner| inner.hover(&uri, position)).await?
    }

    pub async fn symbol_info(
        &self,
        uri: Uri,
        position: Position,
    ) -> Result<Vec<SymbolDetails>, WorkerError> {
        self.run(move |inner| inner.symbol_info(&uri, position))
            .await?
    }

    /// Definitions are answered from the index by the surrounding server;
    /// the worker never owns this request.
    pub async fn definition(
        &self,
        _uri: Uri,
        _position: Position,
    ) -> Result<Option<()>, WorkerError> {
        Ok(None)
    }

    pub async fn completion(
        &self,
        uri: Uri,
        position: Position,
    ) -> Result<Vec<CompletionItem>, WorkerError> {
        self.run_deferred(move |inner, reply| inner.completion(uri, position, reply))
            .await?
    }

    pub async fn document_symbol_highlight(
        &self,
        uri: Uri,
        position: Position,
    ) -> Result<Vec<DocumentHighlight>, WorkerError> {
        self.run(move |inner| inner.document_highlight(&uri, position))
            .await?
    }

    pub async fn folding_range(
        &self,
        uri: Uri,
        options: FoldingOptions,
    ) -> Result<Vec<FoldingRange>, WorkerError> {
        self.run(move |inner| inner.folding_range(&uri, options))
            .await?
    }

    pub async fn document_symbol(
        &self,
        uri: Uri,
    ) -> Result<Vec<tower_lsp_server::ls_types::DocumentSymbol>, WorkerError> {
        self.run(move |inner| inner.document_symbol(&uri)).await?
    }

    pub async fn document_semantic_tokens(
        &self,
        uri: Uri,
    ) -> Result<SemanticTokens, WorkerError> {
        self.run(move |inner| inner.semantic_tokens(&uri)).await?
    }

    pub async fn document_color(
        &self,
        uri: Uri,
    ) -> Result<Vec<tower_lsp_server::ls_types::ColorInformation>, WorkerError> {
        self.run(move |inner| inner.document_color(&uri)).await?
    }

    pub async fn color_presentation(
        &self,
        color: tower_lsp_server::ls_types::Color,
        range: Range,
    ) -> Result<Vec<tower_lsp_server::ls_types::ColorPresentation>, WorkerError> {
        Ok(color_presentations(&color, range))
    }

    pub async fn code_action(
        &self,
        uri: Uri,
        range: Range,
        only: Option<Vec<CodeActionKind>>,
        client_diagnostics: Vec<Diagnostic>,
    ) -> Result<Vec<CodeActionOrCommand>, WorkerError> {
        self.run_deferred(move |inner, reply| {
            inner.code_action(uri, range, only, client_diagnostics, reply)
        })
        .await?
    }

    /// Runs the semantic refactoring and returns the workspace edit for the
    /// server to apply.
    pub async fn execute_refactor(
        &self,
        args: SemanticRefactorArgs,
    ) -> Result<WorkspaceEdit, WorkerError> {
        self.run(move |inner| inner.execute_refactor(&args)).await?
    }

    /// Queue an open without awaiting the result. The reopen-after-crash
    /// callback runs on the lane itself and must not block on it.
    pub fn post_open_document(&self, uri: Uri, version: i64, text: String) {
        let _ = self.lane.send(Box::new(move |inner: &mut WorkerInner<S>| {
            if let Err(err) = inner.open_document(uri.clone(), version, text) {
                warn!(%err, uri = uri.as_str(), "reopen after interruption failed");
            }
        }));
    }

    /// Test-only: ask the daemon to exit, exercising crash recovery.
    pub async fn crash(&self) -> Result<(), WorkerError> {
        self.run(|inner| {
            let requests = &inner.service.vocabulary().requests;
            let keys = &inner.service.vocabulary().keys;
            let request = SkValue::Dict(
                SkDict::new().with(keys.request, SkValue::Uid(requests.crash_exit)),
            );
            // The daemon dies mid-request; the error is the point.
            if let Err(ServiceError::ConnectionInterrupted) = inner.service.send_sync(request) {
                inner.handle_interruption();
            }
        })
        .await
    }
}

impl<S: SwiftService> WorkerInner<S> {
    fn vocabulary(&self) -> &Vocabulary {
        self.service.vocabulary()
    }

    fn is_excluded(&self, uri: &Uri) -> bool {
        scheme_of(uri).is_some_and(|scheme| self.excluded_schemes.iter().any(|s| s == scheme))
    }

    // ---- state machine ----

    fn transition(&mut self, new: WorkerState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        warn!(?old, ?new, "sourcekitd state transition");
        for handler in &self.state_handlers {
            handler(old, new);
        }
    }

    /// The daemon died. Drop per-document daemon state; the server re-opens
    /// documents once the daemon is back.
    fn handle_interruption(&mut self) {
        if self.state != WorkerState::ConnectionInterrupted {
            self.epoch += 1;
            self.documents = DocumentManager::new();
            self.completion_session = None;
            self.transition(WorkerState::ConnectionInterrupted);
        }
    }

    fn handle_notification(&mut self, notification: SkNotification) {
        let state = self.state;
        match (state, &notification) {
            (_, SkNotification::ConnectionInterrupted) => {
                self.handle_interruption();
                return;
            }
            (WorkerState::ConnectionInterrupted, SkNotification::Payload(_)) => {
                // Any traffic at all means the daemon restarted.
                self.transition(WorkerState::SemanticFunctionalityDisabled);
                (self.reopener)();
            }
            (WorkerState::SemanticFunctionalityDisabled, SkNotification::Payload(value)) => {
                let vocab = self.vocabulary();
                if payload_kind(value, vocab) == Some(vocab.values.notif_sema_enabled) {
                    self.transition(WorkerState::Connected);
                }
            }
            _ => {}
        }

        if let SkNotification::Payload(value) = &notification {
            let vocab = self.vocabulary();
            if payload_kind(value, vocab) == Some(vocab.values.notif_documentupdate)
                && let Some(name) = value
                    .as_dict()
                    .and_then(|d| d.string(vocab.keys.name))
                && let Some(uri) = uri_from_daemon_name(name)
            {
                if let Err(err) = self.synthetic_refresh(&uri) {
                    warn!(%err, uri = uri.as_str(), "document refresh failed");
                }
            }
        }
    }

    // ---- document lifecycle ----

    fn open_document(&mut self, uri: Uri, version: i64, text: String) -> Result<(), WorkerError> {
        let snapshot = self.documents.open(uri.clone(), version, text.clone());
        let response = self.send_editor_open(&uri, &text)?;
        self.publish_from_response(&uri, &snapshot, &response);
        Ok(())
    }

    fn close_document(&mut self, uri: &Uri) -> Result<(), WorkerError> {
        let vocab = self.vocabulary();
        let request = SkValue::Dict(
            SkDict::new()
                .with(vocab.keys.request, SkValue::Uid(vocab.requests.editor_close))
                .with(vocab.keys.name, SkValue::String(pseudo_path(uri))),
        );
        let result = self.send_checked(request);

        self.documents.close(uri);
        self.diagnostics.clear(uri);
        self.commands.remove(uri);
        if self
            .completion_session
            .as_ref()
            .is_some_and(|(session_uri, _)| session_uri == uri)
        {
            self.completion_session = None;
        }
        if !self.is_excluded(uri) {
            (self.publisher)(uri.clone(), Vec::new(), None);
        }
        result.map(|_| ())
    }

    fn change_document(
        &mut self,
        uri: &Uri,
        version: i64,
        changes: &[TextDocumentContentChangeEvent],
    ) -> Result<(), WorkerError> {
        let vocab = self.vocabulary().clone();
        let service = Arc::clone(&self.service);
        let mut last_response: Option<ServiceResultValue> = None;

        let edited = self.documents.edit(uri, version, changes, |before, edit| {
            let request = SkValue::Dict(
                SkDict::new()
                    .with(
                        vocab.keys.request,
                        SkValue::Uid(vocab.requests.editor_replacetext),
                    )
                    .with(vocab.keys.name, SkValue::String(pseudo_path(&before.uri)))
                    .with(vocab.keys.offset, SkValue::Int(edit.utf8_offset as i64))
                    .with(vocab.keys.length, SkValue::Int(edit.utf8_length as i64))
                    .with(vocab.keys.sourcetext, SkValue::String(edit.text.to_string())),
            );
            last_response = Some(service.send_sync(request));
        });

        let snapshot = match edited {
            Ok(snapshot) => snapshot,
            Err(DocumentError::NotOpen { uri }) => {
                warn!(uri, "change for a document that is not open");
                return Ok(());
            }
            Err(err @ DocumentError::InvalidRange { .. }) => {
                return Err(WorkerError::InvalidRequest(err.to_string()));
            }
        };

        match last_response {
            Some(Ok(response)) => {
                self.publish_from_response(uri, &snapshot, &response);
                Ok(())
            }
            Some(Err(err)) => Err(self.service_error(err)),
            // Empty change list: nothing to mirror, nothing to publish.
            None => Ok(()),
        }
    }

    fn build_settings_changed(
        &mut self,
        uri: &Uri,
        change: &BuildSettingsChange,
    ) -> Result<(), WorkerError> {
        let new_command = CompileCommand::from_change(change);
        if self.commands.get(uri) == new_command.as_ref() {
            // Identical settings must not trigger a reopen.
            return Ok(());
        }
        match new_command {
            Some(command) => {
                self.commands.insert(uri.clone(), command);
            }
            None => {
                self.commands.remove(uri);
            }
        }
        if self.documents.latest_snapshot(uri).is_none() {
            // The command applies on the next open.
            return Ok(());
        }
        self.reopen_with_current_command(uri)
    }

    /// Close and re-open the daemon session so the AST is rebuilt with the
    /// current compile command.
    fn reopen_with_current_command(&mut self, uri: &Uri) -> Result<(), WorkerError> {
        let Some(snapshot) = self.documents.latest_snapshot(uri) else {
            warn!(uri = uri.as_str(), "reopen requested for unknown document");
            return Ok(());
        };
        let vocab = self.vocabulary();
        let close = SkValue::Dict(
            SkDict::new()
                .with(vocab.keys.request, SkValue::Uid(vocab.requests.editor_close))
                .with(vocab.keys.name, SkValue::String(pseudo_path(uri))),
        );
        self.send_checked(close)?;
        let text = snapshot.text().to_string();
        let response = self.send_editor_open(uri, &text)?;
        self.publish_from_response(uri, &snapshot, &response);
        Ok(())
    }

    /// Zero-length replacetext at offset 0: the idiomatic way to ask the
    /// daemon for fresh diagnostics.
    fn synthetic_refresh(&mut self, uri: &Uri) -> Result<(), WorkerError> {
        let Some(snapshot) = self.documents.latest_snapshot(uri) else {
            return Ok(());
        };
        let vocab = self.vocabulary();
        let request = SkValue::Dict(
            SkDict::new()
                .with(
                    vocab.keys.request,
                    SkValue::Uid(vocab.requests.editor_replacetext),
                )
                .with(vocab.keys.name, SkValue::String(pseudo_path(uri)))
                .with(vocab.keys.offset, SkValue::Int(0))
                .with(vocab.keys.length, SkValue::Int(0))
                .with(vocab.keys.sourcetext, SkValue::String(String::new())),
        );
        let response = self.send_checked(request)?;
        self.publish_from_response(uri, &snapshot, &response);
        Ok(())
    }

    fn send_editor_open(&mut self, uri: &Uri, text: &str) -> Result<SkValue, WorkerError> {
        let vocab = self.vocabulary();
        let mut dict = SkDict::new()
            .with(vocab.keys.request, SkValue::Uid(vocab.requests.editor_open))
            .with(vocab.keys.name, SkValue::String(pseudo_path(uri)))
            .with(vocab.keys.sourcetext, SkValue::String(text.to_string()));
        if let Some(command) = self.commands.get(uri) {
            dict.set(
                vocab.keys.compilerargs,
                SkValue::Array(
                    command
                        .argv
                        .iter()
                        .map(|a| SkValue::String(a.clone()))
                        .collect(),
                ),
            );
        }
        self.send_checked(SkValue::Dict(dict))
    }

    /// Open a parallel syntactic-only session, run `f` over the response,
    /// and close the session again.
    fn with_syntactic_open<R>(
        &mut self,
        uri: &Uri,
        enable_syntaxmap: bool,
        f: impl FnOnce(&SkDict, &Vocabulary, &Snapshot) -> R,
    ) -> Result<Option<R>, WorkerError> {
        let Some(snapshot) = self.documents.latest_snapshot(uri) else {
            warn!(uri = uri.as_str(), "request against unopened document");
            return Ok(None);
        };
        let vocab = self.vocabulary().clone();
        let name = format!("{}::syntactic", pseudo_path(uri));
        let open = SkValue::Dict(
            SkDict::new()
                .with(vocab.keys.request, SkValue::Uid(vocab.requests.editor_open))
                .with(vocab.keys.name, SkValue::String(name.clone()))
                .with(
                    vocab.keys.sourcetext,
                    SkValue::String(snapshot.text().to_string()),
                )
                .with(vocab.keys.syntactic_only, SkValue::Int(1))
                .with(
                    vocab.keys.enablesyntaxmap,
                    SkValue::Int(i64::from(enable_syntaxmap)),
                )
                .with(vocab.keys.enablesubstructure, SkValue::Int(1)),
        );
        let response = self.send_checked(open)?;
        let result = response
            .as_dict()
            .map(|dict| f(dict, &vocab, &snapshot));

        let close = SkValue::Dict(
            SkDict::new()
                .with(vocab.keys.request, SkValue::Uid(vocab.requests.editor_close))
                .with(vocab.keys.name, SkValue::String(name)),
        );
        self.send_checked(close)?;
        Ok(result)
    }

    // ---- feature requests ----

    fn cursor_info(
        &mut self,
        uri: &Uri,
        position: Position,
        retrieve_refactor_actions: bool,
    ) -> Result<Option<SkValue>, WorkerError> {
        let Some(snapshot) = self.documents.latest_snapshot(uri) else {
            warn!(uri = uri.as_str(), "cursor info for unopened document");
            return Ok(None);
        };
        let Some(offset) = snapshot
            .table()
            .utf8_offset_of(position.line, position.character)
        else {
            return Ok(None);
        };
        let vocab = self.vocabulary();
        let mut dict = SkDict::new()
            .with(vocab.keys.request, SkValue::Uid(vocab.requests.cursorinfo))
            .with(vocab.keys.sourcefile, SkValue::String(pseudo_path(uri)))
            .with(vocab.keys.offset, SkValue::Int(offset as i64))
            .with(vocab.keys.length, SkValue::Int(0));
        if retrieve_refactor_actions {
            dict.set(vocab.keys.retrieve_refactor_actions, SkValue::Int(1));
        }
        if let Some(command) = self.commands.get(uri) {
            dict.set(
                vocab.keys.compilerargs,
                SkValue::Array(
                    command
                        .argv
                        .iter()
                        .map(|a| SkValue::String(a.clone()))
                        .collect(),
                ),
            );
        }
        self.send_checked(SkValue::Dict(dict)).map(Some)
    }

    fn hover(&mut self, uri: &Uri, position: Position) -> Result<Option<Hover>, WorkerError> {
        let Some(response) = self.cursor_info(uri, position, false)? else {
            return Ok(None);
        };
        let vocab = self.vocabulary();
        let Some(dict) = response.as_dict() else {
            return Ok(None);
        };
        let Some(name) = dict.string(vocab.keys.name) else {
            return Ok(None);
        };
        let value = hover_markdown(
            name,
            dict.string(vocab.keys.doc_full_as_xml),
            dict.string(vocab.keys.annotated_decl),
        );
        Ok(Some(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value,
            }),
            range: None,
        }))
    }

    fn symbol_info(
        &mut self,
        uri: &Uri,
        position: Position,
    ) -> Result<Vec<SymbolDetails>, WorkerError> {
        let Some(response) = self.cursor_info(uri, position, false)? else {
            return Ok(Vec::new());
        };
        let vocab = self.vocabulary();
        let Some(dict) = response.as_dict() else {
            return Ok(Vec::new());
        };
        if dict.string(vocab.keys.name).is_none() && dict.string(vocab.keys.usr).is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![SymbolDetails {
            name: dict.string(vocab.keys.name).map(str::to_string),
            usr: dict.string(vocab.keys.usr).map(str::to_string),
        }])
    }

    fn document_highlight(
        &mut self,
        uri: &Uri,
        position: Position,
    ) -> Result<Vec<DocumentHighlight>, WorkerError> {
        let Some(snapshot) = self.documents.latest_snapshot(uri) else {
            warn!(uri = uri.as_str(), "highlight for unopened document");
            return Ok(Vec::new());
        };
        let Some(offset) = snapshot
            .table()
            .utf8_offset_of(position.line, position.character)
        else {
            return Ok(Vec::new());
        };
        let vocab = self.vocabulary();
        let mut dict = SkDict::new()
            .with(
                vocab.keys.request,
                SkValue::Uid(vocab.requests.relatedidents),
            )
            .with(vocab.keys.sourcefile, SkValue::String(pseudo_path(uri)))
            .with(vocab.keys.offset, SkValue::Int(offset as i64));
        if let Some(command) = self.commands.get(uri) {
            dict.set(
                vocab.keys.compilerargs,
                SkValue::Array(
                    command
                        .argv
                        .iter()
                        .map(|a| SkValue::String(a.clone()))
                        .collect(),
                ),
            );
        }
        let response = self.send_checked(SkValue::Dict(dict))?;
        let vocab = self.vocabulary();

        let mut highlights = Vec::new();
        if let Some(results) = response.as_dict().and_then(|d| d.array(vocab.keys.results)) {
            for result in results {
                let Some(result) = result.as_dict() else { continue };
                let (Some(offset), Some(length)) = (
                    result.int(vocab.keys.offset),
                    result.int(vocab.keys.length),
                ) else {
                    continue;
                };
                let Some(range) = crate::diagnostics::range_from_span(
                    snapshot.table(),
                    offset as usize,
                    length as usize,
                ) else {
                    continue;
                };
                highlights.push(DocumentHighlight {
                    range,
                    // The daemon does not distinguish reads from writes.
                    kind: Some(DocumentHighlightKind::READ),
                });
            }
        }
        Ok(highlights)
    }

    fn folding_range(
        &mut self,
        uri: &Uri,
        options: FoldingOptions,
    ) -> Result<Vec<FoldingRange>, WorkerError> {
        Ok(self
            .with_syntactic_open(uri, true, |dict, vocab, snapshot| {
                folding_ranges_from_response(dict, vocab, snapshot.table(), options)
            })?
            .unwrap_or_default())
    }

    fn document_symbol(
        &mut self,
        uri: &Uri,
    ) -> Result<Vec<tower_lsp_server::ls_types::DocumentSymbol>, WorkerError> {
        Ok(self
            .with_syntactic_open(uri, false, |dict, vocab, snapshot| {
                document_symbols_from_response(dict, vocab, snapshot.table())
            })?
            .unwrap_or_default())
    }

    fn semantic_tokens(&mut self, uri: &Uri) -> Result<SemanticTokens, WorkerError> {
        let data: Vec<SemanticToken> = self
            .with_syntactic_open(uri, true, |dict, vocab, snapshot| {
                semantic_tokens_from_response(dict, vocab, snapshot.table())
            })?
            .unwrap_or_default();
        Ok(SemanticTokens {
            result_id: None,
            data,
        })
    }

    fn document_color(
        &mut self,
        uri: &Uri,
    ) -> Result<Vec<tower_lsp_server::ls_types::ColorInformation>, WorkerError> {
        Ok(self
            .with_syntactic_open(uri, false, |dict, vocab, snapshot| {
                document_colors_from_response(dict, vocab, snapshot.table())
            })?
            .unwrap_or_default())
    }

    fn completion(
        &mut self,
        uri: Uri,
        position: Position,
        reply: oneshot::Sender<Result<Vec<CompletionItem>, WorkerError>>,
    ) {
        let Some(snapshot) = self.documents.latest_snapshot(&uri) else {
            warn!(uri = uri.as_str(), "completion for unopened document");
            let _ = reply.send(Ok(Vec::new()));
            return;
        };
        let Some(offset) = snapshot
            .table()
            .utf8_offset_of(position.line, position.character)
        else {
            let _ = reply.send(Ok(Vec::new()));
            return;
        };

        // One session per worker: a new request supersedes the previous one.
        self.completion_session = Some((uri.clone(), position));

        let vocab = self.vocabulary().clone();
        let mut dict = SkDict::new()
            .with(vocab.keys.request, SkValue::Uid(vocab.requests.codecomplete))
            .with(vocab.keys.name, SkValue::String(pseudo_path(&uri)))
            .with(
                vocab.keys.sourcetext,
                SkValue::String(snapshot.text().to_string()),
            )
            .with(vocab.keys.offset, SkValue::Int(offset as i64));
        if let Some(command) = self.commands.get(&uri) {
            dict.set(
                vocab.keys.compilerargs,
                SkValue::Array(
                    command
                        .argv
                        .iter()
                        .map(|a| SkValue::String(a.clone()))
                        .collect(),
                ),
            );
        }

        let lane = self.lane.clone();
        let epoch = self.epoch;
        self.service.send_async(
            SkValue::Dict(dict),
            Box::new(move |result| {
                let _ = lane.send(Box::new(move |inner: &mut WorkerInner<S>| {
                    if inner.epoch != epoch {
                        // The daemon restarted underneath this request.
                        let _ = reply.send(Err(WorkerError::Cancelled));
                        return;
                    }
                    let reply_value = match result {
                        Ok(response) => Ok(inner.completion_items(&response)),
                        Err(err) => Err(inner.service_error(err)),
                    };
                    let _ = reply.send(reply_value);
                }));
            }),
        );
    }

    fn completion_items(&self, response: &SkValue) -> Vec<CompletionItem> {
        let vocab = self.vocabulary();
        let mut items = Vec::new();
        let Some(results) = response.as_dict().and_then(|d| d.array(vocab.keys.results)) else {
            return items;
        };
        for result in results {
            let Some(result) = result.as_dict() else { continue };
            let Some(label) = result.string(vocab.keys.description) else {
                continue;
            };
            items.push(CompletionItem {
                label: label.to_string(),
                kind: result
                    .uid(vocab.keys.kind)
                    .and_then(|kind| translate::completion_item_kind(kind, &vocab.values)),
                detail: result.string(vocab.keys.typename).map(str::to_string),
                documentation: result
                    .string(vocab.keys.doc_brief)
                    .map(|doc| Documentation::String(doc.to_string())),
                insert_text: result.string(vocab.keys.sourcetext).map(str::to_string),
                ..Default::default()
            });
        }
        items
    }

    /// Both providers run as their own lane tasks; a shared join cell fires
    /// the reply when the second one finishes.
    fn code_action(
        &mut self,
        uri: Uri,
        range: Range,
        only: Option<Vec<CodeActionKind>>,
        client_diagnostics: Vec<Diagnostic>,
        reply: oneshot::Sender<Result<Vec<CodeActionOrCommand>, WorkerError>>,
    ) {
        let wants = |kind: &CodeActionKind| {
            only.as_ref()
                .is_none_or(|kinds| kinds.iter().any(|k| kind.as_str().starts_with(k.as_str())))
        };
        let want_refactor = wants(&CodeActionKind::REFACTOR);
        let want_quickfix = wants(&CodeActionKind::QUICKFIX);

        let join = Arc::new(std::sync::Mutex::new(JoinState {
            refactor: (!want_refactor).then(Vec::new),
            quickfix: (!want_quickfix).then(Vec::new),
            reply: Some(reply),
        }));

        if want_refactor {
            let join = Arc::clone(&join);
            let uri = uri.clone();
            let _ = self.lane.send(Box::new(move |inner: &mut WorkerInner<S>| {
                let actions = inner.refactor_actions(&uri, range).unwrap_or_default();
                JoinState::complete(&join, |state| state.refactor = Some(actions));
            }));
        }
        if want_quickfix {
            let join = Arc::clone(&join);
            let _ = self.lane.send(Box::new(move |inner: &mut WorkerInner<S>| {
                let actions = quick_fix_actions(
                    &uri,
                    inner.diagnostics.get(&uri),
                    &range,
                    &client_diagnostics,
                );
                JoinState::complete(&join, |state| state.quickfix = Some(actions));
            }));
        }
        JoinState::complete(&join, |_| {});
    }

    fn refactor_actions(&mut self, uri: &Uri, range: Range) -> Result<Vec<CodeAction>, WorkerError> {
        let Some(response) = self.cursor_info(uri, range.start, true)? else {
            return Ok(Vec::new());
        };
        let vocab = self.vocabulary();
        let mut actions = Vec::new();
        let Some(available) = response
            .as_dict()
            .and_then(|d| d.array(vocab.keys.refactor_actions))
        else {
            return Ok(actions);
        };
        for action in available {
            let Some(action) = action.as_dict() else { continue };
            let (Some(title), Some(action_uid)) = (
                action.string(vocab.keys.actionname),
                action.uid(vocab.keys.actionuid),
            ) else {
                continue;
            };
            let args = SemanticRefactorArgs {
                title: title.to_string(),
                uri: uri.as_str().to_string(),
                line: range.start.line,
                character: range.start.character,
                action_uid: action_uid.0,
            };
            let Ok(arguments) = serde_json::to_value(&args) else {
                continue;
            };
            actions.push(CodeAction {
                title: title.to_string(),
                kind: Some(CodeActionKind::REFACTOR),
                command: Some(Command {
                    title: title.to_string(),
                    command: SEMANTIC_REFACTOR_COMMAND.to_string(),
                    arguments: Some(vec![arguments]),
                }),
                ..Default::default()
            });
        }
        Ok(actions)
    }

    fn execute_refactor(&mut self, args: &SemanticRefactorArgs) -> Result<WorkspaceEdit, WorkerError> {
        let uri = Uri::from_str(&args.uri)
            .map_err(|_| WorkerError::InvalidRequest(format!("bad uri {}", args.uri)))?;
        let Some(snapshot) = self.documents.latest_snapshot(&uri) else {
            return Err(WorkerError::NotFound(format!(
                "document not open: {}",
                args.uri
            )));
        };
        // The daemon counts 1-based UTF-8 columns.
        let table = snapshot.table();
        let (line_start, cursor) = match (
            table.utf8_offset_of(args.line, 0),
            table.utf8_offset_of(args.line, args.character),
        ) {
            (Some(start), Some(cursor)) => (start, cursor),
            _ => {
                return Err(WorkerError::InvalidRequest(format!(
                    "position {}:{} is outside the document",
                    args.line, args.character
                )));
            }
        };
        let vocab = self.vocabulary();
        let mut dict = SkDict::new()
            .with(
                vocab.keys.request,
                SkValue::Uid(vocab.requests.semantic_refactoring),
            )
            .with(vocab.keys.sourcefile, SkValue::String(pseudo_path(&uri)))
            .with(vocab.keys.actionuid, SkValue::Uid(Uid(args.action_uid)))
            .with(vocab.keys.line, SkValue::Int(i64::from(args.line) + 1))
            .with(
                vocab.keys.column,
                SkValue::Int((cursor - line_start) as i64 + 1),
            );
        if let Some(command) = self.commands.get(&uri) {
            dict.set(
                vocab.keys.compilerargs,
                SkValue::Array(
                    command
                        .argv
                        .iter()
                        .map(|a| SkValue::String(a.clone()))
                        .collect(),
                ),
            );
        }
        let response = self.send_checked(SkValue::Dict(dict))?;
        let vocab = self.vocabulary();

        let mut edits: Vec<TextEdit> = Vec::new();
        if let Some(categories) = response
            .as_dict()
            .and_then(|d| d.array(vocab.keys.categorizededits))
        {
            for category in categories {
                let Some(list) = category.as_dict().and_then(|c| c.array(vocab.keys.edits))
                else {
                    continue;
                };
                for edit in list {
                    let Some(edit) = edit.as_dict() else { continue };
                    let Some(range) = edit_range(edit, vocab, &snapshot) else {
                        continue;
                    };
                    edits.push(TextEdit {
                        range,
                        new_text: edit
                            .string(vocab.keys.text)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }
        let changes = HashMap::from([(uri, edits)]);
        Ok(WorkspaceEdit {
            changes: Some(changes),
            ..Default::default()
        })
    }

    // ---- plumbing ----

    /// Send, routing a connection interruption into the state machine.
    fn send_checked(&mut self, request: SkValue) -> Result<SkValue, WorkerError> {
        match self.service.send_sync(request) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.service_error(err)),
        }
    }

    fn service_error(&mut self, err: ServiceError) -> WorkerError {
        if matches!(err, ServiceError::ConnectionInterrupted) {
            self.handle_interruption();
        }
        err.into()
    }

    fn publish_from_response(&mut self, uri: &Uri, snapshot: &Snapshot, response: &SkValue) {
        if self.is_excluded(uri) {
            return;
        }
        let Some(dict) = response.as_dict() else { return };
        let vocab = self.vocabulary().clone();
        let is_fallback = self
            .commands
            .get(uri)
            .map(|command| command.is_fallback)
            .unwrap_or(true);
        let (stage, new) = diagnostics_from_response(dict, &vocab, snapshot.table(), is_fallback);
        let merged = self.diagnostics.merge(uri, stage, is_fallback, new);
        (self.publisher)(uri.clone(), merged, Some(snapshot.version as i32));
    }
}

type ServiceResultValue = Result<SkValue, ServiceError>;

struct JoinState {
    refactor: Option<Vec<CodeAction>>,
    quickfix: Option<Vec<CodeAction>>,
    reply: Option<oneshot::Sender<Result<Vec<CodeActionOrCommand>, WorkerError>>>,
}

impl JoinState {
    fn complete(join: &Arc<std::sync::Mutex<JoinState>>, fill: impl FnOnce(&mut JoinState)) {
        let mut guard = join.lock().unwrap_or_else(|e| e.into_inner());
        fill(&mut guard);
        let state = &mut *guard;
        if let (Some(refactor), Some(quickfix)) = (&state.refactor, &state.quickfix)
            && let Some(reply) = state.reply.take()
        {
            let mut joined: Vec<CodeActionOrCommand> = Vec::new();
            joined.extend(quickfix.iter().cloned().map(CodeActionOrCommand::CodeAction));
            joined.extend(refactor.iter().cloned().map(CodeActionOrCommand::CodeAction));
            let _ = reply.send(Ok(joined));
        }
    }
}

/// The daemon's stable file handle for a document: the filesystem path for
/// `file://` URIs, a synthesized `scheme:rest` tag otherwise.
pub fn pseudo_path(uri: &Uri) -> String {
    if scheme_of(uri) == Some("file")
        && let Some(path) = uri.to_file_path()
    {
        return path.display().to_string();
    }
    uri.as_str().to_string()
}

pub fn scheme_of(uri: &Uri) -> Option<&str> {
    uri.as_str().split_once(':').map(|(scheme, _)| scheme)
}

/// `documentupdate` names a document either by filesystem path or by URI.
fn uri_from_daemon_name(name: &str) -> Option<Uri> {
    if name.starts_with('/') {
        Uri::from_str(&format!("file://{name}")).ok()
    } else {
        Uri::from_str(name).ok()
    }
}

fn payload_kind(value: &SkValue, vocab: &Vocabulary) -> Option<Uid> {
    value.as_dict()?.uid(vocab.keys.notification)
}

fn edit_range(edit: &SkDict, vocab: &Vocabulary, snapshot: &Snapshot) -> Option<Range> {
    let table = snapshot.table();
    let start_line = edit.int(vocab.keys.line)?.checked_sub(1)? as u32;
    let start_col = table.utf16_col_of(start_line, edit.int(vocab.keys.column)?.checked_sub(1)? as usize)?;
    let end_line = edit.int(vocab.keys.endline)?.checked_sub(1)? as u32;
    let end_col = table.utf16_col_of(end_line, edit.int(vocab.keys.endcolumn)?.checked_sub(1)? as usize)?;
    Some(Range::new(
        Position::new(start_line, start_col),
        Position::new(end_line, end_col),
    ))
}
