use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tower_lsp_server::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp_server::ls_types::request::{GotoImplementationParams, GotoImplementationResponse};
use tower_lsp_server::ls_types::*;
use tower_lsp_server::{Client, LanguageServer, LspService, Server};

use crate::config::{Config, resolve_dylib_path};
use crate::document::DocumentManager;
use crate::dylib::{SourcekitdClient, shared_client};
use crate::sourcekitd::{ServiceError, SwiftService};
use crate::translate::{self, FoldingOptions};
use crate::worker::{
    BuildSettings, BuildSettingsChange, SEMANTIC_REFACTOR_COMMAND, SemanticRefactorArgs,
    SwiftWorker, SymbolDetails, WorkerError,
};

/// Produces the compiler-service connection once `initialize` has merged the
/// CLI flags with the client's initialization options.
type ServiceSource<S> =
    Box<dyn FnOnce(&Config) -> std::result::Result<Arc<S>, ServiceError> + Send>;

/// LSP server backend.
///
/// Owns the coordinator-side document store (the worker drops its own copy
/// when the daemon crashes, and re-opens are driven from here) and routes
/// every request into the worker lane.
pub struct Backend<S: SwiftService> {
    client: Client,
    /// Coordinator's view of open documents, used to re-open after a crash.
    documents: Arc<Mutex<DocumentManager>>,
    worker: Arc<OnceLock<SwiftWorker<S>>>,
    service_source: Mutex<Option<ServiceSource<S>>>,
    folding: Mutex<FoldingOptions>,
    /// Whether the client accepts `CodeAction` literals (LSP 3.8 extension).
    /// Older clients only understand bare commands.
    action_literals: Mutex<bool>,
}

impl Backend<SourcekitdClient> {
    /// Production wiring: load sourcekitd via the dylib registry.
    pub fn new(client: Client, sourcekitd: Option<PathBuf>) -> Self {
        Self::with_service_source(
            client,
            Box::new(move |config: &Config| {
                let explicit = sourcekitd.as_deref().or(config.sourcekitd.as_deref());
                let path = resolve_dylib_path(explicit)
                    .map_err(|e| ServiceError::Failed(e.to_string()))?;
                shared_client(&path)
            }),
        )
    }
}

impl<S: SwiftService> Backend<S> {
    /// Test wiring: hand the backend an already-built service.
    pub fn with_service(client: Client, service: Arc<S>) -> Self {
        Self::with_service_source(client, Box::new(move |_| Ok(service)))
    }

    fn with_service_source(client: Client, source: ServiceSource<S>) -> Self {
        Self {
            client,
            documents: Arc::new(Mutex::new(DocumentManager::new())),
            worker: Arc::new(OnceLock::new()),
            service_source: Mutex::new(Some(source)),
            folding: Mutex::new(FoldingOptions::default()),
            action_literals: Mutex::new(true),
        }
    }

    pub fn worker(&self) -> Result<&SwiftWorker<S>> {
        self.worker
            .get()
            .ok_or_else(|| Error::new(ErrorCode::ServerError(-32002)))
    }

    fn build_worker(&self, service: Arc<S>, config: &Config) -> SwiftWorker<S> {
        let handle = tokio::runtime::Handle::current();

        let publish_client = self.client.clone();
        let publish_handle = handle.clone();
        let publisher = Box::new(move |uri: Uri, diagnostics: Vec<Diagnostic>, version| {
            let client = publish_client.clone();
            publish_handle.spawn(async move {
                client.publish_diagnostics(uri, diagnostics, version).await;
            });
        });

        let reopen_documents = Arc::clone(&self.documents);
        let reopen_worker = Arc::clone(&self.worker);
        let reopener = Box::new(move || {
            let Some(worker) = reopen_worker.get() else {
                return;
            };
            let snapshots: Vec<_> = {
                let documents = reopen_documents.lock().unwrap_or_else(|e| e.into_inner());
                documents
                    .open_uris()
                    .filter_map(|uri| documents.latest_snapshot(uri))
                    .collect()
            };
            for snapshot in snapshots {
                worker.post_open_document(
                    snapshot.uri.clone(),
                    snapshot.version,
                    snapshot.text().to_string(),
                );
            }
        });

        SwiftWorker::new(service, config.excluded_schemes.clone(), publisher, reopener)
    }

    /// The built-in build-settings provider: nothing consults a real build
    /// system here, so every document gets fallback arguments.
    fn fallback_settings(&self, uri: &Uri) -> BuildSettingsChange {
        BuildSettingsChange::Fallback(BuildSettings {
            compiler_arguments: vec![crate::worker::pseudo_path(uri)],
            working_directory: None,
        })
    }

    // Exposed as the custom `textDocument/symbolInfo` request.
    async fn symbol_info(&self, params: TextDocumentPositionParams) -> Result<Vec<SymbolDetails>> {
        let worker = self.worker()?;
        worker
            .symbol_info(params.text_document.uri, params.position)
            .await
            .or_else(empty_on_interrupt(Vec::new()))
    }

    // Exposed as the test-only `$/crash` request.
    async fn crash(&self) -> Result<()> {
        self.worker()?.crash().await.map_err(rpc_error)
    }

    async fn log_worker_error(&self, operation: &str, err: &WorkerError) {
        self.client
            .log_message(
                MessageType::WARNING,
                format!("swiftls: {operation} failed: {err}"),
            )
            .await;
    }
}

impl<S: SwiftService> std::fmt::Debug for Backend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish()
    }
}

impl<S: SwiftService> LanguageServer for Backend<S> {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let config = Config::from_initialization_options(params.initialization_options.as_ref())
            .map_err(|e| Error::invalid_params(e.to_string()))?;

        // Honor the client's folding preferences for the whole session.
        if let Some(folding) = params
            .capabilities
            .text_document
            .as_ref()
            .and_then(|t| t.folding_range.as_ref())
        {
            let mut options = self.folding.lock().unwrap_or_else(|e| e.into_inner());
            options.line_folding_only = folding.line_folding_only.unwrap_or(false);
            options.range_limit = folding.range_limit.map(|limit| limit as usize);
        }

        let literal_support = params
            .capabilities
            .text_document
            .as_ref()
            .and_then(|t| t.code_action.as_ref())
            .and_then(|c| c.code_action_literal_support.as_ref())
            .is_some();
        *self
            .action_literals
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = literal_support;

        let source = self
            .service_source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::new(ErrorCode::InvalidRequest))?;
        let service = source(&config).map_err(|e| Error {
            code: ErrorCode::InternalError,
            message: format!("failed to connect to sourcekitd: {e}").into(),
            data: None,
        })?;
        let _ = self.worker.set(self.build_worker(service, &config));

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "swiftls".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            offset_encoding: None,
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        will_save: Some(true),
                        will_save_wait_until: Some(false),
                        save: None,
                    },
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![".".to_string()]),
                    ..Default::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                implementation_provider: Some(ImplementationProviderCapability::Simple(true)),
                document_highlight_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                code_action_provider: Some(CodeActionProviderCapability::Options(
                    CodeActionOptions {
                        code_action_kinds: Some(vec![
                            CodeActionKind::QUICKFIX,
                            CodeActionKind::REFACTOR,
                        ]),
                        ..Default::default()
                    },
                )),
                color_provider: Some(ColorProviderCapability::Simple(true)),
                folding_range_provider: Some(FoldingRangeProviderCapability::Simple(true)),
                semantic_tokens_provider: Some(
                    SemanticTokensServerCapabilities::SemanticTokensOptions(
                        SemanticTokensOptions {
                            legend: SemanticTokensLegend {
                                token_types: translate::TOKEN_TYPES.to_vec(),
                                token_modifiers: Vec::new(),
                            },
                            full: Some(SemanticTokensFullOptions::Bool(true)),
                            ..Default::default()
                        },
                    ),
                ),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: vec![SEMANTIC_REFACTOR_COMMAND.to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "swiftls: sourcekitd connected")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(worker) = self.worker.get() {
            worker.shutdown().await.map_err(rpc_error)?;
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = i64::from(params.text_document.version);
        let text = params.text_document.text;

        {
            let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
            documents.open(uri.clone(), version, text.clone());
        }

        let Ok(worker) = self.worker() else { return };
        let settings = self.fallback_settings(&uri);
        if let Err(e) = worker
            .document_updated_build_settings(uri.clone(), settings)
            .await
        {
            self.log_worker_error("build settings", &e).await;
        }
        if let Err(e) = worker.open_document(uri, version, text).await {
            self.log_worker_error("open", &e).await;
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = i64::from(params.text_document.version);

        {
            let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
            let _ = documents.edit(&uri, version, &params.content_changes, |_, _| {});
        }

        let Ok(worker) = self.worker() else { return };
        if let Err(e) = worker
            .change_document(uri, version, params.content_changes)
            .await
        {
            self.log_worker_error("change", &e).await;
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        {
            let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
            documents.close(&uri);
        }
        let Ok(worker) = self.worker() else { return };
        if let Err(e) = worker.close_document(uri).await {
            self.log_worker_error("close", &e).await;
        }
    }

    async fn will_save(&self, params: WillSaveTextDocumentParams) {
        if let Ok(worker) = self.worker() {
            let _ = worker.will_save_document(params.text_document.uri).await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        if let Ok(worker) = self.worker() {
            let _ = worker.did_save_document(params.text_document.uri).await;
        }
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let position = params.text_document_position_params;
        self.worker()?
            .hover(position.text_document.uri, position.position)
            .await
            .or_else(empty_on_interrupt(None))
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let position = params.text_document_position;
        let items = self
            .worker()?
            .completion(position.text_document.uri, position.position)
            .await
            .or_else(empty_on_interrupt(Vec::new()))?;
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        // The worker never owns definitions; an index-backed coordinator
        // would answer this instead.
        let position = params.text_document_position_params;
        self.worker()?
            .definition(position.text_document.uri, position.position)
            .await
            .map_err(rpc_error)?;
        Ok(None)
    }

    async fn goto_implementation(
        &self,
        _params: GotoImplementationParams,
    ) -> Result<Option<GotoImplementationResponse>> {
        Ok(None)
    }

    async fn document_highlight(
        &self,
        params: DocumentHighlightParams,
    ) -> Result<Option<Vec<DocumentHighlight>>> {
        let position = params.text_document_position_params;
        let highlights = self
            .worker()?
            .document_symbol_highlight(position.text_document.uri, position.position)
            .await
            .or_else(empty_on_interrupt(Vec::new()))?;
        Ok(Some(highlights))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let symbols = self
            .worker()?
            .document_symbol(params.text_document.uri)
            .await
            .or_else(empty_on_interrupt(Vec::new()))?;
        Ok(Some(DocumentSymbolResponse::Nested(symbols)))
    }

    async fn folding_range(&self, params: FoldingRangeParams) -> Result<Option<Vec<FoldingRange>>> {
        let options = *self.folding.lock().unwrap_or_else(|e| e.into_inner());
        let ranges = self
            .worker()?
            .folding_range(params.text_document.uri, options)
            .await
            .or_else(empty_on_interrupt(Vec::new()))?;
        Ok(Some(ranges))
    }

    async fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> Result<Option<SemanticTokensResult>> {
        let tokens = self
            .worker()?
            .document_semantic_tokens(params.text_document.uri)
            .await
            .or_else(empty_on_interrupt(SemanticTokens::default()))?;
        Ok(Some(SemanticTokensResult::Tokens(tokens)))
    }

    async fn document_color(&self, params: DocumentColorParams) -> Result<Vec<ColorInformation>> {
        self.worker()?
            .document_color(params.text_document.uri)
            .await
            .or_else(empty_on_interrupt(Vec::new()))
    }

    async fn color_presentation(
        &self,
        params: ColorPresentationParams,
    ) -> Result<Vec<ColorPresentation>> {
        self.worker()?
            .color_presentation(params.color, params.range)
            .await
            .map_err(rpc_error)
    }

    async fn code_action(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        let actions = self
            .worker()?
            .code_action(
                params.text_document.uri,
                params.range,
                params.context.only,
                params.context.diagnostics,
            )
            .await
            .or_else(empty_on_interrupt(Vec::new()))?;

        // Clients without codeAction literal support only understand bare
        // commands; edit-carrying fixes cannot be expressed for them.
        if !*self.action_literals.lock().unwrap_or_else(|e| e.into_inner()) {
            let commands = actions
                .into_iter()
                .filter_map(|action| match action {
                    CodeActionOrCommand::CodeAction(action) => {
                        action.command.map(CodeActionOrCommand::Command)
                    }
                    command @ CodeActionOrCommand::Command(_) => Some(command),
                })
                .collect();
            return Ok(Some(commands));
        }
        Ok(Some(actions))
    }

    async fn execute_command(&self, params: ExecuteCommandParams) -> Result<Option<Value>> {
        if params.command != SEMANTIC_REFACTOR_COMMAND {
            return Err(Error::invalid_params(format!(
                "unknown command: {}",
                params.command
            )));
        }
        let argument = params
            .arguments
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid_params("missing refactor arguments"))?;
        let args: SemanticRefactorArgs = serde_json::from_value(argument)
            .map_err(|e| Error::invalid_params(format!("bad refactor arguments: {e}")))?;

        let edit = self
            .worker()?
            .execute_refactor(args)
            .await
            .map_err(rpc_error)?;

        let response = self.client.apply_edit(edit.clone()).await.map_err(|e| Error {
            code: ErrorCode::InternalError,
            message: format!("applyEdit failed: {e}").into(),
            data: None,
        })?;
        if response.applied {
            Ok(serde_json::to_value(edit).ok())
        } else {
            let reason = response
                .failure_reason
                .unwrap_or_else(|| "client rejected the edit".to_string());
            self.client
                .log_message(
                    MessageType::WARNING,
                    format!("swiftls: client rejected refactoring edit: {reason}"),
                )
                .await;
            Err(Error {
                code: ErrorCode::InternalError,
                message: reason.into(),
                data: None,
            })
        }
    }
}

fn rpc_error(err: WorkerError) -> Error {
    match err {
        WorkerError::Cancelled => Error::request_cancelled(),
        WorkerError::InvalidRequest(msg) => Error::invalid_params(msg),
        WorkerError::NotFound(msg) => Error::invalid_params(msg),
        WorkerError::Unknown(msg) => Error {
            code: ErrorCode::InternalError,
            message: msg.into(),
            data: None,
        },
        WorkerError::ConnectionInterrupted => Error {
            code: ErrorCode::InternalError,
            message: "sourcekitd connection interrupted".into(),
            data: None,
        },
    }
}

/// Interruption is not an error for the client: it re-opens documents and
/// retries once the daemon is back, so requests resolve to their empty
/// sentinel instead.
fn empty_on_interrupt<T>(
    sentinel: T,
) -> impl FnOnce(WorkerError) -> Result<T> {
    move |err| match err {
        WorkerError::ConnectionInterrupted | WorkerError::Cancelled => Ok(sentinel),
        other => Err(rpc_error(other)),
    }
}

/// Build the LSP service with the custom methods registered.
pub fn service<S: SwiftService>(
    make_backend: impl FnOnce(Client) -> Backend<S>,
) -> (LspService<Backend<S>>, tower_lsp_server::ClientSocket) {
    LspService::build(make_backend)
        .custom_method("textDocument/symbolInfo", Backend::symbol_info)
        .custom_method("$/crash", Backend::crash)
        .finish()
}

/// Start the LSP server over stdio.
pub async fn run_server(sourcekitd: Option<PathBuf>) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = service(move |client| Backend::new(client, sourcekitd));
    Server::new(stdin, stdout, socket).serve(service).await;
}
