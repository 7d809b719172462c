#![allow(dead_code)]

pub mod fake;
pub mod lsp_client;

use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use tower_lsp_server::ls_types::{Diagnostic, TextDocumentContentChangeEvent, Uri};

use self::fake::FakeSourcekitd;
use swiftls::document::DocumentManager;
use swiftls::sourcekitd::{SkDict, SkValue, SwiftService, Uid};
use swiftls::worker::SwiftWorker;

pub fn uri(s: &str) -> Uri {
    Uri::from_str(s).unwrap()
}

/// A worker wired to a fake daemon, with the coordinator role (diagnostic
/// sink, document store, reopen-after-crash) played by recording stubs.
pub struct WorkerHarness {
    pub service: Arc<FakeSourcekitd>,
    pub worker: SwiftWorker<FakeSourcekitd>,
    publications: Arc<Mutex<Vec<(String, Vec<Diagnostic>)>>>,
    documents: Arc<Mutex<DocumentManager>>,
}

impl WorkerHarness {
    pub fn new() -> Self {
        let service = FakeSourcekitd::new();
        let publications: Arc<Mutex<Vec<(String, Vec<Diagnostic>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let documents = Arc::new(Mutex::new(DocumentManager::new()));

        let publisher_log = Arc::clone(&publications);
        let publisher = Box::new(move |uri: Uri, diagnostics: Vec<Diagnostic>, _version: Option<i32>| {
            publisher_log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((uri.as_str().to_string(), diagnostics));
        });

        let worker_cell: Arc<OnceLock<SwiftWorker<FakeSourcekitd>>> = Arc::new(OnceLock::new());
        let reopen_cell = Arc::clone(&worker_cell);
        let reopen_docs = Arc::clone(&documents);
        let reopener = Box::new(move || {
            let Some(worker) = reopen_cell.get() else { return };
            let snapshots: Vec<_> = {
                let documents = reopen_docs.lock().unwrap_or_else(|e| e.into_inner());
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

        let worker = SwiftWorker::new(
            Arc::clone(&service),
            vec!["git".to_string(), "hg".to_string()],
            publisher,
            reopener,
        );
        let _ = worker_cell.set(worker.clone());

        Self {
            service,
            worker,
            publications,
            documents,
        }
    }

    /// Open through the worker, recording the document on the coordinator
    /// side so crash recovery can re-open it.
    pub async fn open(&self, uri: &Uri, version: i64, text: &str) {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .open(uri.clone(), version, text.to_string());
        self.worker
            .open_document(uri.clone(), version, text.to_string())
            .await
            .unwrap();
    }

    pub async fn edit(
        &self,
        uri: &Uri,
        version: i64,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) {
        {
            let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
            let _ = documents.edit(uri, version, &changes, |_, _| {});
        }
        self.worker
            .change_document(uri.clone(), version, changes)
            .await
            .unwrap();
    }

    /// All diagnostic publications for `uri`, oldest first.
    pub fn publications_for(&self, uri: &Uri) -> Vec<Vec<Diagnostic>> {
        self.publications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(published, _)| published == uri.as_str())
            .map(|(_, diagnostics)| diagnostics.clone())
            .collect()
    }

    /// Latest publication for `uri`, if any.
    pub fn last_publication(&self, uri: &Uri) -> Option<Vec<Diagnostic>> {
        self.publications_for(uri).pop()
    }
}

/// A daemon response carrying diagnostics for the given stage.
pub fn diag_response(service: &FakeSourcekitd, stage: Uid, items: Vec<SkValue>) -> SkValue {
    let keys = &service.vocabulary().keys;
    SkValue::Dict(
        SkDict::new()
            .with(keys.diagnostic_stage, SkValue::Uid(stage))
            .with(keys.diagnostics, SkValue::Array(items)),
    )
}

/// One diagnostic item at a 1-based line/column, optionally with a fix-it
/// replacing `(offset, length)` with the given text.
pub fn diag_item(
    service: &FakeSourcekitd,
    stage: Uid,
    message: &str,
    line: i64,
    column: i64,
    fixit: Option<(i64, i64, &str)>,
) -> SkValue {
    let vocab = service.vocabulary();
    let keys = &vocab.keys;
    let mut dict = SkDict::new()
        .with(keys.description, SkValue::String(message.to_string()))
        .with(keys.severity, SkValue::Uid(vocab.values.severity_error))
        .with(keys.diagnostic_stage, SkValue::Uid(stage))
        .with(keys.line, SkValue::Int(line))
        .with(keys.column, SkValue::Int(column));
    if let Some((offset, length, text)) = fixit {
        dict.set(
            keys.fixits,
            SkValue::Array(vec![SkValue::Dict(
                SkDict::new()
                    .with(keys.offset, SkValue::Int(offset))
                    .with(keys.length, SkValue::Int(length))
                    .with(keys.sourcetext, SkValue::String(text.to_string())),
            )]),
        );
    }
    SkValue::Dict(dict)
}
