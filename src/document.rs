use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tower_lsp_server::ls_types::{Range, TextDocumentContentChangeEvent, Uri};

use crate::text::LineTable;

/// Immutable view of one document version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub uri: Uri,
    pub version: i64,
    table: Arc<LineTable>,
}

impl Snapshot {
    fn new(uri: Uri, version: i64, text: Arc<str>) -> Self {
        Self {
            uri,
            version,
            table: Arc::new(LineTable::new(text)),
        }
    }

    pub fn text(&self) -> &str {
        self.table.text()
    }

    pub fn table(&self) -> &LineTable {
        &self.table
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is not open: {uri}")]
    NotOpen { uri: String },
    #[error("change range {start_line}:{start_col}..{end_line}:{end_col} does not resolve in the document")]
    InvalidRange {
        start_line: u32,
        start_col: u32,
        end_line: u32,
        end_col: u32,
    },
}

impl DocumentError {
    fn invalid_range(range: &Range) -> Self {
        Self::InvalidRange {
            start_line: range.start.line,
            start_col: range.start.character,
            end_line: range.end.line,
            end_col: range.end.character,
        }
    }
}

/// One applied change, expressed in the pre-edit snapshot's byte coordinates.
#[derive(Debug)]
pub struct AppliedEdit<'a> {
    pub utf8_offset: usize,
    pub utf8_length: usize,
    pub text: &'a str,
}

/// In-memory store of open documents, latest snapshot per URI.
///
/// The whole manager is replaced with an empty one when the compiler service
/// crashes; re-opens are driven by the owning server.
#[derive(Debug, Default)]
pub struct DocumentManager {
    documents: HashMap<Uri, Snapshot>,
}

impl DocumentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new document, replacing any existing snapshot for the URI.
    pub fn open(&mut self, uri: Uri, version: i64, text: String) -> Snapshot {
        let snapshot = Snapshot::new(uri.clone(), version, Arc::from(text));
        self.documents.insert(uri, snapshot.clone());
        snapshot
    }

    /// Idempotent.
    pub fn close(&mut self, uri: &Uri) {
        self.documents.remove(uri);
    }

    pub fn latest_snapshot(&self, uri: &Uri) -> Option<Snapshot> {
        self.documents.get(uri).cloned()
    }

    pub fn open_uris(&self) -> impl Iterator<Item = &Uri> {
        self.documents.keys()
    }

    /// Apply `changes` in order, reporting each change together with the
    /// snapshot it was computed against so the caller can mirror it to the
    /// compiler service. Returns the final snapshot.
    ///
    /// A range that does not resolve against the pre-edit line table aborts
    /// that edit; the document keeps its last good snapshot.
    pub fn edit(
        &mut self,
        uri: &Uri,
        version: i64,
        changes: &[TextDocumentContentChangeEvent],
        mut consumer: impl FnMut(&Snapshot, AppliedEdit<'_>),
    ) -> Result<Snapshot, DocumentError> {
        let mut current = self
            .documents
            .get(uri)
            .cloned()
            .ok_or_else(|| DocumentError::NotOpen {
                uri: uri.as_str().to_string(),
            })?;

        for change in changes {
            let (offset, length) = match &change.range {
                Some(range) => {
                    let table = current.table();
                    let lo = table
                        .utf8_offset_of(range.start.line, range.start.character)
                        .ok_or_else(|| DocumentError::invalid_range(range))?;
                    let hi = table
                        .utf8_offset_of(range.end.line, range.end.character)
                        .ok_or_else(|| DocumentError::invalid_range(range))?;
                    if hi < lo {
                        return Err(DocumentError::invalid_range(range));
                    }
                    (lo, hi - lo)
                }
                None => (0, current.text().len()),
            };

            consumer(
                &current,
                AppliedEdit {
                    utf8_offset: offset,
                    utf8_length: length,
                    text: &change.text,
                },
            );

            let mut text = String::with_capacity(
                current.text().len() - length + change.text.len(),
            );
            text.push_str(&current.text()[..offset]);
            text.push_str(&change.text);
            text.push_str(&current.text()[offset + length..]);
            current = Snapshot::new(uri.clone(), version, Arc::from(text));
        }

        self.documents.insert(uri.clone(), current.clone());
        Ok(current)
    }
}
