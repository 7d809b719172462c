//! Per-document diagnostic cache and the sourcekitd → LSP translation.
//!
//! sourcekitd reports diagnostics in stages: `parse` results arrive with
//! syntactic responses, `sema` once type checking finishes. Integrating a new
//! response replaces only the cached diagnostics of that response's stage, so
//! a late sema pass never wipes fresh parse results (and vice versa).

use std::collections::HashMap;

use tower_lsp_server::ls_types::{
    CodeAction, CodeActionKind, Diagnostic, DiagnosticSeverity, Position, Range, TextEdit, Uri,
    WorkspaceEdit,
};

use crate::sourcekitd::{SkDict, Vocabulary};
use crate::text::LineTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStage {
    Parse,
    Sema,
}

/// One diagnostic as cached for a document, with the structured fix-its the
/// LSP `Diagnostic` type cannot carry directly.
#[derive(Debug, Clone)]
pub struct CachedDiagnostic {
    pub diagnostic: Diagnostic,
    pub stage: DiagnosticStage,
    pub is_fallback: bool,
    pub fixits: Vec<TextEdit>,
}

/// uri → ordered diagnostics from the last successfully merged response.
#[derive(Debug, Default)]
pub struct DiagnosticCache {
    map: HashMap<Uri, Vec<CachedDiagnostic>>,
}

impl DiagnosticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate a response with stage `stage` produced under `is_fallback`
    /// compile arguments. Returns the full merged list for publication.
    pub fn merge(
        &mut self,
        uri: &Uri,
        stage: DiagnosticStage,
        is_fallback: bool,
        new: Vec<CachedDiagnostic>,
    ) -> Vec<Diagnostic> {
        let entry = self.map.entry(uri.clone()).or_default();
        entry.retain(|d| d.stage != stage);
        // Semantic results computed from guessed compiler arguments are noise;
        // withhold them and keep whatever sema results we last trusted.
        let mut incoming: Vec<CachedDiagnostic> = if is_fallback {
            new.into_iter()
                .filter(|d| d.stage != DiagnosticStage::Sema)
                .collect()
        } else {
            new
        };
        entry.append(&mut incoming);
        entry.iter().map(|d| d.diagnostic.clone()).collect()
    }

    pub fn get(&self, uri: &Uri) -> &[CachedDiagnostic] {
        self.map.get(uri).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear(&mut self, uri: &Uri) {
        self.map.remove(uri);
    }
}

/// Range overlap where zero-length ranges still count: an empty range `[p, p)`
/// overlaps `[l, h)` iff `l <= p < h`, and two empty ranges overlap iff their
/// points coincide.
pub fn overlaps_including_empty(a: &Range, b: &Range) -> bool {
    let a_empty = a.start == a.end;
    let b_empty = b.start == b.end;
    match (a_empty, b_empty) {
        (true, true) => a.start == b.start,
        (true, false) => b.start <= a.start && a.start < b.end,
        (false, true) => a.start <= b.start && b.start < a.end,
        (false, false) => a.start < b.end && b.start < a.end,
    }
}

/// Field-wise identity used to match a cached diagnostic against the ones the
/// client submitted in a code-action request.
pub fn same_diagnostic(a: &Diagnostic, b: &Diagnostic) -> bool {
    a.range == b.range
        && a.severity == b.severity
        && a.code == b.code
        && a.source == b.source
        && a.message == b.message
}

/// Extract the response's stage and its diagnostics.
///
/// Items missing the keys needed to place them in the document are dropped;
/// a torn response must never take the worker down.
pub fn diagnostics_from_response(
    response: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
    is_fallback: bool,
) -> (DiagnosticStage, Vec<CachedDiagnostic>) {
    let keys = &vocab.keys;
    let values = &vocab.values;

    let response_stage = match response.uid(keys.diagnostic_stage) {
        Some(uid) if uid == values.diag_stage_sema => DiagnosticStage::Sema,
        _ => DiagnosticStage::Parse,
    };

    let mut out = Vec::new();
    let Some(items) = response.array(keys.diagnostics) else {
        return (response_stage, out);
    };

    for item in items {
        let Some(dict) = item.as_dict() else { continue };
        let Some(cached) = diagnostic_from_dict(dict, vocab, table, response_stage, is_fallback)
        else {
            continue;
        };
        out.push(cached);
    }
    (response_stage, out)
}

fn diagnostic_from_dict(
    dict: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
    response_stage: DiagnosticStage,
    is_fallback: bool,
) -> Option<CachedDiagnostic> {
    let keys = &vocab.keys;
    let values = &vocab.values;

    let message = dict.string(keys.description)?.to_string();

    let stage = match dict.uid(keys.diagnostic_stage) {
        Some(uid) if uid == values.diag_stage_sema => DiagnosticStage::Sema,
        Some(uid) if uid == values.diag_stage_parse => DiagnosticStage::Parse,
        _ => response_stage,
    };

    let severity = match dict.uid(keys.severity) {
        Some(uid) if uid == values.severity_error => DiagnosticSeverity::ERROR,
        Some(uid) if uid == values.severity_warning => DiagnosticSeverity::WARNING,
        Some(uid) if uid == values.severity_note => DiagnosticSeverity::INFORMATION,
        _ => DiagnosticSeverity::ERROR,
    };

    // Prefer the first reported byte range; fall back to the 1-based
    // line/column point.
    let range = dict
        .array(keys.ranges)
        .and_then(|ranges| ranges.first())
        .and_then(|r| r.as_dict())
        .and_then(|r| {
            let offset = r.int(keys.offset)? as usize;
            let length = r.int(keys.length)? as usize;
            range_from_span(table, offset, length)
        })
        .or_else(|| {
            let line = dict.int(keys.line)?.checked_sub(1)? as u32;
            let utf8_col = dict.int(keys.column)?.checked_sub(1)? as usize;
            let col = table.utf16_col_of(line, utf8_col)?;
            let position = Position::new(line, col);
            Some(Range::new(position, position))
        })?;

    let fixits: Vec<TextEdit> = dict
        .array(keys.fixits)
        .map(|fixits| {
            fixits
                .iter()
                .filter_map(|f| {
                    let f = f.as_dict()?;
                    let offset = f.int(keys.offset)? as usize;
                    let length = f.int(keys.length)? as usize;
                    let new_text = f.string(keys.sourcetext)?.to_string();
                    Some(TextEdit {
                        range: range_from_span(table, offset, length)?,
                        new_text,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let data = if fixits.is_empty() {
        None
    } else {
        serde_json::to_value(&fixits)
            .ok()
            .map(|edits| serde_json::json!({ "fixits": edits }))
    };

    Some(CachedDiagnostic {
        diagnostic: Diagnostic {
            range,
            severity: Some(severity),
            source: Some("sourcekit".to_string()),
            message,
            data,
            ..Default::default()
        },
        stage,
        is_fallback,
        fixits,
    })
}

pub fn range_from_span(table: &LineTable, offset: usize, length: usize) -> Option<Range> {
    let (start_line, start_col) = table.position_of_utf8_offset(offset)?;
    let (end_line, end_col) = table.position_of_utf8_offset(offset + length)?;
    Some(Range::new(
        Position::new(start_line, start_col),
        Position::new(end_line, end_col),
    ))
}

/// Quick fixes for `request_range`: one action per fix-it of each cached
/// diagnostic that overlaps the range and appears in the client's submitted
/// diagnostics. The diagnostic moves onto the action with its nested fix-it
/// payload stripped, so clients don't see the same edit twice.
pub fn quick_fix_actions(
    uri: &Uri,
    cached: &[CachedDiagnostic],
    request_range: &Range,
    client_diagnostics: &[Diagnostic],
) -> Vec<CodeAction> {
    let mut actions = Vec::new();
    for entry in cached {
        if entry.fixits.is_empty() {
            continue;
        }
        if !overlaps_including_empty(&entry.diagnostic.range, request_range) {
            continue;
        }
        if !client_diagnostics
            .iter()
            .any(|d| same_diagnostic(d, &entry.diagnostic))
        {
            continue;
        }

        let mut stripped = entry.diagnostic.clone();
        stripped.data = None;

        for fixit in &entry.fixits {
            let edits = HashMap::from([(uri.clone(), vec![fixit.clone()])]);
            actions.push(CodeAction {
                title: fixit_title(fixit),
                kind: Some(CodeActionKind::QUICKFIX),
                diagnostics: Some(vec![stripped.clone()]),
                edit: Some(WorkspaceEdit {
                    changes: Some(edits),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }
    actions
}

fn fixit_title(fixit: &TextEdit) -> String {
    let empty_range = fixit.range.start == fixit.range.end;
    if fixit.new_text.is_empty() {
        "Remove code".to_string()
    } else if empty_range {
        format!("Insert '{}'", fixit.new_text)
    } else {
        format!("Replace with '{}'", fixit.new_text)
    }
}
