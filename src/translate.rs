//! Translation of sourcekitd structures into LSP results.
//!
//! Everything here is pure: a response dictionary plus the snapshot's line
//! table in, LSP values out. Items missing expected keys are skipped, never
//! fatal.

use tower_lsp_server::ls_types::{
    Color, ColorInformation, ColorPresentation, DocumentSymbol, FoldingRange, FoldingRangeKind,
    Range, SemanticToken, SemanticTokenType, SymbolKind, TextEdit,
};

use crate::diagnostics::range_from_span;
use crate::sourcekitd::{SkDict, SkValue, Uid, Values, Vocabulary};
use crate::text::LineTable;

/// Token legend reported at initialize time. Classification below produces
/// indices into this table, so order is load-bearing.
pub const TOKEN_TYPES: &[SemanticTokenType] = &[
    SemanticTokenType::KEYWORD,
    SemanticTokenType::NAMESPACE,
    SemanticTokenType::CLASS,
    SemanticTokenType::STRUCT,
    SemanticTokenType::ENUM,
    SemanticTokenType::INTERFACE,
    SemanticTokenType::TYPE_PARAMETER,
    SemanticTokenType::FUNCTION,
    SemanticTokenType::OPERATOR,
    SemanticTokenType::PROPERTY,
    SemanticTokenType::VARIABLE,
    SemanticTokenType::PARAMETER,
    SemanticTokenType::TYPE,
];

pub const TOKEN_KEYWORD: u32 = 0;
pub const TOKEN_NAMESPACE: u32 = 1;
pub const TOKEN_CLASS: u32 = 2;
pub const TOKEN_STRUCT: u32 = 3;
pub const TOKEN_ENUM: u32 = 4;
pub const TOKEN_INTERFACE: u32 = 5;
pub const TOKEN_TYPE_PARAMETER: u32 = 6;
pub const TOKEN_FUNCTION: u32 = 7;
pub const TOKEN_OPERATOR: u32 = 8;
pub const TOKEN_PROPERTY: u32 = 9;
pub const TOKEN_VARIABLE: u32 = 10;
pub const TOKEN_PARAMETER: u32 = 11;
pub const TOKEN_TYPE: u32 = 12;

/// Declaration-kind UID → LSP symbol kind.
pub fn symbol_kind(kind: Uid, values: &Values) -> Option<SymbolKind> {
    let kinds = [
        (values.decl_class, SymbolKind::CLASS),
        (values.decl_struct, SymbolKind::STRUCT),
        (values.decl_enum, SymbolKind::ENUM),
        (values.decl_enumelement, SymbolKind::ENUM_MEMBER),
        (values.decl_protocol, SymbolKind::INTERFACE),
        (values.decl_extension, SymbolKind::NAMESPACE),
        (values.decl_function_free, SymbolKind::FUNCTION),
        (values.decl_method_instance, SymbolKind::METHOD),
        (values.decl_method_static, SymbolKind::METHOD),
        (values.decl_method_class, SymbolKind::METHOD),
        (values.decl_var_instance, SymbolKind::PROPERTY),
        (values.decl_var_static, SymbolKind::PROPERTY),
        (values.decl_var_class, SymbolKind::PROPERTY),
        (values.decl_var_global, SymbolKind::VARIABLE),
        (values.decl_var_local, SymbolKind::VARIABLE),
        (values.decl_generic_type_param, SymbolKind::TYPE_PARAMETER),
    ];
    kinds.iter().find(|(uid, _)| *uid == kind).map(|(_, k)| *k)
}

/// Declaration/reference/syntax kind UID → semantic token type index.
/// Unknown kinds yield `None` and the token is dropped before encoding.
pub fn semantic_token_index(kind: Uid, values: &Values) -> Option<u32> {
    let kinds = [
        (values.syntax_keyword, TOKEN_KEYWORD),
        (values.syntax_typeidentifier, TOKEN_TYPE),
        (values.decl_module, TOKEN_NAMESPACE),
        (values.decl_class, TOKEN_CLASS),
        (values.decl_struct, TOKEN_STRUCT),
        (values.decl_enum, TOKEN_ENUM),
        (values.decl_protocol, TOKEN_INTERFACE),
        (values.decl_associatedtype, TOKEN_TYPE_PARAMETER),
        (values.decl_typealias, TOKEN_TYPE_PARAMETER),
        (values.decl_generic_type_param, TOKEN_TYPE_PARAMETER),
        (values.decl_function_free, TOKEN_FUNCTION),
        (values.decl_method_instance, TOKEN_FUNCTION),
        (values.decl_method_static, TOKEN_FUNCTION),
        (values.decl_method_class, TOKEN_FUNCTION),
        (values.ref_operator_prefix, TOKEN_OPERATOR),
        (values.ref_operator_postfix, TOKEN_OPERATOR),
        (values.ref_operator_infix, TOKEN_OPERATOR),
        (values.decl_var_static, TOKEN_PROPERTY),
        (values.decl_var_class, TOKEN_PROPERTY),
        (values.decl_var_instance, TOKEN_PROPERTY),
        (values.decl_var_local, TOKEN_VARIABLE),
        (values.decl_var_global, TOKEN_VARIABLE),
        (values.decl_var_parameter, TOKEN_PARAMETER),
        (values.ref_class, TOKEN_VARIABLE),
        (values.ref_struct, TOKEN_VARIABLE),
        (values.ref_enum, TOKEN_VARIABLE),
        (values.ref_protocol, TOKEN_VARIABLE),
        (values.ref_var_global, TOKEN_VARIABLE),
        (values.ref_var_instance, TOKEN_VARIABLE),
        (values.ref_var_local, TOKEN_VARIABLE),
        (values.ref_function_free, TOKEN_VARIABLE),
        (values.ref_method_instance, TOKEN_VARIABLE),
    ];
    kinds.iter().find(|(uid, _)| *uid == kind).map(|(_, k)| *k)
}

/// Completion result kind UID → LSP completion item kind.
pub fn completion_item_kind(
    kind: Uid,
    values: &Values,
) -> Option<tower_lsp_server::ls_types::CompletionItemKind> {
    use tower_lsp_server::ls_types::CompletionItemKind as K;
    let kinds = [
        (values.decl_class, K::CLASS),
        (values.decl_struct, K::STRUCT),
        (values.decl_enum, K::ENUM),
        (values.decl_enumelement, K::ENUM_MEMBER),
        (values.decl_protocol, K::INTERFACE),
        (values.decl_typealias, K::TYPE_PARAMETER),
        (values.decl_associatedtype, K::TYPE_PARAMETER),
        (values.decl_generic_type_param, K::TYPE_PARAMETER),
        (values.decl_function_free, K::FUNCTION),
        (values.decl_method_instance, K::METHOD),
        (values.decl_method_static, K::METHOD),
        (values.decl_method_class, K::METHOD),
        (values.decl_var_instance, K::PROPERTY),
        (values.decl_var_static, K::PROPERTY),
        (values.decl_var_class, K::PROPERTY),
        (values.decl_var_global, K::VARIABLE),
        (values.decl_var_local, K::VARIABLE),
        (values.decl_var_parameter, K::VARIABLE),
        (values.syntax_keyword, K::KEYWORD),
    ];
    kinds.iter().find(|(uid, _)| *uid == kind).map(|(_, k)| *k)
}

/// A classified token in absolute (line, UTF-16 column) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawToken {
    pub line: u32,
    pub start: u32,
    pub length: u32,
    pub kind: u32,
}

/// Delta-encode into the LSP 5-tuple stream. The column delta resets to an
/// absolute column whenever the line delta is non-zero.
pub fn encode_semantic_tokens(mut tokens: Vec<RawToken>) -> Vec<SemanticToken> {
    tokens.sort_by_key(|t| (t.line, t.start));
    let mut out = Vec::with_capacity(tokens.len());
    let mut prev_line = 0;
    let mut prev_start = 0;
    for token in tokens {
        let delta_line = token.line - prev_line;
        let delta_start = if delta_line == 0 {
            token.start - prev_start
        } else {
            token.start
        };
        out.push(SemanticToken {
            delta_line,
            delta_start,
            length: token.length,
            token_type: token.kind,
            token_modifiers_bitset: 0,
        });
        prev_line = token.line;
        prev_start = token.start;
    }
    out
}

/// Classify the annotation and syntax-map entries of a syntactic
/// `editor.open` response and produce the encoded token stream.
pub fn semantic_tokens_from_response(
    response: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
) -> Vec<SemanticToken> {
    let keys = &vocab.keys;
    let mut raw = Vec::new();

    let mut collect = |entries: &[SkValue]| {
        for entry in entries {
            let Some(dict) = entry.as_dict() else { continue };
            let Some(kind) = dict.uid(keys.kind) else { continue };
            let Some(index) = semantic_token_index(kind, &vocab.values) else {
                continue;
            };
            let (Some(offset), Some(length)) = (dict.int(keys.offset), dict.int(keys.length))
            else {
                continue;
            };
            let Some(token) = raw_token(table, offset as usize, length as usize, index) else {
                continue;
            };
            raw.push(token);
        }
    };

    if let Some(annotations) = response.array(keys.annotations) {
        collect(annotations);
    }
    if let Some(syntaxmap) = response.array(keys.syntaxmap) {
        collect(syntaxmap);
    }

    encode_semantic_tokens(raw)
}

fn raw_token(table: &LineTable, offset: usize, length: usize, kind: u32) -> Option<RawToken> {
    let (line, start) = table.position_of_utf8_offset(offset)?;
    let (end_line, end) = table.position_of_utf8_offset(offset + length)?;
    // Tokens never span lines; a mapping that says otherwise is torn.
    if end_line != line {
        return None;
    }
    Some(RawToken {
        line,
        start,
        length: end - start,
        kind,
    })
}

/// Build the document-symbol tree from the substructure of a syntactic
/// `editor.open` response. Unnamed or unmapped nodes are transparent: their
/// children are spliced into the parent's list.
pub fn document_symbols_from_response(
    response: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
) -> Vec<DocumentSymbol> {
    response
        .array(vocab.keys.substructure)
        .map(|nodes| symbols_from_nodes(nodes, vocab, table))
        .unwrap_or_default()
}

fn symbols_from_nodes(nodes: &[SkValue], vocab: &Vocabulary, table: &LineTable) -> Vec<DocumentSymbol> {
    let keys = &vocab.keys;
    let mut out = Vec::new();
    for node in nodes {
        let Some(dict) = node.as_dict() else { continue };
        let mut children = dict
            .array(keys.substructure)
            .map(|nested| symbols_from_nodes(nested, vocab, table))
            .unwrap_or_default();

        let symbol = dict
            .uid(keys.kind)
            .and_then(|kind| symbol_kind(kind, &vocab.values))
            .and_then(|kind| {
                let name = dict.string(keys.name)?.to_string();
                let range = node_range(dict, vocab, table)?;
                let selection_range = name_range(dict, vocab, table).unwrap_or(range);
                #[allow(deprecated)]
                Some(DocumentSymbol {
                    name,
                    detail: dict.string(keys.typename).map(str::to_string),
                    kind,
                    tags: None,
                    deprecated: None,
                    range,
                    selection_range,
                    children: (!children.is_empty()).then(|| std::mem::take(&mut children)),
                })
            });

        match symbol {
            Some(symbol) => out.push(symbol),
            None => out.append(&mut children),
        }
    }
    out
}

fn node_range(dict: &SkDict, vocab: &Vocabulary, table: &LineTable) -> Option<Range> {
    let keys = &vocab.keys;
    let (offset, length) = match (dict.int(keys.bodyoffset), dict.int(keys.bodylength)) {
        (Some(offset), Some(length)) => (offset, length),
        _ => (dict.int(keys.offset)?, dict.int(keys.length)?),
    };
    range_from_span(table, offset as usize, length as usize)
}

fn name_range(dict: &SkDict, vocab: &Vocabulary, table: &LineTable) -> Option<Range> {
    let keys = &vocab.keys;
    let offset = dict.int(keys.nameoffset)?;
    let length = dict.int(keys.namelength)?;
    if length == 0 {
        return None;
    }
    range_from_span(table, offset as usize, length as usize)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FoldingOptions {
    pub range_limit: Option<usize>,
    pub line_folding_only: bool,
}

/// Folding ranges from (a) runs of adjacent comment tokens in the syntax map
/// and (b) every substructure node with a non-empty body.
pub fn folding_ranges_from_response(
    response: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
    options: FoldingOptions,
) -> Vec<FoldingRange> {
    let keys = &vocab.keys;
    let values = &vocab.values;
    let mut out = Vec::new();

    let at_limit =
        |out: &Vec<FoldingRange>| options.range_limit.is_some_and(|limit| out.len() >= limit);

    // (a) comment runs: adjacent comment tokens collapse into one range.
    if let Some(syntaxmap) = response.array(keys.syntaxmap) {
        let mut run: Option<(usize, usize)> = None;
        for entry in syntaxmap {
            let Some(dict) = entry.as_dict() else { continue };
            let (Some(kind), Some(offset), Some(length)) = (
                dict.uid(keys.kind),
                dict.int(keys.offset),
                dict.int(keys.length),
            ) else {
                continue;
            };
            let (offset, length) = (offset as usize, length as usize);
            let is_comment = kind == values.syntax_comment || kind == values.syntax_doccomment;

            run = match (run, is_comment) {
                (None, true) => Some((offset, offset + length)),
                (Some((start, end)), true) if end == offset => Some((start, offset + length)),
                (Some(span), true) => {
                    push_folding(&mut out, table, span, Some(FoldingRangeKind::Comment), options);
                    Some((offset, offset + length))
                }
                (Some(span), false) => {
                    push_folding(&mut out, table, span, Some(FoldingRangeKind::Comment), options);
                    None
                }
                (None, false) => None,
            };
            if at_limit(&out) {
                run = None;
                break;
            }
        }
        if let Some(span) = run {
            push_folding(&mut out, table, span, Some(FoldingRangeKind::Comment), options);
        }
    }

    // (b) structure bodies, depth first.
    if let Some(nodes) = response.array(keys.substructure) {
        fold_substructure(nodes, vocab, table, options, &mut out);
    }

    out.sort_by_key(|r| (r.start_line, r.start_character, r.end_line, r.end_character));
    out
}

fn fold_substructure(
    nodes: &[SkValue],
    vocab: &Vocabulary,
    table: &LineTable,
    options: FoldingOptions,
    out: &mut Vec<FoldingRange>,
) {
    let keys = &vocab.keys;
    for node in nodes {
        if options.range_limit.is_some_and(|limit| out.len() >= limit) {
            return;
        }
        let Some(dict) = node.as_dict() else { continue };
        if let (Some(offset), Some(length)) =
            (dict.int(keys.bodyoffset), dict.int(keys.bodylength))
            && length > 0
        {
            let span = (offset as usize, (offset + length) as usize);
            push_folding(out, table, span, None, options);
        }
        if let Some(nested) = dict.array(keys.substructure) {
            fold_substructure(nested, vocab, table, options, out);
        }
    }
}

fn push_folding(
    out: &mut Vec<FoldingRange>,
    table: &LineTable,
    (start, end): (usize, usize),
    kind: Option<FoldingRangeKind>,
    options: FoldingOptions,
) {
    if options.range_limit.is_some_and(|limit| out.len() >= limit) {
        return;
    }
    let Some((start_line, start_col)) = table.position_of_utf8_offset(start) else {
        return;
    };
    let Some((end_line, end_col)) = table.position_of_utf8_offset(end) else {
        return;
    };

    if options.line_folding_only {
        // The closing line stays visible; ranges that then collapse to a
        // single line fold nothing and are dropped.
        let Some(end_line) = end_line.checked_sub(1) else {
            return;
        };
        if end_line <= start_line {
            return;
        }
        out.push(FoldingRange {
            start_line,
            start_character: None,
            end_line,
            end_character: None,
            kind,
            collapsed_text: None,
        });
    } else {
        out.push(FoldingRange {
            start_line,
            start_character: Some(start_col),
            end_line,
            end_character: Some(end_col),
            kind,
            collapsed_text: None,
        });
    }
}

/// Color literals: `#colorLiteral(red:green:blue:alpha:)` object literals in
/// the substructure, each argument's body parsed as a float component.
pub fn document_colors_from_response(
    response: &SkDict,
    vocab: &Vocabulary,
    table: &LineTable,
) -> Vec<ColorInformation> {
    let mut out = Vec::new();
    if let Some(nodes) = response.array(vocab.keys.substructure) {
        collect_colors(nodes, vocab, table, &mut out);
    }
    out
}

fn collect_colors(
    nodes: &[SkValue],
    vocab: &Vocabulary,
    table: &LineTable,
    out: &mut Vec<ColorInformation>,
) {
    let keys = &vocab.keys;
    for node in nodes {
        let Some(dict) = node.as_dict() else { continue };
        if dict.uid(keys.kind) == Some(vocab.values.expr_object_literal)
            && dict.string(keys.name) == Some("colorLiteral")
            && let Some(color) = color_from_literal(dict, vocab, table)
            && let (Some(offset), Some(length)) = (dict.int(keys.offset), dict.int(keys.length))
            && let Some(range) = range_from_span(table, offset as usize, length as usize)
        {
            out.push(ColorInformation { range, color });
        }
        if let Some(nested) = dict.array(keys.substructure) {
            collect_colors(nested, vocab, table, out);
        }
    }
}

fn color_from_literal(dict: &SkDict, vocab: &Vocabulary, table: &LineTable) -> Option<Color> {
    let keys = &vocab.keys;
    let mut components = [None::<f32>; 4];
    for argument in dict.array(keys.substructure)? {
        let Some(argument) = argument.as_dict() else {
            continue;
        };
        let slot = match argument.string(keys.name) {
            Some("red") => 0,
            Some("green") => 1,
            Some("blue") => 2,
            Some("alpha") => 3,
            _ => continue,
        };
        let offset = argument.int(keys.bodyoffset)? as usize;
        let length = argument.int(keys.bodylength)? as usize;
        let text = table.text().get(offset..offset + length)?;
        components[slot] = text.trim().parse::<f32>().ok();
    }
    Some(Color {
        red: components[0]?,
        green: components[1]?,
        blue: components[2]?,
        alpha: components[3]?,
    })
}

/// The single presentation we offer: re-insert the literal.
pub fn color_presentations(color: &Color, range: Range) -> Vec<ColorPresentation> {
    let label = format!(
        "#colorLiteral(red: {}, green: {}, blue: {}, alpha: {})",
        color.red, color.green, color.blue, color.alpha
    );
    vec![ColorPresentation {
        label: label.clone(),
        text_edit: Some(TextEdit {
            range,
            new_text: label,
        }),
        additional_text_edits: None,
    }]
}

/// Hover contents: the backslash-escaped symbol name, then the XML docs
/// rendered to markdown, else the annotated declaration as a code block.
pub fn hover_markdown(
    name: &str,
    xml_doc: Option<&str>,
    annotated_decl: Option<&str>,
) -> String {
    let mut out = format!("# {}\n", escape_markdown(name));
    if let Some(xml) = xml_doc {
        let rendered = render_xml_doc(xml);
        if !rendered.is_empty() {
            out.push_str(&rendered);
            return out;
        }
    }
    if let Some(decl) = annotated_decl {
        let text = strip_tags(decl);
        if !text.is_empty() {
            out.push_str("```swift\n");
            out.push_str(&text);
            out.push_str("\n```");
        }
    }
    out
}

fn escape_markdown(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if "\\`*_{}[]()#+-.!<>".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Render the XML documentation sourcekitd emits into markdown. Only the
/// handful of tags the daemon produces get treatment; unknown tags are
/// transparent so their text survives.
pub fn render_xml_doc(xml: &str) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < xml.len() {
        match xml[i..].find('<') {
            Some(0) => {
                let Some(close) = xml[i..].find('>') else { break };
                let tag = &xml[i + 1..i + close];
                let is_closing = tag.starts_with('/');
                let self_closing = tag.ends_with('/');
                let name = tag
                    .trim_start_matches('/')
                    .trim_end_matches('/')
                    .split_whitespace()
                    .next()
                    .unwrap_or("");
                i += close + 1;
                match (name, is_closing) {
                    ("Declaration" | "CodeListing", false) => out.push_str("```swift\n"),
                    ("Declaration" | "CodeListing", true) => out.push_str("\n```\n\n"),
                    ("codeVoice", _) => out.push('`'),
                    ("Para" | "Abstract" | "Discussion", true) => out.push_str("\n\n"),
                    ("zCodeLineNumbered", true) => out.push('\n'),
                    // Metadata and embedded HTML carry nothing renderable.
                    ("Name" | "USR" | "rawHTML", false) if !self_closing => {
                        let end_tag = format!("</{name}>");
                        match xml[i..].find(&end_tag) {
                            Some(skip) => i += skip + end_tag.len(),
                            None => break,
                        }
                    }
                    _ => {}
                }
            }
            Some(next) => {
                out.push_str(&decode_entities(&xml[i..i + next]));
                i += next;
            }
            None => {
                out.push_str(&decode_entities(&xml[i..]));
                break;
            }
        }
    }
    out.trim().to_string()
}

fn strip_tags(xml: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    let mut text = String::new();
    for ch in xml.chars() {
        match ch {
            '<' => {
                out.push_str(&decode_entities(&text));
                text.clear();
                in_tag = true;
            }
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    out.push_str(&decode_entities(&text));
    out.trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
