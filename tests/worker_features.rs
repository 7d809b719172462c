mod common;

use common::{WorkerHarness, diag_item, diag_response, uri};
use swiftls::sourcekitd::{SkDict, SkValue, SwiftService};
use swiftls::translate::{
    FoldingOptions, TOKEN_FUNCTION, TOKEN_KEYWORD, TOKEN_TYPE,
};
use tower_lsp_server::ls_types::{
    CodeActionKind, CodeActionOrCommand, FoldingRangeKind, Position, Range,
};

/// Folding with a line-only client: the multi-line comment survives (minus
/// its closing line), the single-line brace body is dropped.
#[tokio::test]
async fn folding_with_line_only_client() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///fold.swift");

    let text = "a\nb\n/* c\n c\n c\n c */\nd\nfunc e() { f() }\n";
    h.open(&u, 1, text).await;

    let comment_start = text.find("/*").unwrap() as i64;
    let comment_len = (text.find("*/").unwrap() + 2) as i64 - comment_start;
    let body_start = text.find("{ f").unwrap() as i64 + 1;

    // Response to the syntactic-only open issued by the folding request.
    h.service.queue_response(
        vocab.requests.editor_open,
        SkValue::Dict(
            SkDict::new()
                .with(
                    vocab.keys.syntaxmap,
                    SkValue::Array(vec![SkValue::Dict(
                        SkDict::new()
                            .with(vocab.keys.kind, SkValue::Uid(vocab.values.syntax_comment))
                            .with(vocab.keys.offset, SkValue::Int(comment_start))
                            .with(vocab.keys.length, SkValue::Int(comment_len)),
                    )]),
                )
                .with(
                    vocab.keys.substructure,
                    SkValue::Array(vec![SkValue::Dict(
                        SkDict::new()
                            .with(vocab.keys.bodyoffset, SkValue::Int(body_start))
                            .with(vocab.keys.bodylength, SkValue::Int(6)),
                    )]),
                ),
        ),
    );

    let ranges = h
        .worker
        .folding_range(
            u.clone(),
            FoldingOptions {
                range_limit: None,
                line_folding_only: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].start_line, 2);
    assert_eq!(ranges[0].end_line, 4);
    assert_eq!(ranges[0].kind, Some(FoldingRangeKind::Comment));

    // The syntactic session was closed again.
    let closes = h.service.requests_of(vocab.requests.editor_close);
    assert_eq!(closes.len(), 1);
    assert!(
        closes[0]
            .string(vocab.keys.name)
            .unwrap()
            .ends_with("::syntactic")
    );
}

/// Delta encoding across annotation and syntax-map sources.
#[tokio::test]
async fn semantic_tokens_delta_encoding() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///tok.swift");

    // Tokens at (2,4,len 3), (2,10,len 2), (4,0,len 5).
    let text = "//\n\n    let   Ty\n\nhello\n";
    h.open(&u, 1, text).await;

    h.service.queue_response(
        vocab.requests.editor_open,
        SkValue::Dict(
            SkDict::new()
                .with(
                    vocab.keys.syntaxmap,
                    SkValue::Array(vec![
                        SkValue::Dict(
                            SkDict::new()
                                .with(vocab.keys.kind, SkValue::Uid(vocab.values.syntax_keyword))
                                .with(vocab.keys.offset, SkValue::Int(8))
                                .with(vocab.keys.length, SkValue::Int(3)),
                        ),
                        SkValue::Dict(
                            SkDict::new()
                                .with(
                                    vocab.keys.kind,
                                    SkValue::Uid(vocab.values.syntax_typeidentifier),
                                )
                                .with(vocab.keys.offset, SkValue::Int(14))
                                .with(vocab.keys.length, SkValue::Int(2)),
                        ),
                    ]),
                )
                .with(
                    vocab.keys.annotations,
                    SkValue::Array(vec![SkValue::Dict(
                        SkDict::new()
                            .with(
                                vocab.keys.kind,
                                SkValue::Uid(vocab.values.decl_function_free),
                            )
                            .with(vocab.keys.offset, SkValue::Int(18))
                            .with(vocab.keys.length, SkValue::Int(5)),
                    )]),
                ),
        ),
    );

    let tokens = h.worker.document_semantic_tokens(u.clone()).await.unwrap();
    let flat: Vec<u32> = tokens
        .data
        .iter()
        .flat_map(|t| {
            [
                t.delta_line,
                t.delta_start,
                t.length,
                t.token_type,
                t.token_modifiers_bitset,
            ]
        })
        .collect();
    assert_eq!(
        flat,
        vec![
            2, 4, 3, TOKEN_KEYWORD, 0, //
            0, 6, 2, TOKEN_TYPE, 0, //
            2, 0, 5, TOKEN_FUNCTION, 0,
        ]
    );
}

/// `only=[quickFix]`: one action per matching fix-it, the diagnostic moved
/// onto the action without its nested payload, and no refactor actions.
#[tokio::test]
async fn code_action_quick_fix_filtering() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///qf.swift");

    h.service.queue_response(
        vocab.requests.editor_open,
        diag_response(
            &h.service,
            vocab.values.diag_stage_parse,
            vec![diag_item(
                &h.service,
                vocab.values.diag_stage_parse,
                "use 'let' here",
                1,
                1,
                Some((0, 3, "let")),
            )],
        ),
    );
    h.open(&u, 1, "var x = 1\n").await;

    let published = h.last_publication(&u).unwrap();
    assert_eq!(published.len(), 1);
    let diagnostic = published[0].clone();
    assert!(diagnostic.data.is_some(), "published diagnostic carries fix-its");

    let actions = h
        .worker
        .code_action(
            u.clone(),
            Range::new(Position::new(0, 0), Position::new(0, 9)),
            Some(vec![CodeActionKind::QUICKFIX]),
            vec![diagnostic],
        )
        .await
        .unwrap();

    assert_eq!(actions.len(), 1);
    let CodeActionOrCommand::CodeAction(action) = &actions[0] else {
        panic!("expected a code action literal");
    };
    assert_eq!(action.kind, Some(CodeActionKind::QUICKFIX));
    let moved = &action.diagnostics.as_ref().unwrap()[0];
    assert_eq!(moved.message, "use 'let' here");
    assert!(moved.data.is_none(), "nested fix-its must be stripped");
    assert!(action.edit.is_some());

    // The refactor provider never ran.
    assert!(h.service.requests_of(vocab.requests.cursorinfo).is_empty());
}

/// Without a filter both providers run and refactor actions surface as
/// commands the client can execute.
#[tokio::test]
async fn code_action_joins_refactors() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///rf.swift");
    h.open(&u, 1, "let s = \"abc\"\n").await;

    let action_uid = h.service.uid("source.refactoring.kind.localize.string");
    h.service.queue_response(
        vocab.requests.cursorinfo,
        SkValue::Dict(
            SkDict::new().with(
                vocab.keys.refactor_actions,
                SkValue::Array(vec![SkValue::Dict(
                    SkDict::new()
                        .with(
                            vocab.keys.actionname,
                            SkValue::String("Localize String".to_string()),
                        )
                        .with(vocab.keys.actionuid, SkValue::Uid(action_uid)),
                )]),
            ),
        ),
    );

    let actions = h
        .worker
        .code_action(
            u.clone(),
            Range::new(Position::new(0, 8), Position::new(0, 8)),
            None,
            Vec::new(),
        )
        .await
        .unwrap();

    assert_eq!(actions.len(), 1);
    let CodeActionOrCommand::CodeAction(action) = &actions[0] else {
        panic!("expected a code action literal");
    };
    assert_eq!(action.kind, Some(CodeActionKind::REFACTOR));
    let command = action.command.as_ref().unwrap();
    assert_eq!(command.command, "swift.semantic.refactor");
    assert!(command.arguments.is_some());
}

/// Completion items map the daemon's result fields.
#[tokio::test]
async fn completion_maps_daemon_results() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///cmp.swift");
    h.open(&u, 1, "self.\n").await;

    h.service.queue_response(
        vocab.requests.codecomplete,
        SkValue::Dict(
            SkDict::new().with(
                vocab.keys.results,
                SkValue::Array(vec![SkValue::Dict(
                    SkDict::new()
                        .with(
                            vocab.keys.description,
                            SkValue::String("count".to_string()),
                        )
                        .with(vocab.keys.typename, SkValue::String("Int".to_string()))
                        .with(
                            vocab.keys.sourcetext,
                            SkValue::String("count".to_string()),
                        )
                        .with(
                            vocab.keys.kind,
                            SkValue::Uid(vocab.values.decl_var_instance),
                        ),
                )]),
            ),
        ),
    );

    let items = h
        .worker
        .completion(u.clone(), Position::new(0, 5))
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, "count");
    assert_eq!(items[0].detail.as_deref(), Some("Int"));
    assert_eq!(items[0].insert_text.as_deref(), Some("count"));

    // The request carried the cursor's UTF-8 offset.
    let requests = h.service.requests_of(vocab.requests.codecomplete);
    assert_eq!(requests[0].int(vocab.keys.offset), Some(5));
}

/// Related identifiers become read highlights.
#[tokio::test]
async fn document_highlight_marks_related_idents() {
    let h = WorkerHarness::new();
    let vocab = h.service.vocabulary().clone();
    let u = uri("file:///hl.swift");
    let text = "let x = 1\nprint(x)\n";
    h.open(&u, 1, text).await;

    h.service.queue_response(
        vocab.requests.relatedidents,
        SkValue::Dict(
            SkDict::new().with(
                vocab.keys.results,
                SkValue::Array(vec![
                    SkValue::Dict(
                        SkDict::new()
                            .with(vocab.keys.offset, SkValue::Int(4))
                            .with(vocab.keys.length, SkValue::Int(1)),
                    ),
                    SkValue::Dict(
                        SkDict::new()
                            .with(vocab.keys.offset, SkValue::Int(16))
                            .with(vocab.keys.length, SkValue::Int(1)),
                    ),
                ]),
            ),
        ),
    );

    let highlights = h
        .worker
        .document_symbol_highlight(u.clone(), Position::new(0, 4))
        .await
        .unwrap();
    assert_eq!(highlights.len(), 2);
    assert_eq!(highlights[0].range.start, Position::new(0, 4));
    assert_eq!(highlights[1].range.start, Position::new(1, 6));
}
