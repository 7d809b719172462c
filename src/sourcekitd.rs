//! Contract between the language worker and the sourcekitd daemon.
//!
//! Requests and responses are nested dictionaries keyed by opaque UIDs that
//! are only meaningful to one loaded copy of the library, so every name used
//! anywhere in the crate is resolved exactly once into the [`Vocabulary`].
//! The worker talks to the daemon through the [`SwiftService`] trait; the
//! production implementation lives in [`crate::dylib`], tests script a fake.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Opaque UID handle, valid for the lifetime of one loaded library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u64);

/// A sourcekitd request or response value.
#[derive(Debug, Clone, PartialEq)]
pub enum SkValue {
    Null,
    Int(i64),
    Bool(bool),
    String(String),
    Uid(Uid),
    Array(Vec<SkValue>),
    Dict(SkDict),
}

impl SkValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SkValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SkValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SkValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uid(&self) -> Option<Uid> {
        match self {
            SkValue::Uid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[SkValue]> {
        match self {
            SkValue::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&SkDict> {
        match self {
            SkValue::Dict(v) => Some(v),
            _ => None,
        }
    }
}

/// UID-keyed dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkDict(HashMap<Uid, SkValue>);

impl SkDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Uid, value: SkValue) -> &mut Self {
        self.0.insert(key, value);
        self
    }

    pub fn with(mut self, key: Uid, value: SkValue) -> Self {
        self.0.insert(key, value);
        self
    }

    pub fn get(&self, key: Uid) -> Option<&SkValue> {
        self.0.get(&key)
    }

    pub fn int(&self, key: Uid) -> Option<i64> {
        self.get(key).and_then(SkValue::as_int)
    }

    pub fn string(&self, key: Uid) -> Option<&str> {
        self.get(key).and_then(SkValue::as_str)
    }

    pub fn uid(&self, key: Uid) -> Option<Uid> {
        self.get(key).and_then(SkValue::as_uid)
    }

    pub fn array(&self, key: Uid) -> Option<&[SkValue]> {
        self.get(key).and_then(SkValue::as_array)
    }

    pub fn dict(&self, key: Uid) -> Option<&SkDict> {
        self.get(key).and_then(SkValue::as_dict)
    }
}

impl FromIterator<(Uid, SkValue)> for SkDict {
    fn from_iter<T: IntoIterator<Item = (Uid, SkValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Errors crossing the daemon boundary.
///
/// Only `ConnectionInterrupted` drives the worker's recovery state machine;
/// everything else surfaces to the originating request.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("request cancelled")]
    Cancelled,
    #[error("connection to sourcekitd interrupted")]
    ConnectionInterrupted,
    #[error("sourcekitd request failed: {0}")]
    Failed(String),
    #[error("sourcekitd request timed out")]
    TimedOut,
    #[error("sourcekitd is missing required symbol '{0}'")]
    MissingRequiredSymbol(String),
}

pub type ServiceResult = Result<SkValue, ServiceError>;

/// Callback invoked with the result of an asynchronous request. The worker
/// supplies closures that re-post onto its own lane.
pub type ReplyCallback = Box<dyn FnOnce(ServiceResult) + Send>;

/// An unsolicited message from the daemon. Death of the connection is
/// delivered through the same channel as ordinary notifications because the
/// first sign of a crash is often the notification port erroring out.
#[derive(Debug, Clone, PartialEq)]
pub enum SkNotification {
    ConnectionInterrupted,
    Payload(SkValue),
}

/// Callback invoked for every unsolicited daemon notification.
pub type NotificationHandler = Arc<dyn Fn(&SkNotification) + Send + Sync>;

/// Identifies a registered notification handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(pub u64);

/// Capability the worker requires of a compiler-service connection.
pub trait SwiftService: Send + Sync + 'static {
    /// UID namespaces resolved once for this connection.
    fn vocabulary(&self) -> &Vocabulary;

    /// Blocks the calling lane until the daemon replies.
    fn send_sync(&self, request: SkValue) -> ServiceResult;

    /// Returns immediately; `callback` fires exactly once with the result.
    fn send_async(&self, request: SkValue, callback: ReplyCallback);

    fn add_notification_handler(&self, handler: NotificationHandler) -> HandlerId;

    fn remove_notification_handler(&self, id: HandlerId);
}

/// Request keys.
#[derive(Debug, Clone)]
pub struct Keys {
    pub request: Uid,
    pub name: Uid,
    pub sourcetext: Uid,
    pub offset: Uid,
    pub length: Uid,
    pub compilerargs: Uid,
    pub sourcefile: Uid,
    pub syntactic_only: Uid,
    pub enablesyntaxmap: Uid,
    pub enablesubstructure: Uid,
    pub retrieve_refactor_actions: Uid,

    // Response payloads.
    pub results: Uid,
    pub description: Uid,
    pub typename: Uid,
    pub doc_brief: Uid,
    pub diagnostics: Uid,
    pub diagnostic_stage: Uid,
    pub severity: Uid,
    pub ranges: Uid,
    pub fixits: Uid,
    pub line: Uid,
    pub column: Uid,
    pub endline: Uid,
    pub endcolumn: Uid,
    pub substructure: Uid,
    pub kind: Uid,
    pub bodyoffset: Uid,
    pub bodylength: Uid,
    pub nameoffset: Uid,
    pub namelength: Uid,
    pub usr: Uid,
    pub annotated_decl: Uid,
    pub doc_full_as_xml: Uid,
    pub refactor_actions: Uid,
    pub actionname: Uid,
    pub actionuid: Uid,
    pub categorizededits: Uid,
    pub edits: Uid,
    pub text: Uid,
    pub syntaxmap: Uid,
    pub annotations: Uid,
    pub notification: Uid,
}

impl Keys {
    pub fn resolve(uid: &impl Fn(&str) -> Uid) -> Self {
        Self {
            request: uid("key.request"),
            name: uid("key.name"),
            sourcetext: uid("key.sourcetext"),
            offset: uid("key.offset"),
            length: uid("key.length"),
            compilerargs: uid("key.compilerargs"),
            sourcefile: uid("key.sourcefile"),
            syntactic_only: uid("key.syntactic_only"),
            enablesyntaxmap: uid("key.enablesyntaxmap"),
            enablesubstructure: uid("key.enablesubstructure"),
            retrieve_refactor_actions: uid("key.retrieve_refactor_actions"),
            results: uid("key.results"),
            description: uid("key.description"),
            typename: uid("key.typename"),
            doc_brief: uid("key.doc.brief"),
            diagnostics: uid("key.diagnostics"),
            diagnostic_stage: uid("key.diagnostic_stage"),
            severity: uid("key.severity"),
            ranges: uid("key.ranges"),
            fixits: uid("key.fixits"),
            line: uid("key.line"),
            column: uid("key.column"),
            endline: uid("key.endline"),
            endcolumn: uid("key.endcolumn"),
            substructure: uid("key.substructure"),
            kind: uid("key.kind"),
            bodyoffset: uid("key.bodyoffset"),
            bodylength: uid("key.bodylength"),
            nameoffset: uid("key.nameoffset"),
            namelength: uid("key.namelength"),
            usr: uid("key.usr"),
            annotated_decl: uid("key.annotated_decl"),
            doc_full_as_xml: uid("key.doc.full_as_xml"),
            refactor_actions: uid("key.refactor_actions"),
            actionname: uid("key.actionname"),
            actionuid: uid("key.actionuid"),
            categorizededits: uid("key.categorizededits"),
            edits: uid("key.edits"),
            text: uid("key.text"),
            syntaxmap: uid("key.syntaxmap"),
            annotations: uid("key.annotations"),
            notification: uid("key.notification"),
        }
    }
}

/// Request kinds (the values of `key.request`).
#[derive(Debug, Clone)]
pub struct Requests {
    pub editor_open: Uid,
    pub editor_close: Uid,
    pub editor_replacetext: Uid,
    pub relatedidents: Uid,
    pub cursorinfo: Uid,
    pub codecomplete: Uid,
    pub semantic_refactoring: Uid,
    pub crash_exit: Uid,
}

impl Requests {
    pub fn resolve(uid: &impl Fn(&str) -> Uid) -> Self {
        Self {
            editor_open: uid("source.request.editor.open"),
            editor_close: uid("source.request.editor.close"),
            editor_replacetext: uid("source.request.editor.replacetext"),
            relatedidents: uid("source.request.relatedidents"),
            cursorinfo: uid("source.request.cursorinfo"),
            codecomplete: uid("source.request.codecomplete"),
            semantic_refactoring: uid("source.request.semantic.refactoring"),
            crash_exit: uid("source.request.crash_exit"),
        }
    }
}

/// Value UIDs consumed from responses and notifications.
#[derive(Debug, Clone)]
pub struct Values {
    pub notif_sema_enabled: Uid,
    pub notif_documentupdate: Uid,

    pub diag_stage_parse: Uid,
    pub diag_stage_sema: Uid,
    pub severity_note: Uid,
    pub severity_warning: Uid,
    pub severity_error: Uid,

    // Declaration kinds.
    pub decl_module: Uid,
    pub decl_class: Uid,
    pub decl_struct: Uid,
    pub decl_enum: Uid,
    pub decl_enumelement: Uid,
    pub decl_protocol: Uid,
    pub decl_extension: Uid,
    pub decl_typealias: Uid,
    pub decl_associatedtype: Uid,
    pub decl_generic_type_param: Uid,
    pub decl_function_free: Uid,
    pub decl_method_instance: Uid,
    pub decl_method_static: Uid,
    pub decl_method_class: Uid,
    pub decl_var_instance: Uid,
    pub decl_var_static: Uid,
    pub decl_var_class: Uid,
    pub decl_var_global: Uid,
    pub decl_var_local: Uid,
    pub decl_var_parameter: Uid,

    // Reference kinds.
    pub ref_class: Uid,
    pub ref_struct: Uid,
    pub ref_enum: Uid,
    pub ref_protocol: Uid,
    pub ref_var_global: Uid,
    pub ref_var_instance: Uid,
    pub ref_var_local: Uid,
    pub ref_function_free: Uid,
    pub ref_method_instance: Uid,
    pub ref_operator_prefix: Uid,
    pub ref_operator_postfix: Uid,
    pub ref_operator_infix: Uid,

    // Syntax-map token kinds.
    pub syntax_keyword: Uid,
    pub syntax_identifier: Uid,
    pub syntax_typeidentifier: Uid,
    pub syntax_comment: Uid,
    pub syntax_doccomment: Uid,
    pub syntax_string: Uid,
    pub syntax_number: Uid,

    // Expression structure kinds.
    pub expr_object_literal: Uid,
    pub expr_argument: Uid,
    pub expr_call: Uid,
}

impl Values {
    pub fn resolve(uid: &impl Fn(&str) -> Uid) -> Self {
        Self {
            notif_sema_enabled: uid("source.notification.sema_enabled"),
            notif_documentupdate: uid("source.notification.editor.documentupdate"),
            diag_stage_parse: uid("source.diagnostic.stage.swift.parse"),
            diag_stage_sema: uid("source.diagnostic.stage.swift.sema"),
            severity_note: uid("source.diagnostic.severity.note"),
            severity_warning: uid("source.diagnostic.severity.warning"),
            severity_error: uid("source.diagnostic.severity.error"),
            decl_module: uid("source.lang.swift.decl.module"),
            decl_class: uid("source.lang.swift.decl.class"),
            decl_struct: uid("source.lang.swift.decl.struct"),
            decl_enum: uid("source.lang.swift.decl.enum"),
            decl_enumelement: uid("source.lang.swift.decl.enumelement"),
            decl_protocol: uid("source.lang.swift.decl.protocol"),
            decl_extension: uid("source.lang.swift.decl.extension"),
            decl_typealias: uid("source.lang.swift.decl.typealias"),
            decl_associatedtype: uid("source.lang.swift.decl.associatedtype"),
            decl_generic_type_param: uid("source.lang.swift.decl.generic_type_param"),
            decl_function_free: uid("source.lang.swift.decl.function.free"),
            decl_method_instance: uid("source.lang.swift.decl.function.method.instance"),
            decl_method_static: uid("source.lang.swift.decl.function.method.static"),
            decl_method_class: uid("source.lang.swift.decl.function.method.class"),
            decl_var_instance: uid("source.lang.swift.decl.var.instance"),
            decl_var_static: uid("source.lang.swift.decl.var.static"),
            decl_var_class: uid("source.lang.swift.decl.var.class"),
            decl_var_global: uid("source.lang.swift.decl.var.global"),
            decl_var_local: uid("source.lang.swift.decl.var.local"),
            decl_var_parameter: uid("source.lang.swift.decl.var.parameter"),
            ref_class: uid("source.lang.swift.ref.class"),
            ref_struct: uid("source.lang.swift.ref.struct"),
            ref_enum: uid("source.lang.swift.ref.enum"),
            ref_protocol: uid("source.lang.swift.ref.protocol"),
            ref_var_global: uid("source.lang.swift.ref.var.global"),
            ref_var_instance: uid("source.lang.swift.ref.var.instance"),
            ref_var_local: uid("source.lang.swift.ref.var.local"),
            ref_function_free: uid("source.lang.swift.ref.function.free"),
            ref_method_instance: uid("source.lang.swift.ref.function.method.instance"),
            ref_operator_prefix: uid("source.lang.swift.ref.function.operator.prefix"),
            ref_operator_postfix: uid("source.lang.swift.ref.function.operator.postfix"),
            ref_operator_infix: uid("source.lang.swift.ref.function.operator.infix"),
            syntax_keyword: uid("source.lang.swift.syntaxtype.keyword"),
            syntax_identifier: uid("source.lang.swift.syntaxtype.identifier"),
            syntax_typeidentifier: uid("source.lang.swift.syntaxtype.typeidentifier"),
            syntax_comment: uid("source.lang.swift.syntaxtype.comment"),
            syntax_doccomment: uid("source.lang.swift.syntaxtype.doccomment"),
            syntax_string: uid("source.lang.swift.syntaxtype.string"),
            syntax_number: uid("source.lang.swift.syntaxtype.number"),
            expr_object_literal: uid("source.lang.swift.expr.object_literal"),
            expr_argument: uid("source.lang.swift.expr.argument"),
            expr_call: uid("source.lang.swift.expr.call"),
        }
    }
}

/// All three namespaces, resolved once per connection.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub keys: Keys,
    pub requests: Requests,
    pub values: Values,
}

impl Vocabulary {
    pub fn resolve(uid: &impl Fn(&str) -> Uid) -> Self {
        Self {
            keys: Keys::resolve(uid),
            requests: Requests::resolve(uid),
            values: Values::resolve(uid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn vocabulary_resolves_each_name_once() {
        let seen = Mutex::new(HashMap::<String, u64>::new());
        let resolve = |name: &str| {
            let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
            let next = seen.len() as u64;
            let id = *seen.entry(name.to_string()).or_insert(next);
            Uid(id)
        };
        let vocab = Vocabulary::resolve(&resolve);

        // Distinct names get distinct UIDs.
        assert_ne!(vocab.keys.offset, vocab.keys.length);
        assert_ne!(vocab.requests.editor_open, vocab.requests.editor_close);
        assert_ne!(
            vocab.values.diag_stage_parse,
            vocab.values.diag_stage_sema
        );
    }

    #[test]
    fn dict_accessors_tolerate_wrong_types() {
        let key = Uid(1);
        let dict = SkDict::new().with(key, SkValue::String("x".into()));
        assert_eq!(dict.string(key), Some("x"));
        assert_eq!(dict.int(key), None);
        assert_eq!(dict.uid(key), None);
        assert_eq!(dict.array(key), None);
        assert_eq!(dict.int(Uid(99)), None);
    }
}
