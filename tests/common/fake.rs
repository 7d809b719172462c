#![allow(dead_code)]

//! Scripted in-process stand-in for sourcekitd.
//!
//! Default behavior mirrors the daemon closely enough for lifecycle tests:
//! `editor.open`/`editor.replacetext` maintain per-name document text,
//! `cursorinfo` answers with the identifier under the cursor, and
//! `crash_exit` flips the connection into the interrupted state. Tests queue
//! canned responses per request kind for anything richer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use swiftls::sourcekitd::{
    HandlerId, NotificationHandler, ReplyCallback, ServiceError, ServiceResult, SkDict,
    SkNotification, SkValue, SwiftService, Uid, Vocabulary,
};

pub struct FakeSourcekitd {
    vocabulary: Vocabulary,
    inner: Mutex<Inner>,
    next_handler: AtomicU64,
}

struct Inner {
    interner: HashMap<String, u64>,
    documents: HashMap<String, String>,
    crashed: bool,
    handlers: Vec<(u64, NotificationHandler)>,
    queued: HashMap<Uid, VecDeque<SkValue>>,
    log: Vec<SkDict>,
}

impl FakeSourcekitd {
    pub fn new() -> Arc<Self> {
        let interner = Mutex::new(HashMap::<String, u64>::new());
        let vocabulary = Vocabulary::resolve(&|name: &str| {
            let mut map = interner.lock().unwrap_or_else(|e| e.into_inner());
            let next = map.len() as u64 + 1;
            Uid(*map.entry(name.to_string()).or_insert(next))
        });
        Arc::new(Self {
            vocabulary,
            inner: Mutex::new(Inner {
                interner: interner.into_inner().unwrap_or_else(|e| e.into_inner()),
                documents: HashMap::new(),
                crashed: false,
                handlers: Vec::new(),
                queued: HashMap::new(),
                log: Vec::new(),
            }),
            next_handler: AtomicU64::new(1),
        })
    }

    pub fn uid(&self, name: &str) -> Uid {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let next = inner.interner.len() as u64 + 1;
        Uid(*inner.interner.entry(name.to_string()).or_insert(next))
    }

    /// Queue a canned response for the next request of `kind`.
    pub fn queue_response(&self, kind: Uid, response: SkValue) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queued.entry(kind).or_default().push_back(response);
    }

    /// Every request of `kind` received so far.
    pub fn requests_of(&self, kind: Uid) -> Vec<SkDict> {
        let keys = &self.vocabulary.keys;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .log
            .iter()
            .filter(|dict| dict.uid(keys.request) == Some(kind))
            .cloned()
            .collect()
    }

    pub fn document_text(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.documents.get(name).cloned()
    }

    pub fn notify(&self, notification: SkNotification) {
        let handlers: Vec<NotificationHandler> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(&notification);
        }
    }

    /// A daemon message whose `key.notification` is `kind`.
    pub fn notify_kind(&self, kind: Uid) {
        let keys = &self.vocabulary.keys;
        self.notify(SkNotification::Payload(SkValue::Dict(
            SkDict::new().with(keys.notification, SkValue::Uid(kind)),
        )));
    }

    /// The daemon came back: accept requests again and emit the first
    /// message of the new connection.
    pub fn restart(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.crashed = false;
            inner.documents.clear();
        }
        self.notify(SkNotification::Payload(SkValue::Dict(SkDict::new())));
    }

    pub fn notify_sema_enabled(&self) {
        self.notify_kind(self.vocabulary.values.notif_sema_enabled);
    }

    fn default_response(&self, inner: &mut Inner, request: &SkDict) -> ServiceResult {
        let keys = &self.vocabulary.keys;
        let requests = &self.vocabulary.requests;
        let kind = request
            .uid(keys.request)
            .ok_or_else(|| ServiceError::Failed("request without key.request".to_string()))?;

        if kind == requests.editor_open
            || kind == requests.editor_close
            || kind == requests.editor_replacetext
        {
            return Ok(SkValue::Dict(SkDict::new()));
        }
        if kind == requests.relatedidents || kind == requests.codecomplete {
            return Ok(SkValue::Dict(
                SkDict::new().with(keys.results, SkValue::Array(Vec::new())),
            ));
        }
        if kind == requests.cursorinfo {
            let response = request
                .string(keys.sourcefile)
                .and_then(|name| inner.documents.get(name))
                .zip(request.int(keys.offset))
                .and_then(|(text, offset)| identifier_at(text, offset as usize))
                .map(|ident| {
                    SkDict::new()
                        .with(keys.name, SkValue::String(ident.clone()))
                        .with(
                            keys.annotated_decl,
                            SkValue::String(format!("<decl>{ident}</decl>")),
                        )
                })
                .unwrap_or_default();
            return Ok(SkValue::Dict(response));
        }
        if kind == requests.semantic_refactoring {
            return Ok(SkValue::Dict(SkDict::new()));
        }
        if kind == requests.crash_exit {
            inner.crashed = true;
            return Err(ServiceError::ConnectionInterrupted);
        }
        Ok(SkValue::Dict(SkDict::new()))
    }

    /// Side effects every request applies regardless of canned responses.
    fn apply_side_effects(&self, inner: &mut Inner, request: &SkDict) {
        let keys = &self.vocabulary.keys;
        let requests = &self.vocabulary.requests;
        let Some(kind) = request.uid(keys.request) else {
            return;
        };
        if kind == requests.editor_open
            && let (Some(name), Some(text)) =
                (request.string(keys.name), request.string(keys.sourcetext))
        {
            inner.documents.insert(name.to_string(), text.to_string());
        }
        if kind == requests.editor_close
            && let Some(name) = request.string(keys.name)
        {
            inner.documents.remove(name);
        }
        if kind == requests.editor_replacetext
            && let (Some(name), Some(offset), Some(length), Some(text)) = (
                request.string(keys.name),
                request.int(keys.offset),
                request.int(keys.length),
                request.string(keys.sourcetext),
            )
            && let Some(document) = inner.documents.get_mut(name)
        {
            let offset = offset as usize;
            let length = length as usize;
            if offset + length <= document.len() {
                document.replace_range(offset..offset + length, text);
            }
        }
    }
}

fn identifier_at(text: &str, offset: usize) -> Option<String> {
    let bytes = text.as_bytes();
    if offset >= bytes.len() {
        return None;
    }
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    if !is_ident(bytes[offset]) {
        return None;
    }
    let mut start = offset;
    while start > 0 && is_ident(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = offset;
    while end < bytes.len() && is_ident(bytes[end]) {
        end += 1;
    }
    let mut ident = text[start..end].to_string();
    if bytes.get(end) == Some(&b'(') {
        ident.push_str("()");
    }
    Some(ident)
}

impl SwiftService for FakeSourcekitd {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    fn send_sync(&self, request: SkValue) -> ServiceResult {
        let dict = request
            .as_dict()
            .ok_or_else(|| ServiceError::Failed("request must be a dictionary".to_string()))?
            .clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.log.push(dict.clone());

        if inner.crashed {
            let kind = dict.uid(self.vocabulary.keys.request);
            if kind != Some(self.vocabulary.requests.crash_exit) {
                return Err(ServiceError::ConnectionInterrupted);
            }
        }

        self.apply_side_effects(&mut inner, &dict);

        let kind = dict.uid(self.vocabulary.keys.request);
        if let Some(kind) = kind
            && let Some(queue) = inner.queued.get_mut(&kind)
            && let Some(response) = queue.pop_front()
        {
            return Ok(response);
        }
        self.default_response(&mut inner, &dict)
    }

    fn send_async(&self, request: SkValue, callback: ReplyCallback) {
        callback(self.send_sync(request));
    }

    fn add_notification_handler(&self, handler: NotificationHandler) -> HandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handlers
            .push((id, handler));
        HandlerId(id)
    }

    fn remove_notification_handler(&self, id: HandlerId) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handlers
            .retain(|(handler_id, _)| *handler_id != id.0);
    }
}
