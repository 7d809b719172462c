//! FFI adapter for the sourcekitd dynamic library.
//!
//! A process-wide registry deduplicates loaded copies by canonical path so
//! multiple workers share one connection. The first requester opens the
//! library; dropping the last [`Arc`] closes it.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use libloading::Library;

use crate::sourcekitd::{
    HandlerId, NotificationHandler, ReplyCallback, ServiceError, ServiceResult, SkDict,
    SkNotification, SkValue, SwiftService, Uid, Vocabulary,
};

type RawUid = *mut c_void;
type RawObject = *mut c_void;
type RawResponse = *mut c_void;

/// `sourcekitd_variant_t` is three words passed by value.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawVariant {
    data: [u64; 3],
}

const VARIANT_TYPE_DICTIONARY: i32 = 1;
const VARIANT_TYPE_ARRAY: i32 = 2;
const VARIANT_TYPE_INT64: i32 = 3;
const VARIANT_TYPE_STRING: i32 = 4;
const VARIANT_TYPE_UID: i32 = 5;
const VARIANT_TYPE_BOOL: i32 = 6;

const ERROR_CONNECTION_INTERRUPTED: i32 = 1;
const ERROR_REQUEST_INVALID: i32 = 2;
const ERROR_REQUEST_FAILED: i32 = 3;
const ERROR_REQUEST_CANCELLED: i32 = 4;

/// Appends when passed as the index to `request_array_set_value`.
const ARRAY_APPEND: usize = usize::MAX;

/// Function pointers resolved from the library. The owning
/// [`SourcekitdClient`] keeps the [`Library`] alive for as long as these are
/// callable.
#[derive(Clone, Copy)]
#[allow(clippy::type_complexity)]
struct Api {
    initialize: unsafe extern "C" fn(),
    shutdown: unsafe extern "C" fn(),
    uid_get_from_cstr: unsafe extern "C" fn(*const c_char) -> RawUid,
    request_dictionary_create:
        unsafe extern "C" fn(*const RawUid, *const RawObject, usize) -> RawObject,
    request_dictionary_set_value: unsafe extern "C" fn(RawObject, RawUid, RawObject),
    request_array_create: unsafe extern "C" fn(*const RawObject, usize) -> RawObject,
    request_array_set_value: unsafe extern "C" fn(RawObject, usize, RawObject),
    request_string_create: unsafe extern "C" fn(*const c_char) -> RawObject,
    request_int64_create: unsafe extern "C" fn(i64) -> RawObject,
    request_uid_create: unsafe extern "C" fn(RawUid) -> RawObject,
    request_release: unsafe extern "C" fn(RawObject),
    send_request_sync: unsafe extern "C" fn(RawObject) -> RawResponse,
    set_notification_handler: unsafe extern "C" fn(extern "C" fn(RawResponse)),
    response_is_error: unsafe extern "C" fn(RawResponse) -> bool,
    response_error_get_kind: unsafe extern "C" fn(RawResponse) -> i32,
    response_error_get_description: unsafe extern "C" fn(RawResponse) -> *const c_char,
    response_get_value: unsafe extern "C" fn(RawResponse) -> RawVariant,
    response_dispose: unsafe extern "C" fn(RawResponse),
    variant_get_type: unsafe extern "C" fn(RawVariant) -> i32,
    variant_dictionary_get_value: unsafe extern "C" fn(RawVariant, RawUid) -> RawVariant,
    variant_array_get_count: unsafe extern "C" fn(RawVariant) -> usize,
    variant_array_get_value: unsafe extern "C" fn(RawVariant, usize) -> RawVariant,
    variant_int64_get_value: unsafe extern "C" fn(RawVariant) -> i64,
    variant_bool_get_value: unsafe extern "C" fn(RawVariant) -> bool,
    variant_string_get_ptr: unsafe extern "C" fn(RawVariant) -> *const c_char,
    variant_string_get_length: unsafe extern "C" fn(RawVariant) -> usize,
    variant_uid_get_value: unsafe extern "C" fn(RawVariant) -> RawUid,
}

macro_rules! symbol {
    ($lib:expr, $name:literal) => {
        unsafe {
            $lib.get(concat!($name, "\0").as_bytes())
                .map(|s| *s)
                .map_err(|_| ServiceError::MissingRequiredSymbol($name.to_string()))?
        }
    };
}

impl Api {
    fn load(lib: &Library) -> Result<Self, ServiceError> {
        Ok(Self {
            initialize: symbol!(lib, "sourcekitd_initialize"),
            shutdown: symbol!(lib, "sourcekitd_shutdown"),
            uid_get_from_cstr: symbol!(lib, "sourcekitd_uid_get_from_cstr"),
            request_dictionary_create: symbol!(lib, "sourcekitd_request_dictionary_create"),
            request_dictionary_set_value: symbol!(lib, "sourcekitd_request_dictionary_set_value"),
            request_array_create: symbol!(lib, "sourcekitd_request_array_create"),
            request_array_set_value: symbol!(lib, "sourcekitd_request_array_set_value"),
            request_string_create: symbol!(lib, "sourcekitd_request_string_create"),
            request_int64_create: symbol!(lib, "sourcekitd_request_int64_create"),
            request_uid_create: symbol!(lib, "sourcekitd_request_uid_create"),
            request_release: symbol!(lib, "sourcekitd_request_release"),
            send_request_sync: symbol!(lib, "sourcekitd_send_request_sync"),
            set_notification_handler: symbol!(lib, "sourcekitd_set_notification_handler"),
            response_is_error: symbol!(lib, "sourcekitd_response_is_error"),
            response_error_get_kind: symbol!(lib, "sourcekitd_response_error_get_kind"),
            response_error_get_description: symbol!(
                lib,
                "sourcekitd_response_error_get_description"
            ),
            response_get_value: symbol!(lib, "sourcekitd_response_get_value"),
            response_dispose: symbol!(lib, "sourcekitd_response_dispose"),
            variant_get_type: symbol!(lib, "sourcekitd_variant_get_type"),
            variant_dictionary_get_value: symbol!(lib, "sourcekitd_variant_dictionary_get_value"),
            variant_array_get_count: symbol!(lib, "sourcekitd_variant_array_get_count"),
            variant_array_get_value: symbol!(lib, "sourcekitd_variant_array_get_value"),
            variant_int64_get_value: symbol!(lib, "sourcekitd_variant_int64_get_value"),
            variant_bool_get_value: symbol!(lib, "sourcekitd_variant_bool_get_value"),
            variant_string_get_ptr: symbol!(lib, "sourcekitd_variant_string_get_ptr"),
            variant_string_get_length: symbol!(lib, "sourcekitd_variant_string_get_length"),
            variant_uid_get_value: symbol!(lib, "sourcekitd_variant_uid_get_value"),
        })
    }
}

impl std::fmt::Debug for SourcekitdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcekitdClient").finish_non_exhaustive()
    }
}

/// One loaded sourcekitd library shared by every worker in the process.
pub struct SourcekitdClient {
    api: Api,
    vocabulary: Vocabulary,
    /// Every `key.*` UID we ever consume. Dictionary enumeration in the C API
    /// requires a block callback; probing the known key set is equivalent for
    /// the keys this crate reads.
    probe_keys: Vec<Uid>,
    handlers: Mutex<Vec<(u64, NotificationHandler)>>,
    next_handler: AtomicU64,
    path: PathBuf,
    _lib: Library,
}

/// The notification trampoline has no context argument, so the active client
/// is reachable through a process-global weak reference.
static ACTIVE_CLIENT: Mutex<Option<Weak<SourcekitdClient>>> = Mutex::new(None);

extern "C" fn notification_trampoline(response: RawResponse) {
    let client = {
        let active = ACTIVE_CLIENT.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().and_then(Weak::upgrade)
    };
    let Some(client) = client else { return };

    let notification = unsafe {
        if response.is_null() || (client.api.response_is_error)(response) {
            let interrupted = response.is_null()
                || (client.api.response_error_get_kind)(response) == ERROR_CONNECTION_INTERRUPTED;
            if !response.is_null() {
                (client.api.response_dispose)(response);
            }
            if !interrupted {
                return;
            }
            SkNotification::ConnectionInterrupted
        } else {
            let value = client.variant_to_value((client.api.response_get_value)(response));
            (client.api.response_dispose)(response);
            SkNotification::Payload(value)
        }
    };
    client.dispatch_notification(&notification);
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<SourcekitdClient>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<SourcekitdClient>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Canonical form of a dylib path, used as the registry key.
pub fn canonical_dylib_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Load (or reuse) the library at `path`.
pub fn shared_client(path: &Path) -> Result<Arc<SourcekitdClient>, ServiceError> {
    let canonical = canonical_dylib_path(path);
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());

    if let Some(existing) = reg.get(&canonical).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let client = Arc::new(SourcekitdClient::open(&canonical)?);
    reg.insert(canonical, Arc::downgrade(&client));

    *ACTIVE_CLIENT.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&client));
    unsafe { (client.api.set_notification_handler)(notification_trampoline) };

    Ok(client)
}

impl SourcekitdClient {
    fn open(path: &Path) -> Result<Self, ServiceError> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| ServiceError::Failed(format!("failed to load {}: {e}", path.display())))?;
        let api = Api::load(&lib)?;

        unsafe { (api.initialize)() };

        let resolved: Mutex<Vec<(String, Uid)>> = Mutex::new(Vec::new());
        let resolve = |name: &str| {
            let cstr = CString::new(name).unwrap_or_default();
            let raw = unsafe { (api.uid_get_from_cstr)(cstr.as_ptr()) };
            let uid = Uid(raw as u64);
            resolved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((name.to_string(), uid));
            uid
        };
        let vocabulary = Vocabulary::resolve(&resolve);
        let probe_keys = resolved
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_iter()
            .filter(|(name, _)| name.starts_with("key."))
            .map(|(_, uid)| uid)
            .collect();

        Ok(Self {
            api,
            vocabulary,
            probe_keys,
            handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            path: path.to_path_buf(),
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dispatch_notification(&self, value: &SkNotification) {
        let handlers: Vec<NotificationHandler> = {
            let guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in handlers {
            handler(value);
        }
    }

    /// Build a retained request object. The caller releases it.
    fn value_to_request(&self, value: &SkValue) -> Result<RawObject, ServiceError> {
        unsafe {
            match value {
                SkValue::Null => {
                    Err(ServiceError::Failed("null value in request".to_string()))
                }
                SkValue::Int(v) => Ok((self.api.request_int64_create)(*v)),
                SkValue::Bool(v) => Ok((self.api.request_int64_create)(i64::from(*v))),
                SkValue::Uid(v) => Ok((self.api.request_uid_create)(v.0 as RawUid)),
                SkValue::String(v) => {
                    let cstr = CString::new(v.as_str())
                        .map_err(|_| ServiceError::Failed("string contains NUL".to_string()))?;
                    Ok((self.api.request_string_create)(cstr.as_ptr()))
                }
                SkValue::Array(items) => {
                    let array = (self.api.request_array_create)(std::ptr::null(), 0);
                    for item in items {
                        let raw = self.value_to_request(item)?;
                        (self.api.request_array_set_value)(array, ARRAY_APPEND, raw);
                        (self.api.request_release)(raw);
                    }
                    Ok(array)
                }
                SkValue::Dict(dict) => {
                    let out = (self.api.request_dictionary_create)(
                        std::ptr::null(),
                        std::ptr::null(),
                        0,
                    );
                    for key in &self.probe_keys {
                        if let Some(entry) = dict.get(*key) {
                            let raw = self.value_to_request(entry)?;
                            (self.api.request_dictionary_set_value)(out, key.0 as RawUid, raw);
                            (self.api.request_release)(raw);
                        }
                    }
                    Ok(out)
                }
            }
        }
    }

    unsafe fn variant_to_value(&self, variant: RawVariant) -> SkValue {
        unsafe {
            match (self.api.variant_get_type)(variant) {
                VARIANT_TYPE_INT64 => SkValue::Int((self.api.variant_int64_get_value)(variant)),
                VARIANT_TYPE_BOOL => SkValue::Bool((self.api.variant_bool_get_value)(variant)),
                VARIANT_TYPE_UID => {
                    SkValue::Uid(Uid((self.api.variant_uid_get_value)(variant) as u64))
                }
                VARIANT_TYPE_STRING => {
                    let ptr = (self.api.variant_string_get_ptr)(variant);
                    let len = (self.api.variant_string_get_length)(variant);
                    if ptr.is_null() {
                        SkValue::String(String::new())
                    } else {
                        let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), len);
                        SkValue::String(String::from_utf8_lossy(bytes).into_owned())
                    }
                }
                VARIANT_TYPE_ARRAY => {
                    let count = (self.api.variant_array_get_count)(variant);
                    let items = (0..count)
                        .map(|i| {
                            self.variant_to_value((self.api.variant_array_get_value)(variant, i))
                        })
                        .collect();
                    SkValue::Array(items)
                }
                VARIANT_TYPE_DICTIONARY => {
                    let mut dict = SkDict::new();
                    for key in &self.probe_keys {
                        let entry =
                            (self.api.variant_dictionary_get_value)(variant, key.0 as RawUid);
                        if (self.api.variant_get_type)(entry) != 0 {
                            dict.set(*key, self.variant_to_value(entry));
                        }
                    }
                    SkValue::Dict(dict)
                }
                _ => SkValue::Null,
            }
        }
    }

    fn response_error(&self, response: RawResponse) -> ServiceError {
        unsafe {
            let kind = (self.api.response_error_get_kind)(response);
            match kind {
                ERROR_CONNECTION_INTERRUPTED => ServiceError::ConnectionInterrupted,
                ERROR_REQUEST_CANCELLED => ServiceError::Cancelled,
                ERROR_REQUEST_INVALID | ERROR_REQUEST_FAILED => {
                    let desc = (self.api.response_error_get_description)(response);
                    let message = if desc.is_null() {
                        "request failed".to_string()
                    } else {
                        CStr::from_ptr(desc).to_string_lossy().into_owned()
                    };
                    ServiceError::Failed(message)
                }
                other => ServiceError::Failed(format!("unknown error kind {other}")),
            }
        }
    }
}

impl Drop for SourcekitdClient {
    fn drop(&mut self) {
        unsafe { (self.api.shutdown)() };
    }
}

impl SwiftService for SourcekitdClient {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    fn send_sync(&self, request: SkValue) -> ServiceResult {
        let raw = self.value_to_request(&request)?;
        unsafe {
            let response = (self.api.send_request_sync)(raw);
            (self.api.request_release)(raw);
            if response.is_null() {
                return Err(ServiceError::ConnectionInterrupted);
            }
            if (self.api.response_is_error)(response) {
                let err = self.response_error(response);
                (self.api.response_dispose)(response);
                return Err(err);
            }
            let value = self.variant_to_value((self.api.response_get_value)(response));
            (self.api.response_dispose)(response);
            Ok(value)
        }
    }

    fn send_async(&self, request: SkValue, callback: ReplyCallback) {
        // The C async entry point wants a dispatch block; a detached thread
        // over the sync call gives the same completion contract.
        let client = {
            let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
            reg.get(&self.path).and_then(Weak::upgrade)
        };
        std::thread::spawn(move || match client {
            Some(client) => callback(client.send_sync(request)),
            None => callback(Err(ServiceError::ConnectionInterrupted)),
        });
    }

    fn add_notification_handler(&self, handler: NotificationHandler) -> HandlerId {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        HandlerId(id)
    }

    fn remove_notification_handler(&self, id: HandlerId) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(handler_id, _)| *handler_id != id.0);
    }
}
