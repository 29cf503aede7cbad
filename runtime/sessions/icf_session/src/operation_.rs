//! The logical operations a client can ask the [`RequestCoordinator`](crate::RequestCoordinator)
//! to perform, and the payloads it needs to understand.
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::LockHandle;
use crate::wire::LOGOFF_PATH;
use errors::MissingLockHandle;

/// The `Accept` header ADT expects on a LOCK request.
pub const LOCK_RESULT_ACCEPT: &str =
    "application/vnd.sap.as+xml; charset=utf-8; dataname=com.sap.adt.lock.Result2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// How an object is going to be accessed once it is locked.
pub enum AccessMode {
    /// Read-only access.
    Show,
    /// The object is locked for modifications.
    Modify,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Show => "SHOW",
            Self::Modify => "MODIFY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The `_action` an object endpoint is asked to perform.
pub enum ObjectAction {
    Lock,
    Unlock,
}

impl ObjectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Unlock => "UNLOCK",
        }
    }
}

#[derive(Debug, Clone)]
/// What an operation means for the session, context and lock bookkeeping.
pub enum Intent {
    /// Acquire a lock on `object_uri`.
    Lock { object_uri: String },
    /// Release a lock.
    Unlock(LockHandle),
    /// Change an object under a lock.
    Modify(LockHandle),
    /// Terminate the security session.
    Logoff,
    /// Anything else: the response is passed through.
    Plain,
}

impl Intent {
    /// Returns `true` if the operation can only succeed inside a stateful context.
    ///
    /// Locks live in the context that acquired them: acquiring, using and
    /// releasing them must all happen in that context.
    pub fn requires_stateful(&self) -> bool {
        matches!(self, Self::Lock { .. } | Self::Unlock(_) | Self::Modify(_))
    }

    /// The lock the operation depends on, if any.
    pub fn lock_handle(&self) -> Option<&LockHandle> {
        match self {
            Self::Unlock(lock) | Self::Modify(lock) => Some(lock),
            _ => None,
        }
    }

    /// The object the operation is about, if any.
    pub fn object_uri(&self) -> Option<&str> {
        match self {
            Self::Lock { object_uri } => Some(object_uri),
            Self::Unlock(lock) | Self::Modify(lock) => Some(lock.object_uri()),
            Self::Logoff | Self::Plain => None,
        }
    }
}

#[derive(Debug, Clone)]
/// A logical operation against an ICF endpoint.
///
/// Session cookies, context cookies and the session type header are added by the
/// [`RequestCoordinator`](crate::RequestCoordinator): they must not be set here.
pub struct Operation {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    intent: Intent,
}

impl Operation {
    /// A plain operation, with no query parameters, no headers and an empty body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            intent: Intent::Plain,
        }
    }

    /// `GET` an endpoint.
    pub fn read(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Lock the object at `object_uri`, e.g. `/sap/bc/adt/programs/programs/z_test`.
    pub fn lock(object_uri: impl Into<String>, access_mode: AccessMode) -> Self {
        let object_uri = object_uri.into();
        let mut operation = Self::new(Method::POST, object_uri.clone())
            .query("_action", ObjectAction::Lock.as_str())
            .query("accessMode", access_mode.as_str());
        operation.headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static(LOCK_RESULT_ACCEPT),
        );
        operation.intent = Intent::Lock { object_uri };
        operation
    }

    /// Release a lock.
    pub fn unlock(lock: &LockHandle) -> Self {
        let mut operation = Self::new(Method::POST, lock.object_uri())
            .query("_action", ObjectAction::Unlock.as_str())
            .query("lockHandle", lock.token());
        operation.intent = Intent::Unlock(lock.clone());
        operation
    }

    /// `PUT` a new version of a resource of the locked object, e.g. its
    /// `/source/main` include.
    pub fn modify(lock: &LockHandle, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut operation = Self::new(Method::PUT, path)
            .query("lockHandle", lock.token())
            .body(body);
        operation.intent = Intent::Modify(lock.clone());
        operation
    }

    /// Terminate the security session.
    pub fn logoff() -> Self {
        let mut operation = Self::new(Method::GET, LOGOFF_PATH);
        operation.intent = Intent::Logoff;
        operation
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a header, replacing any previous value.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    /// The path, followed by the URL-encoded query string, if there is one.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        let separator = if self.path.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The payload returned by a successful LOCK.
pub struct LockResult {
    /// The handle identifying the lock.
    pub lock_handle: String,
    /// The transport request the object is recorded in, if any.
    pub transport_request: Option<String>,
    /// The owner of that transport request.
    pub transport_user: Option<String>,
    /// The description of that transport request.
    pub transport_text: Option<String>,
    /// Whether the object is a local object, i.e. not transportable.
    pub is_local: bool,
}

/// The `asx:abap` envelope ADT wraps its structured payloads in.
#[derive(Debug, serde::Deserialize)]
struct AsxData<T> {
    #[serde(rename = "asx:values")]
    values: AsxValues<T>,
}

#[derive(Debug, serde::Deserialize)]
struct AsxValues<T> {
    #[serde(rename = "DATA")]
    data: T,
}

/// The `DATA` of a `com.sap.adt.lock.Result2` payload.
///
/// Empty elements, e.g. `<CORRNR/>`, deserialize to empty strings.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LockResultData {
    #[serde(rename = "LOCK_HANDLE")]
    lock_handle: String,
    #[serde(rename = "CORRNR")]
    transport_request: String,
    #[serde(rename = "CORRUSER")]
    transport_user: String,
    #[serde(rename = "CORRTEXT")]
    transport_text: String,
    #[serde(rename = "IS_LOCAL")]
    is_local: String,
}

impl LockResult {
    /// Extract the lock result from an `asx:abap` payload.
    pub fn parse(body: &str) -> Result<Self, MissingLockHandle> {
        let data = quick_xml::de::from_str::<AsxData<LockResultData>>(body)
            .map_err(|_| MissingLockHandle)?
            .values
            .data;
        let non_empty = |value: String| {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_owned())
        };

        Ok(Self {
            lock_handle: non_empty(data.lock_handle).ok_or(MissingLockHandle)?,
            transport_request: non_empty(data.transport_request),
            transport_user: non_empty(data.transport_user),
            transport_text: non_empty(data.transport_text),
            // ABAP booleans: `X` is true, blank is false.
            is_local: data.is_local.trim() == "X",
        })
    }
}

/// Errors that can occur when interpreting operation payloads.
pub mod errors {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    #[error("The LOCK response doesn't contain a lock handle")]
    /// A LOCK succeeded, but its payload has no `LOCK_HANDLE`.
    pub struct MissingLockHandle;
}
