use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use jiff::Timestamp;
use tokio::sync::Mutex;
use tracing::Instrument;
use tracing_log_error::log_error;

use crate::IcfSessionConfig;
use crate::classify::{Verdict, classify};
use crate::context_::{ContextHandle, ContextManager, ContextState};
use crate::cookie_store_::{ObservedCookie, SessionCookieStore, SetOutcome};
use crate::fields::{
    ERROR_DETAILS, ERROR_MESSAGE, ERROR_SOURCE_CHAIN, HTTP_REQUEST_METHOD,
    HTTP_RESPONSE_STATUS_CODE, ICF_CONTEXT_KEY, ICF_OBJECT_URI, ICF_SESSION_TYPE, URL_PATH,
    error_details, error_message, error_source_chain, http_request_method,
    http_response_status_code, icf_context_key, icf_session_type,
};
use crate::lock_::{LockHandle, LockTracker};
use crate::operation_::{AccessMode, Intent, LockResult, Operation};
use crate::session_::{Session, SessionCookie};
use crate::transport_::{Transport, TransportRequest, TransportResponse};
use crate::wire::{
    CONTEXT_ID_COOKIE, CSRF_FETCH, CSRF_REQUIRED, CSRF_TOKEN, RequestCookie, SESSION_TYPE,
    SessionType,
};
use crate::{ContextKey, SessionId};
use errors::{ContextExpired, CoordinatorError, Rejected, SessionExpired};

/// Sends operations to ICF, keeping the security session, the stateful context
/// and the locks in sync with what the server reports.
///
/// # Serialization
///
/// Stateful operations are serialized: at most one of them is in flight at any
/// time, from the moment its context is resolved until its response has been
/// processed. This is what guarantees that a session never ends up with two
/// stateful contexts.
/// Stateless operations are not serialized.
///
/// # Retries
///
/// - Session-level failures ([`CoordinatorError::SessionExpired`],
///   [`CoordinatorError::NoActiveSession`]) are never retried: they require a new
///   session cookie.
/// - When the server reports that the context expired, the operation is re-issued
///   once in a fresh context, unless it carries a lock handle (the handle died
///   with the context) or [`SessionStateConfig::retry_on_context_expiry`] is disabled.
/// - [`CoordinatorError::DuplicateLock`] is never retried.
///
/// [`SessionStateConfig::retry_on_context_expiry`]: crate::config::SessionStateConfig::retry_on_context_expiry
#[derive(Debug)]
pub struct RequestCoordinator {
    transport: Box<dyn Transport>,
    config: IcfSessionConfig,
    registry: Mutex<Registry>,
    stateful_gate: Mutex<()>,
}

/// The bookkeeping of one logical connection.
#[derive(Debug)]
struct Registry {
    cookies: SessionCookieStore,
    contexts: ContextManager,
    locks: LockTracker,
}

#[derive(Debug, Clone)]
/// A lock acquired through [`RequestCoordinator::lock`].
pub struct AcquiredLock {
    /// The handle to pass to modifications and to [`RequestCoordinator::unlock`].
    pub handle: LockHandle,
    /// What the server reported when granting the lock.
    pub result: LockResult,
}

#[derive(Debug, Clone)]
/// A response that went through the coordinator.
pub struct Response {
    /// The status code of the final attempt.
    pub status: StatusCode,
    /// The response headers, `Set-Cookie` included.
    ///
    /// Cookies have already been applied to the session when the response is returned.
    pub headers: HeaderMap,
    /// The raw payload.
    pub body: Bytes,
    /// Set if the operation acquired a lock.
    pub lock: Option<AcquiredLock>,
}

impl Response {
    /// The body, as UTF-8 text. Invalid sequences are replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

struct Prepared {
    request: TransportRequest,
    session: SessionId,
    context: Option<ContextHandle>,
}

enum Settled {
    Done(Response),
    /// The CSRF token was rejected and has been forgotten.
    CsrfRequired(Rejected),
}

impl RequestCoordinator {
    /// Create a coordinator that sends requests via `transport`.
    ///
    /// There is no session yet: set one via [`RequestCoordinator::set_session_cookie`].
    pub fn new<T>(transport: T, config: IcfSessionConfig) -> Self
    where
        T: Transport + 'static,
    {
        let registry = Registry {
            cookies: SessionCookieStore::new(
                config.cookie.clone(),
                config.state.session_inactivity_timeout,
            ),
            contexts: ContextManager::new(config.state.context_timeout),
            locks: LockTracker::new(),
        };
        Self {
            transport: Box::new(transport),
            config,
            registry: Mutex::new(registry),
            stateful_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &IcfSessionConfig {
        &self.config
    }

    /// Use the session identified by `cookie`, e.g. one obtained by logging in.
    ///
    /// If it is a different session from the current one, everything that belonged
    /// to the current one (context, locks) is invalidated.
    pub async fn set_session_cookie(&self, cookie: SessionCookie) {
        let mut registry = self.registry.lock().await;
        registry.set_session_cookie(cookie, Timestamp::now());
    }

    /// Forget the current session, together with its context and its locks.
    ///
    /// The server isn't notified: use [`RequestCoordinator::logoff`] for that.
    /// Returns the session that was forgotten, if there was one.
    pub async fn clear_session(&self) -> Option<SessionId> {
        let mut registry = self.registry.lock().await;
        registry.end_session()
    }

    /// Send `operation`.
    ///
    /// It runs inside the stateful context of the session if `requires_stateful`
    /// is `true`, or if the operation can only succeed in a stateful context
    /// (LOCK, UNLOCK, and modifications under a lock).
    pub async fn dispatch(
        &self,
        operation: Operation,
        requires_stateful: bool,
    ) -> Result<Response, CoordinatorError> {
        if requires_stateful || operation.intent().requires_stateful() {
            let _gate = self.stateful_gate.lock().await;
            self.run_stateful(&operation).await
        } else {
            self.attempt(&operation, SessionType::Stateless).await
        }
    }

    /// Lock the object at `object_uri`.
    pub async fn lock(
        &self,
        object_uri: impl Into<String>,
        access_mode: AccessMode,
    ) -> Result<AcquiredLock, CoordinatorError> {
        let response = self
            .dispatch(Operation::lock(object_uri, access_mode), true)
            .await?;
        match response.lock {
            Some(lock) => Ok(lock),
            None => Err(Rejected::from_response(&response).into()),
        }
    }

    /// Release a lock.
    pub async fn unlock(&self, lock: &LockHandle) -> Result<Response, CoordinatorError> {
        self.dispatch(Operation::unlock(lock), true).await
    }

    /// `PUT` `body` to `path`, under `lock`.
    pub async fn modify(
        &self,
        lock: &LockHandle,
        path: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Response, CoordinatorError> {
        self.dispatch(Operation::modify(lock, path, body), true).await
    }

    /// `GET` `path`, outside of any stateful context.
    pub async fn read(&self, path: impl Into<String>) -> Result<Response, CoordinatorError> {
        self.dispatch(Operation::read(path), false).await
    }

    /// Lock the object, `PUT` `body` to `path`, and release the lock, without
    /// letting any other stateful operation run in between.
    ///
    /// If the context expires along the way, the whole sequence is started over
    /// once, from the LOCK.
    #[tracing::instrument(name = "Edit object", level = tracing::Level::INFO, skip_all, fields(icf.object.uri = tracing::field::Empty))]
    pub async fn edit(
        &self,
        object_uri: impl Into<String>,
        path: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Response, CoordinatorError> {
        let object_uri = object_uri.into();
        let path = path.into();
        let body = body.into();
        tracing::Span::current().record(ICF_OBJECT_URI, object_uri.as_str());

        let _gate = self.stateful_gate.lock().await;
        match self.edit_once(&object_uri, &path, &body).await {
            Err(e) if e.is_context_level() && self.config.state.retry_on_context_expiry => {
                tracing::info!(
                    error.message = %e,
                    "The stateful context expired while editing, starting over in a fresh context"
                );
                self.edit_once(&object_uri, &path, &body).await
            }
            outcome => outcome,
        }
    }

    /// Terminate the security session.
    ///
    /// The session, its context and its locks are forgotten once the server has
    /// answered, whatever the answer.
    pub async fn logoff(&self) -> Result<Response, CoordinatorError> {
        let _gate = self.stateful_gate.lock().await;
        self.attempt(&Operation::logoff(), SessionType::Stateless).await
    }

    /// End the stateful context of the current session, if there is one.
    ///
    /// Its locks are forgotten immediately, without any server round-trip: using
    /// one of their handles afterwards fails with [`CoordinatorError::LockInvalid`].
    /// Returns the context that was released.
    pub async fn release_context(&self) -> Option<ContextKey> {
        let _gate = self.stateful_gate.lock().await;
        let mut registry = self.registry.lock().await;
        let Registry {
            cookies,
            contexts,
            locks,
        } = &mut *registry;
        let session = cookies.current()?.id();
        let handle = contexts.current(session)?;
        let dropped = contexts.release(&handle, locks);
        tracing::debug!(
            { ICF_CONTEXT_KEY } = icf_context_key(handle.key()),
            dropped_locks = dropped,
            "Released the stateful context"
        );
        Some(handle.key())
    }

    /// A snapshot of the current session, if there is one.
    pub async fn session(&self) -> Option<Session> {
        self.registry.lock().await.cookies.get()
    }

    /// The live stateful context of the current session, if there is one.
    pub async fn current_context(&self) -> Option<ContextHandle> {
        let registry = self.registry.lock().await;
        let session = registry.cookies.current()?.id();
        registry.contexts.current(session)
    }

    /// Where `context` is in its lifecycle.
    pub async fn context_state(&self, context: &ContextHandle) -> ContextState {
        self.registry.lock().await.contexts.state(context)
    }

    /// The locks currently held, in no particular order.
    pub async fn held_locks(&self) -> Vec<LockHandle> {
        let mut registry = self.registry.lock().await;
        registry.locks.prune();
        registry.locks.iter().cloned().collect()
    }

    /// Run a stateful operation, re-issuing it once in a fresh context if the
    /// server reports that the context expired.
    ///
    /// The caller must hold the stateful gate.
    async fn run_stateful(&self, operation: &Operation) -> Result<Response, CoordinatorError> {
        let outcome = self.attempt(operation, SessionType::Stateful).await;
        match outcome {
            Err(CoordinatorError::ContextExpired(e))
                if self.config.state.retry_on_context_expiry
                    && operation.intent().lock_handle().is_none() =>
            {
                tracing::info!(
                    error.message = %e,
                    "The stateful context expired, re-issuing the operation in a fresh context"
                );
                self.attempt(operation, SessionType::Stateful).await
            }
            outcome => outcome,
        }
    }

    async fn edit_once(
        &self,
        object_uri: &str,
        path: &str,
        body: &Bytes,
    ) -> Result<Response, CoordinatorError> {
        let locked = self
            .run_stateful(&Operation::lock(object_uri, AccessMode::Modify))
            .await?;
        let lock = match locked.lock {
            Some(acquired) => acquired.handle,
            None => return Err(Rejected::from_response(&locked).into()),
        };
        let modified = self
            .attempt(
                &Operation::modify(&lock, path, body.clone()),
                SessionType::Stateful,
            )
            .await;
        if let Err(e) = &modified {
            if e.is_context_level() || e.is_session_level() {
                return modified;
            }
        }
        // The lock must be released even if the modification was rejected.
        let unlocked = self
            .attempt(&Operation::unlock(&lock), SessionType::Stateful)
            .await;
        match (modified, unlocked) {
            (Ok(response), Ok(_)) => Ok(response),
            (Err(e), unlocked) => {
                if let Err(unlock_error) = unlocked {
                    log_error!(
                        unlock_error,
                        level: tracing::Level::WARN,
                        "Failed to release a lock after a failed modification"
                    );
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Send an operation once, plus one more time if the CSRF token was stale.
    async fn attempt(
        &self,
        operation: &Operation,
        session_type: SessionType,
    ) -> Result<Response, CoordinatorError> {
        let span = tracing::info_span!(
            "ICF request",
            { HTTP_REQUEST_METHOD } = http_request_method(operation.method()),
            { URL_PATH } = operation.path(),
            { ICF_SESSION_TYPE } = icf_session_type(session_type),
            { ICF_CONTEXT_KEY } = tracing::field::Empty,
            { HTTP_RESPONSE_STATUS_CODE } = tracing::field::Empty,
            { ERROR_MESSAGE } = tracing::field::Empty,
            { ERROR_DETAILS } = tracing::field::Empty,
            { ERROR_SOURCE_CHAIN } = tracing::field::Empty,
        );
        let outcome = self
            .attempt_inner(operation, session_type, &span)
            .instrument(span.clone())
            .await;
        if let Err(e) = &outcome {
            span.record(ERROR_MESSAGE, error_message(e));
            span.record(ERROR_DETAILS, error_details(e));
            span.record(ERROR_SOURCE_CHAIN, error_source_chain(e));
        }
        outcome
    }

    async fn attempt_inner(
        &self,
        operation: &Operation,
        session_type: SessionType,
        span: &tracing::Span,
    ) -> Result<Response, CoordinatorError> {
        let mut csrf_retried = false;
        loop {
            let prepared = {
                let mut registry = self.registry.lock().await;
                registry.prepare(operation, session_type, Timestamp::now())?
            };
            if let Some(context) = &prepared.context {
                span.record(ICF_CONTEXT_KEY, icf_context_key(context.key()));
            }

            let response = match self.transport.send(prepared.request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    log_error!(e, level: tracing::Level::WARN, "Failed to reach the SAP system");
                    return Err(e.into());
                }
            };
            span.record(
                HTTP_RESPONSE_STATUS_CODE,
                http_response_status_code(response.status),
            );

            let mut registry = self.registry.lock().await;
            match registry.settle(operation, &prepared, response, Timestamp::now())? {
                Settled::Done(response) => return Ok(response),
                Settled::CsrfRequired(rejected) => {
                    if csrf_retried {
                        return Err(rejected.into());
                    }
                    tracing::debug!("The CSRF token was rejected, fetching a new one");
                    csrf_retried = true;
                }
            }
        }
    }
}

impl Registry {
    fn set_session_cookie(&mut self, cookie: SessionCookie, now: Timestamp) {
        if let SetOutcome::Started {
            previous: Some(previous),
        } = self.cookies.set(cookie, now)
        {
            self.contexts.end_session(previous, &mut self.locks);
        }
    }

    fn end_session(&mut self) -> Option<SessionId> {
        let previous = self.cookies.clear();
        let dropped = self.contexts.clear(&mut self.locks);
        if previous.is_some() {
            tracing::debug!(dropped_locks = dropped, "The security session ended");
        }
        previous
    }

    /// Resolve the session and the context for an operation, and build the request.
    fn prepare(
        &mut self,
        operation: &Operation,
        session_type: SessionType,
        now: Timestamp,
    ) -> Result<Prepared, CoordinatorError> {
        let session = self.cookies.require()?.clone();
        if session.is_idle_at(now) {
            tracing::debug!(
                session.id = %session.id(),
                "The security session has been idle for longer than its timeout, it may have expired"
            );
        }
        if let Some(lock) = operation.intent().lock_handle() {
            self.locks.validate(lock)?;
        }

        let context = match session_type {
            SessionType::Stateless => None,
            SessionType::Stateful => {
                let context = self.contexts.ensure_context(&session, now)?;
                self.locks.prune();
                if let Some(lock) = operation.intent().lock_handle() {
                    // The context the lock was acquired in outlived its timeout.
                    if lock.context() != context.key() {
                        self.locks.validate(lock)?;
                    }
                }
                Some(context)
            }
        };

        let mut headers = operation.headers().clone();
        headers.insert(SESSION_TYPE, session_type.header_value());
        let csrf_token = match self.cookies.csrf_token() {
            Some(token) => HeaderValue::from_str(token)?,
            None => HeaderValue::from_static(CSRF_FETCH),
        };
        headers.insert(CSRF_TOKEN, csrf_token);

        let mut cookies = self.cookies.request_cookies()?;
        if let Some(context) = &context {
            if let Some(context_id) = self.contexts.context_id(context)? {
                cookies.push(RequestCookie::new(CONTEXT_ID_COOKIE, context_id));
            }
        }

        Ok(Prepared {
            request: TransportRequest {
                method: operation.method().clone(),
                path: operation.path_and_query(),
                headers,
                cookies,
                body: operation.body_bytes().clone(),
            },
            session: session.id(),
            context,
        })
    }

    /// Update the bookkeeping according to the response.
    fn settle(
        &mut self,
        operation: &Operation,
        prepared: &Prepared,
        response: TransportResponse,
        now: Timestamp,
    ) -> Result<Settled, CoordinatorError> {
        let intent = operation.intent();
        if let Intent::Logoff = intent {
            self.end_session();
            return Ok(Settled::Done(Response::from_transport(response, None)));
        }

        let mut session_removed = false;
        let mut context_removed = false;
        for cookie in response.set_cookies() {
            match self.cookies.observe(&cookie, now) {
                ObservedCookie::SessionRemoved { .. } => session_removed = true,
                ObservedCookie::Session(SetOutcome::Started {
                    previous: Some(previous),
                }) => {
                    self.contexts.end_session(previous, &mut self.locks);
                }
                ObservedCookie::ContextAssigned(context_id) => {
                    if let Some(context) = &prepared.context {
                        // A context that ended in the meantime stays ended.
                        let _ = self.contexts.activate(context, context_id, now);
                    }
                }
                ObservedCookie::ContextRemoved => context_removed = true,
                ObservedCookie::Session(_) | ObservedCookie::Ambient => {}
            }
        }
        if let Some(token) = response.headers.get(CSRF_TOKEN) {
            if let Ok(token) = token.to_str() {
                if !token.is_empty() && !token.eq_ignore_ascii_case(CSRF_REQUIRED) {
                    self.cookies.set_csrf_token(token);
                }
            }
        }

        let verdict = if session_removed {
            Verdict::SessionGone
        } else {
            classify(&response, intent)
        };
        match verdict {
            Verdict::SessionGone => {
                self.end_session();
                return Err(SessionExpired {
                    session: prepared.session,
                }
                .into());
            }
            Verdict::ContextInvalid { message } => {
                let context = prepared.context.as_ref().map(|context| {
                    self.contexts.expire(context, &mut self.locks);
                    context.key()
                });
                return Err(ContextExpired { context, message }.into());
            }
            Verdict::AlreadyLocked { message } => {
                return Err(crate::lock_::errors::DuplicateLock {
                    object_uri: intent
                        .object_uri()
                        .unwrap_or(operation.path())
                        .to_owned(),
                    holder: None,
                    message,
                }
                .into());
            }
            Verdict::CsrfRequired => {
                self.cookies.clear_csrf_token();
                return Ok(Settled::CsrfRequired(Rejected::from_transport(&response)));
            }
            Verdict::Proceed => {}
        }

        self.cookies.mark_activity(now)?;
        if let Some(context) = &prepared.context {
            if context_removed {
                self.contexts.expire(context, &mut self.locks);
            } else {
                let _ = self.contexts.touch(context, now);
            }
        }

        let lock = match (intent, &prepared.context) {
            (Intent::Lock { object_uri }, Some(context)) => {
                if !response.status.is_success() {
                    return Err(Rejected::from_transport(&response).into());
                }
                let result = LockResult::parse(&response.text())?;
                let handle = self
                    .locks
                    .record_lock(object_uri, result.lock_handle.clone(), context, now)?;
                tracing::debug!(
                    { ICF_OBJECT_URI } = object_uri.as_str(),
                    "Acquired a lock"
                );
                Some(AcquiredLock { handle, result })
            }
            (Intent::Unlock(lock), _) => {
                if !response.status.is_success() {
                    return Err(Rejected::from_transport(&response).into());
                }
                self.locks.release(lock);
                None
            }
            _ => None,
        };
        Ok(Settled::Done(Response::from_transport(response, lock)))
    }
}

impl Response {
    fn from_transport(response: TransportResponse, lock: Option<AcquiredLock>) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            lock,
        }
    }
}

impl Rejected {
    fn from_transport(response: &TransportResponse) -> Self {
        Self {
            status: response.status,
            body: response.text().into_owned(),
        }
    }

    fn from_response(response: &Response) -> Self {
        Self {
            status: response.status,
            body: response.text().into_owned(),
        }
    }
}

/// Errors that can occur when coordinating requests.
pub mod errors {
    use http::StatusCode;

    use crate::context_::errors::ContextMismatch;
    use crate::cookie_store_::errors::NoActiveSession;
    use crate::lock_::errors::{DuplicateLock, LockInvalid, RecordLockError};
    use crate::operation_::errors::MissingLockHandle;
    use crate::transport_::errors::TransportError;
    use crate::{ContextKey, SessionId};

    #[non_exhaustive]
    #[derive(Debug, thiserror::Error)]
    /// The error returned by [`RequestCoordinator::dispatch`][super::RequestCoordinator::dispatch].
    pub enum CoordinatorError {
        #[error(transparent)]
        NoActiveSession(#[from] NoActiveSession),
        #[error(transparent)]
        ContextMismatch(#[from] ContextMismatch),
        #[error(transparent)]
        DuplicateLock(#[from] DuplicateLock),
        #[error(transparent)]
        LockInvalid(#[from] LockInvalid),
        #[error(transparent)]
        SessionExpired(#[from] SessionExpired),
        #[error(transparent)]
        ContextExpired(#[from] ContextExpired),
        #[error(transparent)]
        Transport(#[from] TransportError),
        #[error("A value can't be sent as an HTTP header")]
        InvalidHeader(#[from] http::header::InvalidHeaderValue),
        #[error(transparent)]
        Rejected(#[from] Rejected),
        #[error(transparent)]
        MalformedLockResult(#[from] MissingLockHandle),
    }

    impl CoordinatorError {
        /// Returns `true` if the security session is unusable: a new session
        /// cookie is required before anything else can succeed.
        pub fn is_session_level(&self) -> bool {
            matches!(self, Self::NoActiveSession(_) | Self::SessionExpired(_))
        }

        /// Returns `true` if the stateful context is unusable, while the security
        /// session may still be fine.
        pub fn is_context_level(&self) -> bool {
            matches!(self, Self::ContextExpired(_) | Self::LockInvalid(_))
        }
    }

    impl From<RecordLockError> for CoordinatorError {
        fn from(e: RecordLockError) -> Self {
            match e {
                RecordLockError::Duplicate(e) => e.into(),
                RecordLockError::ContextEnded(e) => e.into(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("The security session {session} has expired, a new session cookie is required")]
    /// The server reported that the security session is gone.
    pub struct SessionExpired {
        /// The session generation that ended.
        pub session: SessionId,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("The stateful context is no longer valid on the server")]
    /// The server reported that the stateful context, and its locks, are gone.
    pub struct ContextExpired {
        /// The context that expired, if the request was sent in one.
        pub context: Option<ContextKey>,
        /// The explanation sent by the server, if any.
        pub message: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("The SAP system rejected the request with status {status}")]
    /// The server refused an operation for a reason that doesn't affect the session or the context.
    pub struct Rejected {
        pub status: StatusCode,
        pub body: String,
    }
}
