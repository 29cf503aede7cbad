use std::sync::{Arc, Weak};

use jiff::Timestamp;

use crate::SessionId;
use crate::wire::RequestCookie;

#[derive(Debug, Clone, PartialEq, Eq)]
/// The cookie carrying the security session, e.g. `SAP_SESSIONID_A4H_001`.
pub struct SessionCookie {
    name: String,
    value: String,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub(crate) fn to_request_cookie(&self) -> RequestCookie {
        RequestCookie::new(self.name.clone(), self.value.clone())
    }
}

/// The allocation that keeps a session generation alive.
///
/// Only the [`SessionCookieStore`](crate::SessionCookieStore) holds a strong reference.
/// Everything that belongs to the session (contexts, and through them locks)
/// holds a [`Weak`] one, so dropping the anchor ends the whole hierarchy at once.
#[derive(Debug)]
pub(crate) struct SessionAnchor {
    id: SessionId,
}

impl Drop for SessionAnchor {
    fn drop(&mut self) {
        tracing::debug!(session.id = %self.id, "Session generation ended");
    }
}

#[derive(Debug, Clone)]
/// A snapshot of the security session the client is currently using.
///
/// Obtained via [`SessionCookieStore::get`](crate::SessionCookieStore::get).
/// A snapshot never keeps the session alive: once the store forgets the session,
/// [`Session::is_alive`] returns `false` for every snapshot taken from it.
pub struct Session {
    id: SessionId,
    cookie: SessionCookie,
    created_at: Timestamp,
    last_activity: Timestamp,
    inactivity_timeout: Option<std::time::Duration>,
    anchor: Weak<SessionAnchor>,
}

impl Session {
    pub(crate) fn new(
        cookie: SessionCookie,
        observed_at: Timestamp,
        inactivity_timeout: Option<std::time::Duration>,
    ) -> (Self, Arc<SessionAnchor>) {
        let id = SessionId::random();
        let anchor = Arc::new(SessionAnchor { id });
        let session = Self {
            id,
            cookie,
            created_at: observed_at,
            last_activity: observed_at,
            inactivity_timeout,
            anchor: Arc::downgrade(&anchor),
        };
        (session, anchor)
    }

    /// The local identifier of this session generation.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The cookie the server uses to recognise the session.
    pub fn cookie(&self) -> &SessionCookie {
        &self.cookie
    }

    /// When the session cookie was first observed.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// When the last successful request was dispatched with this session.
    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    /// The advisory inactivity timeout, if any.
    pub fn inactivity_timeout(&self) -> Option<std::time::Duration> {
        self.inactivity_timeout
    }

    /// Returns `true` if the session hasn't been invalidated yet.
    pub fn is_alive(&self) -> bool {
        self.anchor.strong_count() > 0
    }

    /// Returns `true` if the advisory inactivity timeout has elapsed at `now`.
    pub fn is_idle_at(&self, now: Timestamp) -> bool {
        deadline_passed(self.last_activity, self.inactivity_timeout, now)
    }

    pub(crate) fn anchor(&self) -> Weak<SessionAnchor> {
        self.anchor.clone()
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

/// Returns `true` if `since + timeout` is in the past at `now`.
///
/// A missing timeout never elapses.
pub(crate) fn deadline_passed(
    since: Timestamp,
    timeout: Option<std::time::Duration>,
    now: Timestamp,
) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    match since.checked_add(timeout) {
        Ok(deadline) => deadline <= now,
        // Past the end of representable time: it'll never elapse.
        Err(_) => false,
    }
}
