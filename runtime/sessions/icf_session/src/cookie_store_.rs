use std::collections::BTreeMap;
use std::sync::Arc;

use jiff::Timestamp;

use crate::SessionId;
use crate::config::SessionCookieConfig;
use crate::session_::{Session, SessionAnchor, SessionCookie};
use crate::wire::{CONTEXT_ID_COOKIE, RequestCookie, SetCookie};
use errors::NoActiveSession;

/// Holds the security session cookie, and every other cookie ICF asked us to send back.
///
/// It owns the current [`Session`]: forgetting the session here invalidates every
/// snapshot, context and lock that was derived from it.
#[derive(Debug)]
pub struct SessionCookieStore {
    config: SessionCookieConfig,
    inactivity_timeout: Option<std::time::Duration>,
    current: Option<LiveSession>,
    /// Cookies that are neither the session cookie nor the context cookie,
    /// e.g. `sap-usercontext`.
    jar: BTreeMap<String, String>,
}

#[derive(Debug)]
struct LiveSession {
    session: Session,
    // The only strong reference to the session anchor.
    _anchor: Arc<SessionAnchor>,
    csrf_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to the store when a session cookie was set.
pub enum SetOutcome {
    /// A new session generation started.
    /// `previous` is the generation it replaced, if there was one.
    Started { previous: Option<SessionId> },
    /// The cookie matches the current session, only its activity was refreshed.
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// How a `Set-Cookie` received from the server was interpreted.
pub enum ObservedCookie {
    /// The session cookie was set.
    Session(SetOutcome),
    /// The server removed the session cookie.
    /// `previous` is the generation that ended, if there was one.
    SessionRemoved { previous: Option<SessionId> },
    /// The server assigned a stateful context.
    ContextAssigned(String),
    /// The server removed the stateful context.
    ContextRemoved,
    /// Any other cookie, stored (or removed) in the ambient jar.
    Ambient,
}

impl SessionCookieStore {
    /// Create an empty store.
    pub fn new(config: SessionCookieConfig, inactivity_timeout: Option<std::time::Duration>) -> Self {
        Self {
            config,
            inactivity_timeout,
            current: None,
            jar: BTreeMap::new(),
        }
    }

    /// The configuration used to recognise the session cookie.
    pub fn config(&self) -> &SessionCookieConfig {
        &self.config
    }

    /// Set the session cookie, as observed at `observed_at`.
    ///
    /// The same value refreshes the current session.
    /// A different value starts a new session generation: the previous one is
    /// invalidated, together with everything that belongs to it.
    #[tracing::instrument(name = "Set session cookie", level = tracing::Level::TRACE, skip_all)]
    pub fn set(&mut self, cookie: SessionCookie, observed_at: Timestamp) -> SetOutcome {
        if let Some(live) = self.current.as_mut() {
            if live.session.cookie() == &cookie {
                live.session.touch(observed_at);
                return SetOutcome::Refreshed;
            }
        }
        let previous = self.current.take().map(|live| live.session.id());
        let (session, anchor) = Session::new(cookie, observed_at, self.inactivity_timeout);
        tracing::debug!(
            session.id = %session.id(),
            previous = ?previous,
            "Started a new security session"
        );
        self.current = Some(LiveSession {
            session,
            _anchor: anchor,
            csrf_token: None,
        });
        SetOutcome::Started { previous }
    }

    /// A snapshot of the current session, if there is one.
    pub fn get(&self) -> Option<Session> {
        self.current().cloned()
    }

    /// The current session, if there is one.
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref().map(|live| &live.session)
    }

    /// The current session, or an error if no session cookie has been observed.
    pub fn require(&self) -> Result<&Session, NoActiveSession> {
        self.current().ok_or(NoActiveSession)
    }

    /// Refresh the last-activity timestamp of the current session.
    pub fn mark_activity(&mut self, now: Timestamp) -> Result<(), NoActiveSession> {
        let live = self.current.as_mut().ok_or(NoActiveSession)?;
        live.session.touch(now);
        Ok(())
    }

    /// Returns `true` if there is no usable session at `now`: either no session
    /// cookie has been observed, or the advisory inactivity timeout has elapsed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.current() {
            Some(session) => session.is_idle_at(now),
            None => true,
        }
    }

    /// Forget the current session and every ambient cookie.
    ///
    /// Returns the generation that ended, if there was one.
    #[tracing::instrument(name = "Clear session cookie store", level = tracing::Level::TRACE, skip_all)]
    pub fn clear(&mut self) -> Option<SessionId> {
        self.jar.clear();
        self.current.take().map(|live| live.session.id())
    }

    /// The CSRF token bound to the current session, if the server handed one out.
    pub fn csrf_token(&self) -> Option<&str> {
        self.current.as_ref()?.csrf_token.as_deref()
    }

    /// Remember the CSRF token returned by the server.
    ///
    /// It is ignored if there is no current session: tokens are bound to a session.
    pub fn set_csrf_token(&mut self, token: impl Into<String>) {
        if let Some(live) = self.current.as_mut() {
            live.csrf_token = Some(token.into());
        }
    }

    /// Forget the CSRF token, so that the next request fetches a new one.
    pub fn clear_csrf_token(&mut self) {
        if let Some(live) = self.current.as_mut() {
            live.csrf_token = None;
        }
    }

    /// Interpret a `Set-Cookie` sent by the server.
    ///
    /// Context cookies are only classified: contexts are tracked by the
    /// [`ContextManager`](crate::ContextManager).
    pub fn observe(&mut self, cookie: &SetCookie, now: Timestamp) -> ObservedCookie {
        let removal = cookie.is_removal(now);
        if self.config.is_session_cookie(cookie.name()) {
            if removal {
                let previous = self.current.take().map(|live| live.session.id());
                self.jar.clear();
                return ObservedCookie::SessionRemoved { previous };
            }
            let outcome = self.set(SessionCookie::new(cookie.name(), cookie.value()), now);
            return ObservedCookie::Session(outcome);
        }
        if cookie.name() == CONTEXT_ID_COOKIE {
            return if removal {
                ObservedCookie::ContextRemoved
            } else {
                ObservedCookie::ContextAssigned(cookie.value().to_owned())
            };
        }
        if removal {
            self.jar.remove(cookie.name());
        } else {
            self.jar
                .insert(cookie.name().to_owned(), cookie.value().to_owned());
        }
        ObservedCookie::Ambient
    }

    /// The cookies to attach to an outgoing request: the session cookie first,
    /// followed by the ambient ones.
    pub fn request_cookies(&self) -> Result<Vec<RequestCookie>, NoActiveSession> {
        let session = self.require()?;
        let mut cookies = Vec::with_capacity(self.jar.len() + 1);
        cookies.push(session.cookie().to_request_cookie());
        cookies.extend(
            self.jar
                .iter()
                .map(|(name, value)| RequestCookie::new(name.clone(), value.clone())),
        );
        Ok(cookies)
    }
}

/// Errors that can occur when using the session cookie store.
pub mod errors {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    #[error("There is no active security session: no session cookie has been observed")]
    /// No session cookie has been observed, or the session has ended since.
    pub struct NoActiveSession;
}
