use std::collections::HashMap;
use std::sync::{Arc, Weak};

use jiff::Timestamp;

use crate::session_::{Session, SessionAnchor, deadline_passed};
use crate::{ContextKey, LockTracker, SessionId};
use errors::ContextMismatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The lifecycle of a stateful context.
///
/// ```text
/// Uninitialized ──> Active ──> Released
///       │              └─────> Expired
///       └──> Released | Expired
/// ```
///
/// `Released` and `Expired` are terminal: a context in either state is never used again.
pub enum ContextState {
    /// The context exists on the client, but the server hasn't assigned
    /// a `sap-contextid` to it yet.
    Uninitialized,
    /// The server assigned a `sap-contextid` to the context.
    Active,
    /// The client ended the context on purpose.
    Released,
    /// The server invalidated the context, the session ended, or the context
    /// outlived its advisory timeout.
    Expired,
}

impl ContextState {
    /// Returns `true` for [`ContextState::Released`] and [`ContextState::Expired`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Expired)
    }
}

/// Keeps a context alive.
///
/// Only the [`ContextManager`] holds a strong reference; locks hold a [`Weak`] one.
#[derive(Debug)]
pub(crate) struct ContextAnchor {
    session: Weak<SessionAnchor>,
}

impl ContextAnchor {
    pub(crate) fn is_session_alive(&self) -> bool {
        self.session.strong_count() > 0
    }
}

#[derive(Debug, Clone)]
/// A reference to a stateful context, handed out by [`ContextManager::ensure_context`].
///
/// It doesn't keep the context alive.
pub struct ContextHandle {
    key: ContextKey,
    session: SessionId,
    anchor: Weak<ContextAnchor>,
}

impl ContextHandle {
    /// The local identifier of the context.
    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// The session generation the context belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Returns `true` if both the context and its session are still alive.
    pub fn is_live(&self) -> bool {
        self.anchor
            .upgrade()
            .is_some_and(|anchor| anchor.is_session_alive())
    }

    pub(crate) fn anchor(&self) -> Weak<ContextAnchor> {
        self.anchor.clone()
    }
}

#[derive(Debug)]
struct Context {
    key: ContextKey,
    anchor: Arc<ContextAnchor>,
    context_id: Option<String>,
    created_at: Timestamp,
    last_used: Timestamp,
}

impl Context {
    fn handle(&self, session: SessionId) -> ContextHandle {
        ContextHandle {
            key: self.key,
            session,
            anchor: Arc::downgrade(&self.anchor),
        }
    }

    fn state(&self) -> ContextState {
        if self.context_id.is_some() {
            ContextState::Active
        } else {
            ContextState::Uninitialized
        }
    }
}

/// Creates, tracks and retires stateful contexts.
///
/// There is at most one live context per session: every stateful request of a
/// session runs in the same context until the context ends.
#[derive(Debug)]
pub struct ContextManager {
    timeout: Option<std::time::Duration>,
    live: HashMap<SessionId, Context>,
    /// The last context each session released.
    released: HashMap<SessionId, ReleasedContext>,
}

#[derive(Debug)]
struct ReleasedContext {
    key: ContextKey,
    session: Weak<SessionAnchor>,
}

impl ContextManager {
    /// Create a manager that retires contexts unused for longer than `timeout`.
    pub fn new(timeout: Option<std::time::Duration>) -> Self {
        Self {
            timeout,
            live: HashMap::new(),
            released: HashMap::new(),
        }
    }

    /// Return the live context of `session`, or start a new one.
    ///
    /// A new context is [`ContextState::Uninitialized`]: the next stateful request
    /// is sent without a context cookie and the server answers with the
    /// `sap-contextid` to record via [`ContextManager::activate`].
    ///
    /// A context that outlived its advisory timeout is retired as expired first.
    /// Its locks become invalid immediately; [`LockTracker::prune`] drops them.
    #[tracing::instrument(name = "Ensure stateful context", level = tracing::Level::TRACE, skip_all)]
    pub fn ensure_context(
        &mut self,
        session: &Session,
        now: Timestamp,
    ) -> Result<ContextHandle, ContextMismatch> {
        if !session.is_alive() {
            return Err(ContextMismatch::SessionEnded {
                session: session.id(),
            });
        }
        self.prune();

        if let Some(context) = self.live.get(&session.id()) {
            if !deadline_passed(context.last_used, self.timeout, now) {
                return Ok(context.handle(session.id()));
            }
            tracing::debug!(
                icf.context.key = %context.key,
                "The stateful context outlived its timeout, starting a new one"
            );
            self.retire(session.id(), ContextState::Expired);
        }

        let context = Context {
            key: ContextKey::random(),
            anchor: Arc::new(ContextAnchor {
                session: session.anchor(),
            }),
            context_id: None,
            created_at: now,
            last_used: now,
        };
        let handle = context.handle(session.id());
        tracing::debug!(
            icf.context.key = %context.key,
            session.id = %session.id(),
            "Created a new stateful context"
        );
        self.live.insert(session.id(), context);
        Ok(handle)
    }

    /// Record the `sap-contextid` the server assigned to the context.
    pub fn activate(
        &mut self,
        handle: &ContextHandle,
        context_id: impl Into<String>,
        now: Timestamp,
    ) -> Result<(), ContextMismatch> {
        let context = self.live_mut(handle)?;
        let context_id = context_id.into();
        if let Some(previous) = context.context_id.as_deref() {
            if previous != context_id {
                tracing::debug!(
                    icf.context.key = %handle.key,
                    "The server assigned a new id to an active stateful context"
                );
            }
        }
        context.context_id = Some(context_id);
        if now > context.last_used {
            context.last_used = now;
        }
        Ok(())
    }

    /// Record that the context was used at `now`.
    pub fn touch(&mut self, handle: &ContextHandle, now: Timestamp) -> Result<(), ContextMismatch> {
        let context = self.live_mut(handle)?;
        if now > context.last_used {
            context.last_used = now;
        }
        Ok(())
    }

    /// The `sap-contextid` of the context, if the server assigned one already.
    pub fn context_id(&self, handle: &ContextHandle) -> Result<Option<&str>, ContextMismatch> {
        Ok(self.live_ref(handle)?.context_id.as_deref())
    }

    /// When the context was created, if it is still live.
    pub fn created_at(&self, handle: &ContextHandle) -> Result<Timestamp, ContextMismatch> {
        Ok(self.live_ref(handle)?.created_at)
    }

    /// Verify that `handle` is the live context of `session`.
    pub fn check(&self, handle: &ContextHandle, session: &Session) -> Result<(), ContextMismatch> {
        if handle.session != session.id() {
            return Err(ContextMismatch::ForeignSession {
                context: handle.key,
                owner: handle.session,
                session: session.id(),
            });
        }
        if !session.is_alive() {
            return Err(ContextMismatch::SessionEnded {
                session: session.id(),
            });
        }
        self.live_ref(handle).map(|_| ())
    }

    /// The live context of `session`, if there is one.
    pub fn current(&self, session: SessionId) -> Option<ContextHandle> {
        self.live
            .get(&session)
            .filter(|context| context.anchor.is_session_alive())
            .map(|context| context.handle(session))
    }

    /// Where the context is in its lifecycle.
    ///
    /// Only the last context released by a session that is still tracked is
    /// reported as released: every other ended or unknown context is reported as expired.
    pub fn state(&self, handle: &ContextHandle) -> ContextState {
        if let Ok(context) = self.live_ref(handle) {
            return context.state();
        }
        let released = self.released.get(&handle.session).is_some_and(|released| {
            released.key == handle.key && released.session.strong_count() > 0
        });
        if released {
            return ContextState::Released;
        }
        ContextState::Expired
    }

    /// End the context on purpose.
    ///
    /// Every lock owned by the context is dropped from `locks`, without any server round-trip.
    /// Returns the number of locks that were dropped.
    #[tracing::instrument(name = "Release stateful context", level = tracing::Level::TRACE, skip_all)]
    pub fn release(&mut self, handle: &ContextHandle, locks: &mut LockTracker) -> usize {
        self.end(handle, ContextState::Released, locks)
    }

    /// Mark the context as invalidated by the server.
    ///
    /// Every lock owned by the context is dropped from `locks`, without any server round-trip.
    /// Returns the number of locks that were dropped.
    #[tracing::instrument(name = "Expire stateful context", level = tracing::Level::TRACE, skip_all)]
    pub fn expire(&mut self, handle: &ContextHandle, locks: &mut LockTracker) -> usize {
        self.end(handle, ContextState::Expired, locks)
    }

    /// Expire the context of a session that has ended, together with its locks.
    pub fn end_session(&mut self, session: SessionId, locks: &mut LockTracker) -> usize {
        let dropped = locks.forget_session(session);
        self.retire(session, ContextState::Expired);
        self.released.remove(&session);
        dropped
    }

    /// Expire every live context, together with every lock.
    pub fn clear(&mut self, locks: &mut LockTracker) -> usize {
        let sessions: Vec<SessionId> = self.live.keys().copied().collect();
        for session in sessions {
            self.retire(session, ContextState::Expired);
        }
        self.released.clear();
        let dropped = locks.len();
        locks.clear();
        dropped
    }

    /// Expire the contexts whose session has ended.
    pub fn prune(&mut self) -> usize {
        let dead: Vec<SessionId> = self
            .live
            .iter()
            .filter(|(_, context)| !context.anchor.is_session_alive())
            .map(|(session, _)| *session)
            .collect();
        for session in &dead {
            self.retire(*session, ContextState::Expired);
        }
        self.released
            .retain(|_, released| released.session.strong_count() > 0);
        dead.len()
    }

    fn end(&mut self, handle: &ContextHandle, state: ContextState, locks: &mut LockTracker) -> usize {
        let dropped = locks.forget_context(handle.key);
        let is_current = self
            .live
            .get(&handle.session)
            .is_some_and(|context| context.key == handle.key);
        if is_current {
            self.retire(handle.session, state);
        }
        dropped
    }

    fn retire(&mut self, session: SessionId, state: ContextState) {
        if let Some(context) = self.live.remove(&session) {
            tracing::debug!(
                icf.context.key = %context.key,
                state = ?state,
                "Stateful context ended"
            );
            if state == ContextState::Released {
                self.released.insert(
                    session,
                    ReleasedContext {
                        key: context.key,
                        session: context.anchor.session.clone(),
                    },
                );
            }
        }
    }

    fn live_ref(&self, handle: &ContextHandle) -> Result<&Context, ContextMismatch> {
        self.live
            .get(&handle.session)
            .filter(|context| context.key == handle.key && context.anchor.is_session_alive())
            .ok_or(ContextMismatch::NotLive {
                context: handle.key,
            })
    }

    fn live_mut(&mut self, handle: &ContextHandle) -> Result<&mut Context, ContextMismatch> {
        self.live
            .get_mut(&handle.session)
            .filter(|context| context.key == handle.key && context.anchor.is_session_alive())
            .ok_or(ContextMismatch::NotLive {
                context: handle.key,
            })
    }
}

/// Errors that can occur when using stateful contexts.
pub mod errors {
    use crate::{ContextKey, SessionId};

    #[non_exhaustive]
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    /// A context was used outside of the session that created it,
    /// or after it ended.
    pub enum ContextMismatch {
        #[error("The stateful context {context} belongs to session {owner}, not to session {session}")]
        /// The context belongs to another session.
        ForeignSession {
            context: ContextKey,
            owner: SessionId,
            session: SessionId,
        },
        #[error("The session {session} has ended, its stateful contexts can't be used")]
        /// The session that owns the context has ended.
        SessionEnded { session: SessionId },
        #[error("The stateful context {context} has ended")]
        /// The context was released or expired.
        NotLive { context: ContextKey },
    }
}
