use std::collections::HashMap;
use std::sync::Weak;

use jiff::Timestamp;

use crate::context_::{ContextAnchor, ContextHandle};
use crate::{ContextKey, SessionId};
use errors::{DuplicateLock, LockInvalid, LockInvalidReason, RecordLockError};

#[derive(Debug, Clone)]
/// A server-side lock on one object, acquired inside a stateful context.
///
/// The handle doesn't keep its context alive: once the context ends,
/// [`LockHandle::is_live`] returns `false` and every use of the handle fails
/// with [`LockInvalid`].
pub struct LockHandle {
    object_uri: String,
    token: String,
    context: ContextKey,
    session: SessionId,
    anchor: Weak<ContextAnchor>,
    acquired_at: Timestamp,
}

impl LockHandle {
    /// The URI of the locked object, e.g. `/sap/bc/adt/programs/programs/z_test`.
    pub fn object_uri(&self) -> &str {
        &self.object_uri
    }

    /// The opaque lock handle returned by the server.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The context that owns the lock.
    pub fn context(&self) -> ContextKey {
        self.context
    }

    /// The session generation that owns the lock.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// When the lock was acquired.
    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    /// Returns `true` while the owning context, and its session, are alive.
    pub fn is_live(&self) -> bool {
        self.anchor
            .upgrade()
            .is_some_and(|anchor| anchor.is_session_alive())
    }

    fn same_lock(&self, other: &LockHandle) -> bool {
        self.token == other.token && self.context == other.context
    }
}

/// Keeps track of the locks held by the client, one per object.
#[derive(Debug, Default)]
pub struct LockTracker {
    locks: HashMap<String, LockHandle>,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lock acquired inside `context`.
    ///
    /// ICF allows a single editor per object: if a live lock for the same object
    /// is owned by a different context, the call fails with [`DuplicateLock`].
    /// A lock recorded again by its own context replaces the previous handle.
    #[tracing::instrument(name = "Record lock", level = tracing::Level::TRACE, skip_all)]
    pub fn record_lock(
        &mut self,
        object_uri: impl AsRef<str>,
        token: impl Into<String>,
        context: &ContextHandle,
        now: Timestamp,
    ) -> Result<LockHandle, RecordLockError> {
        let object_uri = object_uri.as_ref();
        if !context.is_live() {
            return Err(LockInvalid {
                object_uri: object_uri.to_owned(),
                reason: LockInvalidReason::ContextEnded,
            }
            .into());
        }
        if let Some(existing) = self.locks.get(object_uri) {
            if existing.is_live() && existing.context != context.key() {
                return Err(DuplicateLock {
                    object_uri: object_uri.to_owned(),
                    holder: Some(existing.context),
                    message: None,
                }
                .into());
            }
        }
        let lock = LockHandle {
            object_uri: object_uri.to_owned(),
            token: token.into(),
            context: context.key(),
            session: context.session_id(),
            anchor: context.anchor(),
            acquired_at: now,
        };
        self.locks.insert(object_uri.to_owned(), lock.clone());
        Ok(lock)
    }

    /// Check that `lock` can still be used.
    ///
    /// No request is sent to the server: a lock whose context has ended is known
    /// to be invalid, and it's dropped from the tracker.
    pub fn validate(&mut self, lock: &LockHandle) -> Result<(), LockInvalid> {
        let invalid = |reason| LockInvalid {
            object_uri: lock.object_uri.clone(),
            reason,
        };
        let Some(tracked) = self.locks.get(&lock.object_uri) else {
            return Err(invalid(if lock.is_live() {
                LockInvalidReason::Released
            } else {
                LockInvalidReason::ContextEnded
            }));
        };
        if !tracked.same_lock(lock) {
            return Err(invalid(LockInvalidReason::Superseded));
        }
        if !lock.is_live() {
            self.locks.remove(&lock.object_uri);
            return Err(invalid(LockInvalidReason::ContextEnded));
        }
        Ok(())
    }

    /// Forget `lock` after a successful UNLOCK.
    ///
    /// Returns `false` if the tracker wasn't holding that lock.
    pub fn release(&mut self, lock: &LockHandle) -> bool {
        let matches = self
            .locks
            .get(&lock.object_uri)
            .is_some_and(|tracked| tracked.same_lock(lock));
        if matches {
            self.locks.remove(&lock.object_uri);
        }
        matches
    }

    /// The lock held on `object_uri`, if any.
    pub fn get(&self, object_uri: &str) -> Option<&LockHandle> {
        self.locks.get(object_uri)
    }

    /// Iterate over the tracked locks, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &LockHandle> {
        self.locks.values()
    }

    /// Drop every lock owned by `context`.
    pub fn forget_context(&mut self, context: ContextKey) -> usize {
        self.forget_where(|lock| lock.context == context)
    }

    /// Drop every lock owned by a context of `session`.
    pub fn forget_session(&mut self, session: SessionId) -> usize {
        self.forget_where(|lock| lock.session == session)
    }

    /// Drop every lock whose context has ended.
    pub fn prune(&mut self) -> usize {
        self.forget_where(|lock| !lock.is_live())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }

    fn forget_where(&mut self, predicate: impl Fn(&LockHandle) -> bool) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| !predicate(lock));
        before - self.locks.len()
    }
}

/// Errors that can occur when tracking locks.
pub mod errors {
    use crate::ContextKey;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("`{object_uri}` is already locked by another editor")]
    /// Another editor holds a live lock on the same object.
    pub struct DuplicateLock {
        /// The object that was already locked.
        pub object_uri: String,
        /// The context holding the lock, if it belongs to this client.
        pub holder: Option<ContextKey>,
        /// The explanation sent by the server, if the conflict was detected server-side.
        pub message: Option<String>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[non_exhaustive]
    /// Why a lock can no longer be used.
    pub enum LockInvalidReason {
        /// The context (or the session) that owned the lock has ended.
        ContextEnded,
        /// The lock was released.
        Released,
        /// The object was locked again, with a different handle.
        Superseded,
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("The lock on `{object_uri}` is no longer valid ({reason:?})")]
    /// A lock handle was used after it stopped being valid.
    pub struct LockInvalid {
        /// The object the lock was taken on.
        pub object_uri: String,
        /// Why the lock is no longer valid.
        pub reason: LockInvalidReason,
    }

    #[non_exhaustive]
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    /// The error returned by [`LockTracker::record_lock`][super::LockTracker::record_lock].
    pub enum RecordLockError {
        #[error(transparent)]
        Duplicate(#[from] DuplicateLock),
        #[error(transparent)]
        /// The context the lock was acquired in has ended already.
        ContextEnded(#[from] LockInvalid),
    }
}
