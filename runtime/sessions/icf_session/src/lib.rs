/*!
Stateful session, context and lock coordination for SAP ICF endpoints.

# Sessions, contexts and locks

The Internet Communication Framework (ICF) is the HTTP layer of a SAP system.
Most of its services are stateless: every request is processed from scratch and no
state survives it. The ABAP Development Tools (ADT) services are the exception:
editing an object requires a **lock**, and a lock only lives as long as the
**stateful context** that acquired it.

There are three levels of state, each with its own lifetime:

- The **security session**, identified by the `SAP_SESSIONID_<SYSTEM>_<CLIENT>` cookie.
  It ends on logoff or after a period of inactivity configured on the server.
- The **stateful context**, identified by the `sap-contextid` cookie.
  A request runs inside it when it carries the `X-sap-adt-sessiontype: stateful` header.
  It belongs to exactly one security session and can't outlive it.
- The **lock**, identified by the opaque handle returned by a LOCK operation.
  It belongs to exactly one stateful context and can't outlive it.

Expiry cascades downwards: a session that ends takes its contexts with it,
and a context that ends takes its locks with it. It never cascades upwards: a
context can expire while its session is still perfectly usable.

# Architecture

- [`SessionCookieStore`] owns the current session and every cookie the server asked us to send back.
- [`ContextManager`] creates and retires stateful contexts, at most one per session.
- [`LockTracker`] keeps track of the locks, one per object.
- [`RequestCoordinator`] ties everything together: it decides whether an [`Operation`]
  must run in a stateful context, attaches the right cookies and headers,
  sends it via a [`Transport`] and updates the bookkeeping according to the response.

Ownership follows the hierarchy. The store holds the only strong reference to a session,
the context manager the only strong reference to a context: snapshots, context handles
and lock handles hold weak references, so they become invalid as soon as their owner ends.
No server round-trip is required to know that a lock is gone.

# Timeouts

The actual timeouts are profile parameters of the SAP system, and they can't be discovered
by the client. The ones in [`config::SessionStateConfig`] are advisory: the coordinator
always reacts to the expiry signals sent by the server.
*/
mod classify;
pub mod config;
mod context_;
mod cookie_store_;
mod coordinator_;
pub mod fields;
mod id;
mod lock_;
mod operation_;
mod session_;
mod transport_;
pub mod wire;

pub use context_::{ContextHandle, ContextManager, ContextState};
pub use cookie_store_::SessionCookieStore;
pub use coordinator_::{AcquiredLock, RequestCoordinator, Response};
pub use id::{ContextKey, SessionId};
pub use lock_::{LockHandle, LockTracker};
pub use operation_::{AccessMode, Intent, LockResult, ObjectAction, Operation};
pub use session_::{Session, SessionCookie};
pub use transport_::{Transport, TransportRequest, TransportResponse};

pub mod cookie_store {
    //! Types related to [`SessionCookieStore`][super::SessionCookieStore].
    pub use crate::cookie_store_::errors;
    pub use crate::cookie_store_::{ObservedCookie, SetOutcome};
}

pub mod context {
    //! Types related to [`ContextManager`][super::ContextManager].
    pub use crate::context_::errors;
}

pub mod lock {
    //! Types related to [`LockTracker`][super::LockTracker].
    pub use crate::lock_::errors;
}

pub mod coordinator {
    //! Types related to [`RequestCoordinator`][super::RequestCoordinator].
    pub use crate::coordinator_::errors;
}

pub mod operation {
    //! Types related to [`Operation`][super::Operation].
    pub use crate::operation_::LOCK_RESULT_ACCEPT;
    pub use crate::operation_::errors;
}

pub mod transport {
    //! Types related to [`Transport`][super::Transport].
    pub use crate::transport_::errors;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
/// Configure how sessions and stateful contexts are managed.
pub struct IcfSessionConfig {
    #[serde(default)]
    /// Configure how the session cookie is recognised.
    pub cookie: crate::config::SessionCookieConfig,
    #[serde(default)]
    /// Configure the lifetimes of sessions and contexts.
    pub state: crate::config::SessionStateConfig,
}
