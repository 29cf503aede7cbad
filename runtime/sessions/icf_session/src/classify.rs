//! Interpret what a response means for the session, the context and the locks.
//!
//! ICF is not consistent in how it reports failures: an invalid lock handle may come
//! back as a `423 Locked`, a `400`, or even with a successful status.
//! The ADT exception in the payload is therefore looked at before the status code.
use http::StatusCode;
use quick_xml::events::Event;

use crate::operation_::Intent;
use crate::transport_::TransportResponse;
use crate::wire::{CSRF_REQUIRED, CSRF_TOKEN};

/// The root element of the document ADT sends back on failures.
const EXCEPTION_ROOT: &[u8] = b"exc:exception";
/// The ADT exception raised when a lock handle is unknown to the context.
const INVALID_LOCK_HANDLE: &str = "ExceptionResourceInvalidLockHandle";
/// The ADT exception raised when a modification arrives without a usable lock.
const NO_LOCK_HANDLE: &str = "ExceptionResourceNoLockHandle";
/// The ADT exception raised when someone else is editing the object.
const ALREADY_LOCKED: &str = "ExceptionResourceAlreadyLocked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Nothing in the response affects the bookkeeping.
    Proceed,
    /// The security session is gone: re-authentication is required.
    SessionGone,
    /// The context, and every lock in it, is no longer valid.
    ContextInvalid { message: Option<String> },
    /// Another editor holds a lock on the object.
    AlreadyLocked { message: Option<String> },
    /// The CSRF token was missing or stale.
    CsrfRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The `exc:exception` document ADT sends back on failures.
pub(crate) struct AdtException {
    pub(crate) kind: Option<String>,
    pub(crate) message: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ExceptionDocument {
    #[serde(rename = "type")]
    kind: Option<IdAttribute>,
    message: Option<Text>,
    #[serde(rename = "localizedMessage")]
    localized_message: Option<Text>,
}

#[derive(Debug, serde::Deserialize)]
struct IdAttribute {
    #[serde(rename = "@id")]
    id: String,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Text {
    #[serde(rename = "$text")]
    value: String,
}

impl AdtException {
    /// Parse `body` as an ADT exception.
    ///
    /// Returns `None` unless the document root is `exc:exception`: source code and
    /// other payloads are never inspected.
    pub(crate) fn parse(body: &str) -> Option<Self> {
        if !has_exception_root(body) {
            return None;
        }
        let document: ExceptionDocument = quick_xml::de::from_str(body).ok()?;
        let kind = document
            .kind
            .map(|kind| kind.id.trim().to_owned())
            .filter(|kind| !kind.is_empty());
        let message = [document.message, document.localized_message]
            .into_iter()
            .flatten()
            .map(|text| text.value.trim().to_owned())
            .find(|message| !message.is_empty());
        if kind.is_none() && message.is_none() {
            return None;
        }
        Some(Self { kind, message })
    }

    fn is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    fn says_lock_handle_is_invalid(&self) -> bool {
        let Some(message) = &self.message else {
            return false;
        };
        let message = message.to_ascii_lowercase();
        message.contains("lock handle")
            && (message.contains("not valid") || message.contains("invalid"))
    }
}

/// Classify a response to an operation with the given intent.
pub(crate) fn classify(response: &TransportResponse, intent: &Intent) -> Verdict {
    let exception = AdtException::parse(&response.text());
    if let Some(exception) = &exception {
        if exception.is(INVALID_LOCK_HANDLE)
            || exception.is(NO_LOCK_HANDLE)
            || exception.says_lock_handle_is_invalid()
        {
            return Verdict::ContextInvalid {
                message: exception.message.clone(),
            };
        }
        if exception.is(ALREADY_LOCKED) {
            return Verdict::AlreadyLocked {
                message: exception.message.clone(),
            };
        }
    }

    let status = response.status;
    if status == StatusCode::UNAUTHORIZED || is_logon_redirect(response) {
        return Verdict::SessionGone;
    }
    if status == StatusCode::FORBIDDEN {
        let csrf_required = response
            .headers
            .get(CSRF_TOKEN)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(CSRF_REQUIRED.as_bytes()));
        if csrf_required {
            return Verdict::CsrfRequired;
        }
        if matches!(intent, Intent::Lock { .. }) {
            return Verdict::AlreadyLocked {
                message: exception.and_then(|e| e.message),
            };
        }
    }
    Verdict::Proceed
}

/// Whether the first element of `body` is `exc:exception`.
fn has_exception_root(body: &str) -> bool {
    let mut reader = quick_xml::Reader::from_str(body);
    loop {
        match reader.read_event() {
            Ok(Event::Start(element) | Event::Empty(element)) => {
                return element.name().as_ref() == EXCEPTION_ROOT;
            }
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

/// ICF answers unauthenticated requests to protected services with a redirect
/// to its logon application.
fn is_logon_redirect(response: &TransportResponse) -> bool {
    if !response.status.is_redirection() {
        return false;
    }
    response
        .headers
        .get(http::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|location| {
            let location = location.to_ascii_lowercase();
            location.contains("/sap/public/bc/icf/logon") || location.contains("sap-system-login")
        })
}
