//! Utilities to log requests sent to ICF with consistent naming and representations.
//!
//! For well-known resources, this module exposes:
//!
//! - A constant holding the conventional field name used when logging that resource
//! - A function to compute the conventional log representation of that resource
//!
//! For example, you have [`HTTP_REQUEST_METHOD`] and [`http_request_method`] for the
//! `http.request.method` field.
//!
//! The naming follows [OpenTelemetry's semantic convention](https://opentelemetry.io/docs/specs/semconv/)
//! whenever possible. ICF-specific fields live under the `icf.` prefix.

use http::{Method, StatusCode};
use tracing::Value;

use crate::ContextKey;
use crate::wire::SessionType;

// Re-export error-related logging fields and the functions to set them.
pub use tracing_log_error::fields::*;

/// The field name for the HTTP method of the outgoing request (if canonical),
/// according to [OpenTelemetry's semantic convention](https://opentelemetry.io/docs/specs/semconv/attributes-registry/http/).
///
/// Use [`http_request_method`] to populate the field.
pub const HTTP_REQUEST_METHOD: &str = "http.request.method";

/// The field name for the HTTP status code of the response,
/// according to [OpenTelemetry's semantic convention](https://opentelemetry.io/docs/specs/semconv/attributes-registry/http/).
///
/// Use [`http_response_status_code`] to populate the field.
pub const HTTP_RESPONSE_STATUS_CODE: &str = "http.response.status_code";

/// The path targeted by the outgoing request,
/// according to [OpenTelemetry's semantic convention](https://opentelemetry.io/docs/specs/semconv/attributes-registry/url/).
pub const URL_PATH: &str = "url.path";

/// Whether the request was sent inside a stateful context.
///
/// Use [`icf_session_type`] to populate the field.
pub const ICF_SESSION_TYPE: &str = "icf.session_type";

/// The local identifier of the stateful context the request was sent in.
///
/// Use [`icf_context_key`] to populate the field.
pub const ICF_CONTEXT_KEY: &str = "icf.context.key";

/// The URI of the object a lock operation is about.
pub const ICF_OBJECT_URI: &str = "icf.object.uri";

/// The canonical representation for the value in [`HTTP_REQUEST_METHOD`].
///
/// If the HTTP method is not canonical, it is set to `_OTHER`.
pub fn http_request_method(method: &Method) -> impl Value + use<> {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::TRACE => "TRACE",
        Method::PATCH => "PATCH",
        Method::CONNECT => "CONNECT",
        Method::HEAD => "HEAD",
        Method::DELETE => "DELETE",
        Method::OPTIONS => "OPTIONS",
        _ => "_OTHER",
    }
}

/// The canonical representation for the value in [`HTTP_RESPONSE_STATUS_CODE`].
pub fn http_response_status_code(status: StatusCode) -> impl Value {
    status.as_u16()
}

/// The canonical representation for the value in [`ICF_SESSION_TYPE`].
pub fn icf_session_type(session_type: SessionType) -> impl Value {
    session_type.as_str()
}

/// The canonical representation for the value in [`ICF_CONTEXT_KEY`].
pub fn icf_context_key(key: ContextKey) -> impl Value {
    tracing::field::display(key)
}
