use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::wire::{RequestCookie, SetCookie, cookie_header};
use errors::TransportError;

/// The interface of the HTTP client used to talk to the SAP system.
///
/// Implementations must not follow redirects, and they must not keep a cookie jar
/// of their own: cookies are managed by the [`RequestCoordinator`](crate::RequestCoordinator)
/// and every `Set-Cookie` header must be surfaced verbatim.
#[async_trait::async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Send a request and wait for the response.
    ///
    /// A response with a non-2xx status is still a response: an error must only be
    /// returned if no response was received at all.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
/// A request, ready to be sent.
pub struct TransportRequest {
    /// The HTTP method.
    pub method: Method,
    /// The path of the endpoint, including the query string, e.g.
    /// `/sap/bc/adt/programs/programs/z_test?_action=LOCK&accessMode=MODIFY`.
    pub path: String,
    /// The headers to send, cookies excluded.
    pub headers: HeaderMap,
    /// The cookies to send, in order.
    pub cookies: Vec<RequestCookie>,
    /// The body of the request, passed through untouched.
    pub body: Bytes,
}

impl TransportRequest {
    /// The value of the `Cookie` header for this request, if there are cookies to send.
    pub fn cookie_header(&self) -> Option<String> {
        cookie_header(&self.cookies)
    }

    /// The value of the cookie named `name`, if it is part of the request.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|cookie| cookie.name == name)
            .map(|cookie| cookie.value.as_str())
    }
}

#[derive(Debug, Clone)]
/// A response, as received from the server.
pub struct TransportResponse {
    /// The status code.
    pub status: StatusCode,
    /// Every header sent by the server, `Set-Cookie` included.
    pub headers: HeaderMap,
    /// The body of the response.
    pub body: Bytes,
}

impl TransportResponse {
    /// Create a response with no headers and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// The cookies the server asked the client to set, or remove.
    ///
    /// `Set-Cookie` headers that can't be parsed are skipped.
    pub fn set_cookies(&self) -> Vec<SetCookie> {
        self.headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|value| {
                let value = value.to_str().ok()?;
                match SetCookie::parse(value) {
                    Ok(cookie) => Some(cookie),
                    Err(e) => {
                        tracing::debug!(error.message = %e, "Ignoring a malformed `Set-Cookie` header");
                        None
                    }
                }
            })
            .collect()
    }

    /// The body, as UTF-8 text. Invalid sequences are replaced.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Errors that can occur when sending requests.
pub mod errors {
    #[derive(Debug, thiserror::Error)]
    #[error("Failed to send the request to the SAP system")]
    /// No response was received: the connection failed, timed out, etc.
    pub struct TransportError(#[source] anyhow::Error);

    impl TransportError {
        pub fn new(source: impl Into<anyhow::Error>) -> Self {
            Self(source.into())
        }
    }
}
