//! Header and cookie names used by ICF, and the bits of cookie syntax the coordinator needs.
use http::{HeaderName, HeaderValue};
use jiff::Timestamp;

/// The header used by ADT to ask for (or leave) a stateful context.
pub const SESSION_TYPE: HeaderName = HeaderName::from_static("x-sap-adt-sessiontype");

/// The header carrying the CSRF token bound to the security session.
pub const CSRF_TOKEN: HeaderName = HeaderName::from_static("x-csrf-token");

/// The value sent in [`CSRF_TOKEN`] to ask the server for a fresh token.
pub const CSRF_FETCH: &str = "Fetch";

/// The value the server sends back in [`CSRF_TOKEN`] when the token was missing or stale.
pub const CSRF_REQUIRED: &str = "Required";

/// Every security session cookie starts with this prefix,
/// followed by `<SYSTEM>_<CLIENT>`.
pub const SESSION_COOKIE_PREFIX: &str = "SAP_SESSIONID_";

/// The cookie identifying a stateful context.
pub const CONTEXT_ID_COOKIE: &str = "sap-contextid";

/// The cookie ICF uses to remember the logon client and language.
pub const USER_CONTEXT_COOKIE: &str = "sap-usercontext";

/// The single sign-on ticket cookie.
pub const SSO2_COOKIE: &str = "MYSAPSSO2";

/// The ICF service terminating the security session.
pub const LOGOFF_PATH: &str = "/sap/public/bc/icf/logoff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The value of the [`SESSION_TYPE`] header.
pub enum SessionType {
    /// The request must run inside the stateful context of the session.
    Stateful,
    /// The server keeps no state beyond the lifetime of the request.
    Stateless,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stateful => "stateful",
            Self::Stateless => "stateless",
        }
    }

    pub fn header_value(&self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `name=value` pair sent back to the server in the `Cookie` header.
pub struct RequestCookie {
    pub name: String,
    pub value: String,
}

impl RequestCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for RequestCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Render a list of cookies as the value of a single `Cookie` header.
///
/// Returns `None` if there is nothing to send.
pub fn cookie_header(cookies: &[RequestCookie]) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }
    let rendered: Vec<String> = cookies.iter().map(|c| c.to_string()).collect();
    Some(rendered.join("; "))
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A cookie received from the server via a `Set-Cookie` header.
pub struct SetCookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    expires: Option<Timestamp>,
    max_age: Option<i64>,
}

impl SetCookie {
    /// Parse the value of a `Set-Cookie` header.
    ///
    /// Unknown attributes are ignored, and so is an `Expires` attribute
    /// whose date can't be understood.
    pub fn parse(header: &str) -> Result<Self, errors::CookieParseError> {
        let mut parts = header.split(';');
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| errors::CookieParseError::MissingPair(header.to_owned()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(errors::CookieParseError::EmptyName(header.to_owned()));
        }

        let mut cookie = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            path: None,
            domain: None,
            expires: None,
            max_age: None,
        };
        for attribute in parts {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "path" => cookie.path = Some(value.to_owned()),
                "domain" => cookie.domain = Some(value.to_owned()),
                "expires" => cookie.expires = parse_expires(value),
                "max-age" => cookie.max_age = value.parse().ok(),
                _ => continue,
            }
        }
        Ok(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.expires
    }

    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    /// Returns `true` if the server is asking the client to forget this cookie.
    pub fn is_removal(&self, now: Timestamp) -> bool {
        self.value.is_empty()
            || self.max_age.is_some_and(|age| age <= 0)
            || self.expires.is_some_and(|expires| expires <= now)
    }

    /// Convert the cookie into the pair to send back to the server.
    pub fn to_request_cookie(&self) -> RequestCookie {
        RequestCookie::new(self.name.clone(), self.value.clone())
    }
}

/// ICF uses the Netscape date format (`Tue, 01-Jan-1980 00:00:01 GMT`),
/// other servers in front of it may use the RFC 1123 one.
fn parse_expires(raw: &str) -> Option<Timestamp> {
    const FORMATS: [&str; 2] = ["%a, %d-%b-%Y %H:%M:%S GMT", "%a, %d %b %Y %H:%M:%S GMT"];
    FORMATS.iter().find_map(|format| {
        let datetime = jiff::civil::DateTime::strptime(format, raw).ok()?;
        datetime
            .to_zoned(jiff::tz::TimeZone::UTC)
            .ok()
            .map(|zoned| zoned.timestamp())
    })
}

/// Errors that can occur when parsing cookies.
pub mod errors {
    #[non_exhaustive]
    #[derive(Debug, thiserror::Error)]
    /// The error returned by [`SetCookie::parse`][super::SetCookie::parse].
    pub enum CookieParseError {
        #[error("The cookie `{0}` is not a `name=value` pair")]
        /// The cookie doesn't start with a `name=value` pair.
        MissingPair(String),
        #[error("The cookie `{0}` has an empty name")]
        /// The cookie name is empty.
        EmptyName(String),
    }
}
