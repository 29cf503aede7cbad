#![deny(missing_docs)]
//! An HTTP transport for [`icf_session`](https://crates.io/crates/icf_session),
//! implemented using the [`reqwest`](https://crates.io/crates/reqwest) crate.
use std::time::Duration;

use icf_session::transport::errors::TransportError;
use icf_session::{Transport, TransportRequest, TransportResponse};
use reqwest::Url;
use reqwest::header::{COOKIE, HeaderValue, USER_AGENT};
use reqwest_middleware::{ClientWithMiddleware, Middleware};
use reqwest_tracing::TracingMiddleware;

use errors::{ClientBuildError, InvalidBaseUrl, NewTransportError};

/// The query parameter selecting the SAP client (the tenant) on every request.
pub const SAP_CLIENT_PARAM: &str = "sap-client";
/// The query parameter selecting the logon language on every request.
pub const SAP_LANGUAGE_PARAM: &str = "sap-language";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
/// Configuration options for [`ReqwestTransport`].
pub struct ReqwestTransportConfig {
    /// The scheme, host and port of the SAP system, e.g. `https://a4h.example.com:44300`.
    pub base_url: String,
    /// The SAP client to log on to, sent as the `sap-client` query parameter.
    ///
    /// If `None`, the server picks its default client.
    #[serde(default)]
    pub sap_client: Option<String>,
    /// The logon language, sent as the `sap-language` query parameter.
    #[serde(default)]
    pub sap_language: Option<String>,
    /// How long to wait for a response before giving up.
    ///
    /// If `None`, requests never time out.
    #[serde(default = "default_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

impl ReqwestTransportConfig {
    /// A configuration targeting `base_url`, with defaults for everything else.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sap_client: None,
            sap_language: None,
            timeout: default_timeout(),
        }
    }
}

#[derive(Clone)]
/// A [`Transport`] sending requests over HTTP(S) via `reqwest`.
///
/// # Implementation details
///
/// Redirects are never followed and there is no cookie jar: ICF signals expired
/// sessions with redirects to its logon page, and cookies are owned by the
/// [`RequestCoordinator`](icf_session::RequestCoordinator).
/// Every request is traced via [`TracingMiddleware`].
pub struct ReqwestTransport {
    client: ClientWithMiddleware,
    base_url: Url,
    config: ReqwestTransportConfig,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("client", &"<ClientWithMiddleware>")
            .field("config", &self.config)
            .finish()
    }
}

impl ReqwestTransport {
    /// Create a transport with its own HTTP client.
    pub fn new(config: ReqwestTransportConfig) -> Result<Self, NewTransportError> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ClientBuildError(e.into()))?;
        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(UserAgentInjector)
            .with(TracingMiddleware::default())
            .build();
        Self::with_client(client, config).map_err(Into::into)
    }

    /// Create a transport on top of an existing client.
    ///
    /// The client must be configured to not follow redirects and to not
    /// store cookies.
    pub fn with_client(
        client: ClientWithMiddleware,
        config: ReqwestTransportConfig,
    ) -> Result<Self, InvalidBaseUrl> {
        let invalid = || InvalidBaseUrl {
            base_url: config.base_url.clone(),
        };
        let base_url = Url::parse(&config.base_url).map_err(|_| invalid())?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid());
        }
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// The configuration of this transport.
    pub fn config(&self) -> &ReqwestTransportConfig {
        &self.config
    }

    /// The absolute URL for a path (query string included) relative to the system root.
    ///
    /// `sap-client` and `sap-language` are appended, unless the path sets them already.
    fn url(&self, path_and_query: &str) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(path_and_query)
            .map_err(TransportError::new)?;
        let defaults = [
            (SAP_CLIENT_PARAM, self.config.sap_client.as_deref()),
            (SAP_LANGUAGE_PARAM, self.config.sap_language.as_deref()),
        ];
        for (name, value) in defaults {
            let Some(value) = value else {
                continue;
            };
            if !url.query_pairs().any(|(key, _)| key == name) {
                url.query_pairs_mut().append_pair(name, value);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    #[tracing::instrument(name = "Send request to ICF", level = tracing::Level::TRACE, skip_all)]
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = self.url(&request.path)?;
        let cookie_header = request.cookie_header();
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(cookie_header) = cookie_header {
            builder = builder.header(COOKIE, cookie_header);
        }
        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(TransportError::new)?;

        let mut transport_response = TransportResponse::new(response.status());
        transport_response.headers = response.headers().clone();
        transport_response.body = response.bytes().await.map_err(TransportError::new)?;
        Ok(transport_response)
    }
}

/// Inject the crate's user agent into all outgoing requests.
struct UserAgentInjector;

const ICF_SESSION_USER_AGENT: HeaderValue =
    HeaderValue::from_static(concat!("icf-session/", env!("CARGO_PKG_VERSION")));

#[async_trait::async_trait]
impl Middleware for UserAgentInjector {
    async fn handle(
        &self,
        mut req: reqwest::Request,
        extensions: &mut http::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> Result<reqwest::Response, reqwest_middleware::Error> {
        req.headers_mut()
            .entry(USER_AGENT)
            .or_insert(ICF_SESSION_USER_AGENT);
        next.run(req, extensions).await
    }
}

/// Errors that can occur when building a [`ReqwestTransport`].
pub mod errors {
    #[derive(Debug, thiserror::Error)]
    #[error("`{base_url}` is not a valid base URL for a SAP system: expected an absolute `http` or `https` URL")]
    /// The configured base URL can't be parsed, or can't have paths appended to it.
    pub struct InvalidBaseUrl {
        /// The offending base URL.
        pub base_url: String,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("Failed to build the HTTP client")]
    /// `reqwest` refused the client configuration, e.g. because no TLS backend is available.
    pub struct ClientBuildError(#[source] pub(crate) anyhow::Error);

    #[derive(Debug, thiserror::Error)]
    #[non_exhaustive]
    /// The error returned by [`ReqwestTransport::new`](super::ReqwestTransport::new).
    pub enum NewTransportError {
        #[error(transparent)]
        /// See [`InvalidBaseUrl`].
        InvalidBaseUrl(#[from] InvalidBaseUrl),
        #[error(transparent)]
        /// See [`ClientBuildError`].
        ClientBuild(#[from] ClientBuildError),
    }
}
