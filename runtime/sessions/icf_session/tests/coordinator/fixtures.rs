use std::collections::VecDeque;
use std::sync::Arc;

use icf_session::config::SessionCookieConfig;
use icf_session::transport::errors::TransportError;
use icf_session::{
    IcfSessionConfig, RequestCoordinator, SessionCookie, Transport, TransportRequest,
    TransportResponse,
};
use tokio::sync::Mutex;

pub const SESSION_COOKIE: &str = "SAP_SESSIONID_A4H_001";
pub const Z_TEST: &str = "/sap/bc/adt/programs/programs/z_test";
pub const Z_TEST_SOURCE: &str = "/sap/bc/adt/programs/programs/z_test/source/main";

/// The configuration used by most tests: the session cookie is pinned to `A4H`, client `001`.
pub fn config() -> IcfSessionConfig {
    let mut config = IcfSessionConfig::default();
    config.cookie = SessionCookieConfig::new("A4H", "001").unwrap();
    config
}

pub fn session_cookie() -> SessionCookie {
    SessionCookie::new(SESSION_COOKIE, "initial")
}

/// A coordinator without a session, talking to a scripted transport.
pub fn coordinator_with(config: IcfSessionConfig) -> (RequestCoordinator, CallTracker) {
    let transport = ScriptedTransport::default();
    let call_tracker = transport.call_tracker();
    (RequestCoordinator::new(transport, config), call_tracker)
}

/// A coordinator with a live session, talking to a scripted transport.
pub async fn logged_in() -> (RequestCoordinator, CallTracker) {
    logged_in_with(config()).await
}

pub async fn logged_in_with(config: IcfSessionConfig) -> (RequestCoordinator, CallTracker) {
    let (coordinator, call_tracker) = coordinator_with(config);
    coordinator.set_session_cookie(session_cookie()).await;
    (coordinator, call_tracker)
}

/// A transport that records every request it receives and answers with the
/// responses it was scripted with, in order.
///
/// Once the script is exhausted, it answers `200 OK` with an empty body.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    call_tracker: CallTracker,
}

impl ScriptedTransport {
    pub fn call_tracker(&self) -> CallTracker {
        self.call_tracker.clone()
    }
}

#[derive(Debug)]
enum Scripted {
    Response(TransportResponse),
    Failure(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct CallTracker(Arc<Mutex<CallInformation>>);

#[derive(Debug, Default)]
pub struct CallInformation {
    requests: Vec<TransportRequest>,
    script: VecDeque<Scripted>,
}

impl CallTracker {
    /// Queue the response to the next request.
    pub async fn respond(&self, response: TransportResponse) {
        self.0
            .lock()
            .await
            .script
            .push_back(Scripted::Response(response));
    }

    /// Fail the next request without a response.
    pub async fn fail(&self, reason: &'static str) {
        self.0.lock().await.script.push_back(Scripted::Failure(reason));
    }

    /// Every request sent so far, in order.
    pub async fn requests(&self) -> Vec<TransportRequest> {
        self.0.lock().await.requests.clone()
    }

    /// The last request that was sent.
    pub async fn last_request(&self) -> TransportRequest {
        self.0
            .lock()
            .await
            .requests
            .last()
            .cloned()
            .expect("No request has been sent")
    }

    pub async fn reset_request_log(&self) {
        self.0.lock().await.requests.clear();
    }

    pub async fn assert_transport_was_untouched(&self) {
        let info = self.0.lock().await;
        assert!(
            info.requests.is_empty(),
            "The transport was supposed to be untouched, but at least one request was sent. Request log:\n  - {}",
            info.requests
                .iter()
                .map(|r| format!("{} {}", r.method, r.path))
                .collect::<Vec<_>>()
                .join("\n  - ")
        )
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut info = self.call_tracker.0.lock().await;
        info.requests.push(request);
        match info.script.pop_front() {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Failure(reason)) => Err(TransportError::new(anyhow::anyhow!(reason))),
            None => Ok(TransportResponse::new(http::StatusCode::OK)),
        }
    }
}
