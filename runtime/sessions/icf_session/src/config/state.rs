#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
/// Configure the lifetimes the client assumes for sessions and contexts.
///
/// # Advisory timeouts
///
/// The real timeouts are profile parameters of the SAP system and can't be
/// discovered from the outside.
/// The values configured here are only used to stop reusing state that is very
/// likely gone already: the coordinator still reacts to every expiry signal the
/// server sends, no matter what the local bookkeeping says.
pub struct SessionStateConfig {
    /// How long a security session survives without any request.
    ///
    /// Set it to `None` to never consider a session expired locally.
    ///
    /// # Default
    ///
    /// 30 minutes, the default of `rdisp/plugin_auto_logout`.
    #[serde(with = "humantime_serde", default = "default_session_inactivity_timeout")]
    pub session_inactivity_timeout: Option<std::time::Duration>,
    /// How long a stateful context survives without any request.
    ///
    /// When a context outlives this timeout it is retired as expired and the
    /// next stateful operation starts a fresh one.
    /// Set it to `None` to never consider a context expired locally.
    ///
    /// # Default
    ///
    /// 30 minutes.
    #[serde(with = "humantime_serde", default = "default_context_timeout")]
    pub context_timeout: Option<std::time::Duration>,
    /// Whether a stateful operation that failed because its context expired
    /// should be re-issued once in a fresh context.
    ///
    /// Operations carrying a lock handle are never re-issued: the handle died
    /// together with the context.
    ///
    /// # Default
    ///
    /// `true`.
    #[serde(default = "default_retry_on_context_expiry")]
    pub retry_on_context_expiry: bool,
}

impl Default for SessionStateConfig {
    fn default() -> Self {
        Self {
            session_inactivity_timeout: default_session_inactivity_timeout(),
            context_timeout: default_context_timeout(),
            retry_on_context_expiry: default_retry_on_context_expiry(),
        }
    }
}

fn default_session_inactivity_timeout() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(30 * 60))
}

fn default_context_timeout() -> Option<std::time::Duration> {
    Some(std::time::Duration::from_secs(30 * 60))
}

fn default_retry_on_context_expiry() -> bool {
    true
}
