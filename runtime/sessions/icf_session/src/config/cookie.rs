use crate::wire::SESSION_COOKIE_PREFIX;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
/// Configure how the security session cookie is recognised.
///
/// ICF names the session cookie after the system and the client it belongs to,
/// e.g. `SAP_SESSIONID_A4H_001`.
pub struct SessionCookieConfig {
    /// The system id, e.g. `A4H`.
    ///
    /// By default, it is not set.
    #[serde(default)]
    pub system_id: Option<String>,
    /// The three-digit client, e.g. `001`.
    ///
    /// By default, it is not set.
    #[serde(default)]
    pub client: Option<String>,
}

impl SessionCookieConfig {
    /// Pin the session cookie to a specific system and client.
    pub fn new(
        system_id: impl Into<String>,
        client: impl Into<String>,
    ) -> Result<Self, InvalidClient> {
        let client = client.into();
        if client.len() != 3 || !client.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidClient(client));
        }
        Ok(Self {
            system_id: Some(system_id.into()),
            client: Some(client),
        })
    }

    /// The exact name of the session cookie, if both the system id and the client are known.
    pub fn session_cookie_name(&self) -> Option<String> {
        match (&self.system_id, &self.client) {
            (Some(system_id), Some(client)) => {
                Some(format!("{SESSION_COOKIE_PREFIX}{system_id}_{client}"))
            }
            _ => None,
        }
    }

    /// Returns `true` if a cookie with the given name carries the security session.
    ///
    /// Without a pinned system and client, every `SAP_SESSIONID_*` cookie matches.
    pub fn is_session_cookie(&self, name: &str) -> bool {
        match self.session_cookie_name() {
            Some(expected) => name == expected,
            None => {
                name.starts_with(SESSION_COOKIE_PREFIX)
                    && name.len() > SESSION_COOKIE_PREFIX.len()
            }
        }
    }
}

#[derive(Debug)]
/// Error raised when trying to pin a session cookie to a malformed client.
pub struct InvalidClient(String);

impl std::fmt::Display for InvalidClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A SAP client must be made of three digits, got `{}`", self.0)
    }
}

impl std::error::Error for InvalidClient {}
