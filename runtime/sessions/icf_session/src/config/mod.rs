//! Types related to [`IcfSessionConfig`](crate::IcfSessionConfig).
mod cookie;
mod state;

pub use cookie::{InvalidClient, SessionCookieConfig};
pub use state::SessionStateConfig;
