//! User-Agent sent on every platform request.

/// Project URL included in the User-Agent.
const PROJECT_UA_URL: &str = "https://github.com/fierce/caseharvest";

/// Default User-Agent for the session client (identifies the tool and version).
#[must_use]
pub(crate) fn default_session_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("caseharvest/{version} (case-intake; +{PROJECT_UA_URL})")
}
