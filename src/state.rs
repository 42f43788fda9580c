//! Session state
//!
//! The mutable per-user token fields. Persisted wholesale (never partially)
//! when caching is enabled; `authorization_url` is transient and never written.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Token and login state for one user session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Current access token
    pub access_token: Option<String>,

    /// Refresh token, if the authority issued one
    pub refresh_token: Option<String>,

    /// Unix timestamp (seconds) at which the access token expires; 0 = no token
    pub token_expires_at: u64,

    /// Space-delimited scopes granted with the token, as returned by the authority
    pub token_scope: String,

    /// Last-constructed authorization redirect URL
    #[serde(skip)]
    pub authorization_url: String,

    /// True only after a successful token save
    pub loggedin: bool,
}

impl SessionState {
    /// Seconds until the access token expires, never negative
    #[must_use]
    pub fn remaining_seconds_at(&self, now: u64) -> u64 {
        match self.access_token {
            Some(ref token) if !token.is_empty() && now < self.token_expires_at => {
                self.token_expires_at - now
            }
            _ => 0,
        }
    }

    /// Serialize the canonical (non-transient) field set
    pub fn to_record(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Load a persisted record over the default shape
    pub fn from_record(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Current Unix time in seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in(expires_at: u64) -> SessionState {
        SessionState {
            access_token: Some("at".to_string()),
            refresh_token: Some("rt".to_string()),
            token_expires_at: expires_at,
            token_scope: "User.Read".to_string(),
            authorization_url: "https://login.example.com/authorize?state=x".to_string(),
            loggedin: true,
        }
    }

    #[test]
    fn default_is_logged_out() {
        let state = SessionState::default();
        assert!(state.access_token.is_none());
        assert_eq!(state.token_expires_at, 0);
        assert!(!state.loggedin);
        assert_eq!(state.remaining_seconds_at(unix_now()), 0);
    }

    #[test]
    fn remaining_seconds_counts_down() {
        let state = logged_in(1_000);
        assert_eq!(state.remaining_seconds_at(400), 600);
        assert_eq!(state.remaining_seconds_at(999), 1);
    }

    #[test]
    fn remaining_seconds_is_zero_at_or_after_expiry() {
        let state = logged_in(1_000);
        assert_eq!(state.remaining_seconds_at(1_000), 0);
        assert_eq!(state.remaining_seconds_at(5_000), 0);
    }

    #[test]
    fn remaining_seconds_is_zero_without_token() {
        let mut state = logged_in(u64::MAX);
        state.access_token = None;
        assert_eq!(state.remaining_seconds_at(0), 0);
        state.access_token = Some(String::new());
        assert_eq!(state.remaining_seconds_at(0), 0);
    }

    #[test]
    fn record_excludes_authorization_url() {
        let state = logged_in(1_000);
        let record = state.to_record().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&record).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 5);
        assert!(!obj.contains_key("authorization_url"));

        let restored = SessionState::from_record(&record).unwrap();
        assert_eq!(restored.authorization_url, "");
        assert_eq!(
            restored,
            SessionState {
                authorization_url: String::new(),
                ..state
            }
        );
    }

    #[test]
    fn partial_record_loads_over_defaults() {
        let restored = SessionState::from_record(br#"{"access_token":"at","loggedin":true}"#).unwrap();
        assert_eq!(restored.access_token.as_deref(), Some("at"));
        assert!(restored.refresh_token.is_none());
        assert_eq!(restored.token_expires_at, 0);
    }
}
