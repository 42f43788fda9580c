//! Session events
//!
//! Advisory signals that must not interrupt the flow, such as a token granted
//! with fewer scopes than requested. Delivered over a broadcast channel so
//! operators can watch them without the end user ever seeing them.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// Requested and granted scopes disagree. The token is still usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeMismatch {
    /// Requested scopes (lowercased, without `offline_access`)
    pub requested: BTreeSet<String>,
    /// Scopes the authority actually granted (lowercased)
    pub granted: BTreeSet<String>,
}

impl ScopeMismatch {
    /// Requested but not granted
    #[must_use]
    pub fn missing(&self) -> Vec<&str> {
        self.requested
            .difference(&self.granted)
            .map(String::as_str)
            .collect()
    }

    /// Granted but not requested
    #[must_use]
    pub fn unexpected(&self) -> Vec<&str> {
        self.granted
            .difference(&self.requested)
            .map(String::as_str)
            .collect()
    }
}

impl fmt::Display for ScopeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested scopes {:?} but token was returned with scopes {:?}",
            self.requested, self.granted
        )
    }
}

/// Something observable happened to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Authorization redirect issued
    LoginStarted,
    /// Code exchange succeeded
    LoggedIn {
        /// Unix timestamp at which the new access token expires
        expires_at: u64,
    },
    /// Refresh succeeded
    TokenRefreshed {
        /// Unix timestamp at which the new access token expires
        expires_at: u64,
    },
    /// Granted scopes differ from requested scopes
    ScopeMismatch(ScopeMismatch),
    /// Session returned to the logged-out shape
    LoggedOut,
}
