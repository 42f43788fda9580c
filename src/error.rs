//! Error types for Graph Session

use std::io;

use thiserror::Error;

/// Result type alias for Graph Session
pub type Result<T> = std::result::Result<T, Error>;

/// Graph Session errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid required settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Callback `state` did not match the in-flight authorization attempt
    #[error("State mismatch: expected {expected}, received {received}")]
    StateMismatch {
        /// Redacted form of the state we sent (empty if none was in flight)
        expected: String,
        /// Redacted form of the state we received
        received: String,
    },

    /// Authority rejected the code or refresh-token exchange
    #[error("Token exchange failed: {error}{}", suffix(.description))]
    TokenExchange {
        /// OAuth error code reported by the authority (or a local summary)
        error: String,
        /// Optional human-readable description from the authority
        description: Option<String>,
    },

    /// A Graph call was attempted without an access token
    #[error("Not authenticated: no access token")]
    NotAuthenticated,

    /// Outbound transport failure (network, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Persistence medium failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a token exchange error from an authority error body
    pub fn token_exchange(error: impl Into<String>, description: Option<String>) -> Self {
        Self::TokenExchange {
            error: error.into(),
            description,
        }
    }

    /// Whether the host should send the user back through `login()`
    #[must_use]
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::StateMismatch { .. } | Self::TokenExchange { .. } | Self::NotAuthenticated
        )
    }
}

fn suffix(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" - {d}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_exchange_display_includes_description() {
        let err = Error::token_exchange("invalid_grant", Some("code expired".to_string()));
        assert_eq!(
            err.to_string(),
            "Token exchange failed: invalid_grant - code expired"
        );

        let bare = Error::token_exchange("invalid_grant", None);
        assert_eq!(bare.to_string(), "Token exchange failed: invalid_grant");
    }

    #[test]
    fn flow_errors_require_login() {
        let mismatch = Error::StateMismatch {
            expected: "abc…".to_string(),
            received: "xyz…".to_string(),
        };
        assert!(mismatch.requires_login());
        assert!(Error::token_exchange("invalid_grant", None).requires_login());
        assert!(!Error::Transport("timeout".to_string()).requires_login());
        assert!(!Error::Config("missing client_id".to_string()).requires_login());
    }
}
