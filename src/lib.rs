//! Graph Session Library
//!
//! OAuth 2.0 Authorization Code Grant client for Microsoft Graph: builds the
//! authorization redirect, validates the callback, exchanges and persists
//! tokens, refreshes them before they expire and checks granted scopes.
//!
//! # Collaborators
//!
//! The session does no HTTP serving of its own. A host supplies:
//!
//! - a [`transport::HttpTransport`] for token and Graph calls
//!   ([`transport::ReqwestTransport`] by default)
//! - a [`storage::StateStore`] for the persisted session record
//!   ([`storage::FileStateStore`] by default)
//! - a [`redirect::RedirectSink`] to receive the redirects the flow issues
//!
//! [`server`] is a small axum host wiring these together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod redirect;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use events::{ScopeMismatch, SessionEvent};
pub use session::GraphSession;
pub use state::SessionState;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
