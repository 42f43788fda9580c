//! Redirect sink and callback parameters
//!
//! The session never writes HTTP responses itself. It signals redirects
//! through a [`RedirectSink`] and receives callback query parameters as
//! plain strings, so the flow stays independent of any web framework.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

/// 302 Found
pub const FOUND: u16 = 302;

/// A redirect the host should issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Target URL or path
    pub location: String,
    /// HTTP status code
    pub status: u16,
}

/// Receives the redirects the session asks the host to issue
pub trait RedirectSink: Send + Sync + 'static {
    /// Redirect the current response to `location`
    fn redirect(&self, location: &str, status: u16);
}

/// Sink that holds the most recent redirect until the host takes it
#[derive(Debug, Clone, Default)]
pub struct RedirectSlot {
    pending: Arc<Mutex<Option<Redirect>>>,
}

impl RedirectSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pending redirect, leaving the slot empty
    #[must_use]
    pub fn take(&self) -> Option<Redirect> {
        self.pending.lock().take()
    }

    /// Peek at the pending redirect
    #[must_use]
    pub fn peek(&self) -> Option<Redirect> {
        self.pending.lock().clone()
    }
}

impl RedirectSink for RedirectSlot {
    fn redirect(&self, location: &str, status: u16) {
        *self.pending.lock() = Some(Redirect {
            location: location.to_string(),
            status,
        });
    }
}

/// Sink that drops every redirect (headless use, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRedirect;

impl RedirectSink for NoRedirect {
    fn redirect(&self, _location: &str, _status: u16) {}
}

/// OAuth callback query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter (for CSRF protection)
    pub state: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}
