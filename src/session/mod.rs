//! Graph session
//!
//! One [`GraphSession`] per user: it owns the token state, the in-flight
//! authorization state and the collaborators it talks through.
//!
//! - Session state store: [`GraphSession::initialize`], [`GraphSession::persist`],
//!   [`GraphSession::clear`]
//! - Authorization flow: [`GraphSession::login`], [`GraphSession::handle_redirect`]
//! - Token lifecycle: [`GraphSession::remaining_seconds`],
//!   [`GraphSession::ensure_valid`], [`GraphSession::refresh`], [`GraphSession::save`]
//! - Graph calls: [`GraphSession::api_request`] and friends
//!
//! Methods take `&mut self`; a host serving many users keeps one session per
//! user and serializes access to each.

mod flow;
mod graph;
mod lifecycle;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::events::SessionEvent;
use crate::redirect::{FOUND, RedirectSink};
use crate::state::SessionState;
use crate::storage::{FileStateStore, StateStore};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{Error, Result};

pub use lifecycle::compare_scopes;

const EVENT_BUFFER: usize = 32;

/// OAuth 2.0 Authorization Code Grant session against Microsoft Graph
pub struct GraphSession {
    /// Validated settings; never mutated after construction
    config: SessionConfig,

    /// Token state
    state: SessionState,

    /// Anti-forgery token of the one open authorization attempt
    authstate: Option<String>,

    /// Persistence medium
    store: Arc<dyn StateStore>,

    /// Outbound HTTP
    transport: Arc<dyn HttpTransport>,

    /// Where redirects are signalled
    redirects: Arc<dyn RedirectSink>,

    /// Advisory events
    events: broadcast::Sender<SessionEvent>,
}

impl GraphSession {
    /// Create a session and initialize its state (resuming a persisted one
    /// when caching is enabled).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid settings, or a storage/transport
    /// error raised while resuming.
    pub async fn new(
        config: SessionConfig,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn HttpTransport>,
        redirects: Arc<dyn RedirectSink>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut session = Self {
            config,
            state: SessionState::default(),
            authstate: None,
            store,
            transport,
            redirects,
            events,
        };
        session.initialize().await?;
        Ok(session)
    }

    /// Create a session with the flat-file store and `reqwest` transport
    pub async fn with_defaults(
        config: SessionConfig,
        redirects: Arc<dyn RedirectSink>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let store = Arc::new(FileStateStore::for_config(&config)?);
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Self::new(config, store, transport, redirects).await
    }

    /// Reset to the logged-out shape, then resume a persisted session if
    /// caching is enabled. A resumed token is validated (and refreshed if
    /// needed) before this returns.
    ///
    /// A persisted record left over from a run with caching enabled is
    /// deleted when caching is now disabled.
    pub async fn initialize(&mut self) -> Result<()> {
        self.state = SessionState::default();

        if !self.config.cache_state {
            if self.store.exists() {
                self.store.delete()?;
                info!("Caching disabled, removed stale persisted session state");
            }
            return Ok(());
        }

        let Some(bytes) = self.store.load()? else {
            return Ok(());
        };

        match SessionState::from_record(&bytes) {
            Ok(restored) => {
                self.state = restored;
                debug!(
                    loggedin = self.state.loggedin,
                    remaining = self.remaining_seconds(),
                    "Resumed persisted session state"
                );
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable persisted session state");
                return Ok(());
            }
        }

        match self.ensure_valid(self.config.refresh_threshold_secs).await {
            // The rejected refresh already reset the session to logged out
            Err(e @ Error::TokenExchange { .. }) => {
                warn!(error = %e, "Resumed session could not be refreshed");
                Ok(())
            }
            other => other,
        }
    }

    /// Write the full canonical state to the store. No-op unless caching is enabled.
    pub fn persist(&self) -> Result<()> {
        if !self.config.cache_state {
            return Ok(());
        }

        let record = self.state.to_record()?;
        self.store.save(&record)
    }

    /// Return to the logged-out shape and optionally redirect.
    ///
    /// Any persisted copy is removed so it cannot be resumed later. `None`
    /// or an empty target skips the redirect.
    pub fn clear(&mut self, redirect_to: Option<&str>) -> Result<()> {
        self.state = SessionState::default();
        self.authstate = None;

        if self.store.exists() {
            self.store.delete()?;
        }

        self.emit(SessionEvent::LoggedOut);
        debug!("Session cleared");

        if let Some(target) = redirect_to.filter(|t| !t.is_empty()) {
            self.redirects.redirect(target, FOUND);
        }
        Ok(())
    }

    /// Settings in effect
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current token state
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether a token has been saved since the last reset
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.state.loggedin
    }

    /// Whether an authorization attempt is waiting for its callback
    #[must_use]
    pub fn awaiting_callback(&self) -> bool {
        self.authstate.is_some()
    }

    /// Subscribe to advisory session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("client_id", &self.config.client_id)
            .field("loggedin", &self.state.loggedin)
            .field("token_expires_at", &self.state.token_expires_at)
            .field("awaiting_callback", &self.authstate.is_some())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::test_support::{ScriptedTransport, config, harness};
    use super::*;
    use crate::redirect::NoRedirect;
    use crate::state::unix_now;
    use crate::storage::MemoryStateStore;

    fn persisted(expires_at: u64, refresh: Option<&str>) -> Vec<u8> {
        SessionState {
            access_token: Some("old-token".to_string()),
            refresh_token: refresh.map(str::to_string),
            token_expires_at: expires_at,
            token_scope: "User.Read".to_string(),
            authorization_url: String::new(),
            loggedin: true,
        }
        .to_record()
        .unwrap()
    }

    #[tokio::test]
    async fn new_session_is_logged_out() {
        let h = harness(config(&["User.Read"])).await;
        assert_eq!(h.session.state(), &SessionState::default());
        assert!(!h.session.awaiting_callback());
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_construction() {
        let mut cfg = config(&["User.Read"]);
        cfg.client_id.clear();
        let result = GraphSession::new(
            cfg,
            Arc::new(MemoryStateStore::new()),
            Arc::new(ScriptedTransport::default()),
            Arc::new(NoRedirect),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn stale_record_is_deleted_when_caching_disabled() {
        let store = Arc::new(MemoryStateStore::with_record(persisted(unix_now() + 3600, None)));
        let session = GraphSession::new(
            config(&["User.Read"]),
            store.clone(),
            Arc::new(ScriptedTransport::default()),
            Arc::new(NoRedirect),
        )
        .await
        .unwrap();

        assert!(!store.exists());
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn valid_record_resumes_without_refresh() {
        let mut cfg = config(&["User.Read"]);
        cfg.cache_state = true;
        let store = Arc::new(MemoryStateStore::with_record(persisted(
            unix_now() + 3600,
            Some("rt"),
        )));
        let transport = Arc::new(ScriptedTransport::default());

        let session = GraphSession::new(cfg, store, transport.clone(), Arc::new(NoRedirect))
            .await
            .unwrap();

        assert!(session.is_logged_in());
        assert_eq!(session.state().access_token.as_deref(), Some("old-token"));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn expired_record_is_refreshed_on_resume() {
        let mut cfg = config(&["User.Read"]);
        cfg.cache_state = true;
        let store = Arc::new(MemoryStateStore::with_record(persisted(1, Some("rt"))));
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(
            200,
            json!({"access_token": "new-token", "expires_in": 3600, "scope": "User.Read", "refresh_token": "rt2"}),
        );

        let session = GraphSession::new(cfg, store.clone(), transport.clone(), Arc::new(NoRedirect))
            .await
            .unwrap();

        assert_eq!(session.state().access_token.as_deref(), Some("new-token"));
        assert_eq!(session.state().refresh_token.as_deref(), Some("rt2"));
        assert_eq!(transport.sent_count(), 1);
        // Refreshed state was written back
        let saved = SessionState::from_record(&store.snapshot().unwrap()).unwrap();
        assert_eq!(saved.access_token.as_deref(), Some("new-token"));
    }

    #[tokio::test]
    async fn rejected_refresh_on_resume_leaves_session_logged_out() {
        let mut cfg = config(&["User.Read"]);
        cfg.cache_state = true;
        let store = Arc::new(MemoryStateStore::with_record(persisted(1, Some("revoked"))));
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(400, json!({"error": "invalid_grant"}));

        let session = GraphSession::new(cfg, store.clone(), transport, Arc::new(NoRedirect))
            .await
            .unwrap();

        assert_eq!(session.state(), &SessionState::default());
        assert!(!store.exists());
    }

    #[tokio::test]
    async fn expired_record_without_refresh_token_is_not_resumed() {
        let mut cfg = config(&["User.Read"]);
        cfg.cache_state = true;
        let store = Arc::new(MemoryStateStore::with_record(persisted(1, None)));
        let transport = Arc::new(ScriptedTransport::default());

        let session = GraphSession::new(cfg, store.clone(), transport.clone(), Arc::new(NoRedirect))
            .await
            .unwrap();

        assert!(!session.is_logged_in());
        assert_eq!(session.state(), &SessionState::default());
        assert_eq!(session.remaining_seconds(), 0);
        assert!(!store.exists());
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn unreadable_record_is_ignored() {
        let mut cfg = config(&["User.Read"]);
        cfg.cache_state = true;
        let store = Arc::new(MemoryStateStore::with_record(b"not json".to_vec()));
        let session = GraphSession::new(
            cfg,
            store,
            Arc::new(ScriptedTransport::default()),
            Arc::new(NoRedirect),
        )
        .await
        .unwrap();
        assert!(!session.is_logged_in());
    }

    #[tokio::test]
    async fn persist_is_noop_without_caching() {
        let h = harness(config(&["User.Read"])).await;
        h.session.persist().unwrap();
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn clear_twice_is_idempotent() {
        let mut h = harness(config(&["User.Read"])).await;
        h.session.login().unwrap();
        let _ = h.redirects.take();

        h.session.clear(None).unwrap();
        let first = h.session.state().clone();
        h.session.clear(None).unwrap();

        assert_eq!(first, SessionState::default());
        assert_eq!(h.session.state(), &first);
        assert!(!h.session.awaiting_callback());
        assert!(h.redirects.take().is_none());
    }

    #[tokio::test]
    async fn clear_redirects_when_target_given() {
        let mut h = harness(config(&["User.Read"])).await;
        h.session.clear(Some("/")).unwrap();
        assert_eq!(h.redirects.take().unwrap().location, "/");

        h.session.clear(Some("")).unwrap();
        assert!(h.redirects.take().is_none());
    }
}
