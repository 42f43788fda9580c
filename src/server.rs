//! Demo HTTP host
//!
//! Serves the login / callback / logout routes and a Graph `me` proxy. Each
//! browser that starts a login gets its own [`GraphSession`], keyed by a
//! `graph_sid` cookie and guarded by a mutex so one request at a time drives
//! it. Sessions leave the registry on logout or once idle for
//! `session_idle_timeout`; at most `max_sessions` are hosted at once.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HostConfig;
use crate::events::SessionEvent;
use crate::redirect::{CallbackParams, FOUND, Redirect, RedirectSlot};
use crate::session::GraphSession;
use crate::storage::{FileStateStore, MemoryStateStore, StateStore};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{Error, Result};

/// Cookie carrying the per-browser session id
pub const SESSION_COOKIE: &str = "graph_sid";

/// One user's session and the slot its redirects land in
pub struct HostedSession {
    /// The OAuth session
    pub session: GraphSession,
    /// Redirect sink shared with `session`
    pub redirects: RedirectSlot,
    last_seen: Instant,
}

impl HostedSession {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since a request last drove this session
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: HostConfig,
    /// Outbound transport shared by every session
    pub transport: Arc<dyn HttpTransport>,
    /// Directory for persisted records (when caching is enabled)
    pub state_dir: Option<PathBuf>,
    /// Sessions by id
    pub sessions: DashMap<String, Arc<Mutex<HostedSession>>>,
}

impl AppState {
    /// Build state with the `reqwest` transport
    pub fn new(config: HostConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.session)?);
        Self::with_transport(config, transport)
    }

    /// Build state with a caller-supplied transport
    pub fn with_transport(config: HostConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let state_dir = if config.session.cache_state {
            Some(config.session.resolve_state_dir()?)
        } else {
            None
        };

        Ok(Self {
            config,
            transport,
            state_dir,
            sessions: DashMap::new(),
        })
    }

    /// Session for `sid`, creating (and possibly resuming) it on first use.
    ///
    /// `None` when the registry is full even after dropping idle sessions.
    async fn open_session(&self, sid: &str) -> Result<Option<Arc<Mutex<HostedSession>>>> {
        if let Some(existing) = self.sessions.get(sid) {
            return Ok(Some(Arc::clone(existing.value())));
        }

        let max_sessions = self.config.server.max_sessions;
        if self.sessions.len() >= max_sessions {
            self.reap_idle();
        }
        if self.sessions.len() >= max_sessions {
            warn!(max_sessions, "Session registry full");
            return Ok(None);
        }

        let store: Arc<dyn StateStore> = match &self.state_dir {
            Some(dir) => Arc::new(FileStateStore::keyed(
                dir,
                &self.config.session.state_record,
                sid,
            )?),
            None => Arc::new(MemoryStateStore::new()),
        };
        let redirects = RedirectSlot::new();
        let session = GraphSession::new(
            self.config.session.clone(),
            store,
            Arc::clone(&self.transport),
            Arc::new(redirects.clone()),
        )
        .await?;

        // Ends once the session (and its event sender) is dropped
        spawn_event_logger(sid.to_string(), session.subscribe());

        let hosted = Arc::new(Mutex::new(HostedSession {
            session,
            redirects,
            last_seen: Instant::now(),
        }));
        // A concurrent first request may have won the race; keep its session
        let hosted = Arc::clone(
            self.sessions
                .entry(sid.to_string())
                .or_insert(hosted)
                .value(),
        );
        debug!(sessions = self.sessions.len(), "Session created");
        Ok(Some(hosted))
    }

    /// Session for `sid` if it is hosted, or if a persisted record for it can
    /// be resumed. Never creates a blank session.
    async fn existing_session(&self, sid: &str) -> Result<Option<Arc<Mutex<HostedSession>>>> {
        if let Some(existing) = self.sessions.get(sid) {
            return Ok(Some(Arc::clone(existing.value())));
        }

        let Some(dir) = &self.state_dir else {
            return Ok(None);
        };
        if !FileStateStore::keyed(dir, &self.config.session.state_record, sid)?.exists() {
            return Ok(None);
        }
        self.open_session(sid).await
    }

    /// Drop the session for `sid` from the registry
    fn evict(&self, sid: &str) {
        if self.sessions.remove(sid).is_some() {
            debug!(sessions = self.sessions.len(), "Session evicted");
        }
    }

    /// Drop sessions idle for longer than `session_idle_timeout`. Sessions
    /// currently serving a request are kept. Returns how many were dropped.
    pub fn reap_idle(&self) -> usize {
        let timeout = self.config.server.session_idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|_, hosted| match hosted.try_lock() {
            Ok(hosted) => hosted.idle_for() < timeout,
            Err(_) => true,
        });
        before.saturating_sub(self.sessions.len())
    }

    fn landing(&self) -> &str {
        &self.config.server.landing_path
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let callback_path = state.config.server.callback_path.clone();

    Router::new()
        .route("/", get(status_handler))
        .route("/login", get(login_handler))
        .route(&callback_path, get(callback_handler))
        .route("/logout", get(logout_handler))
        .route("/me", get(me_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the host until Ctrl-C
pub async fn run(config: HostConfig) -> Result<()> {
    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
        config.server.port,
    );

    let state = Arc::new(AppState::new(config)?);
    let reaper = spawn_reaper(Arc::clone(&state));
    let app = create_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Listening");
    info!(
        redirect_uri = %state.config.session.redirect_uri,
        cache_state = state.config.session.cache_state,
        refresh_enable = state.config.session.refresh_enable,
        "Graph session host ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    reaper.abort();

    info!("Host shutdown complete");
    Ok(())
}

/// Periodically drop idle sessions
pub fn spawn_reaper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = (state.config.server.session_idle_timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let reaped = state.reap_idle();
            if reaped > 0 {
                debug!(count = reaped, "Reaped idle sessions");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Resolve the caller's session id, minting one if absent
fn session_id(headers: &HeaderMap) -> (String, bool) {
    match session_cookie(headers) {
        Some(sid) => (sid, false),
        None => (Uuid::new_v4().to_string(), true),
    }
}

/// `graph_sid` cookie value, if present and well-formed
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find(|sid| Uuid::parse_str(sid).is_ok())
        .map(str::to_string)
}

fn with_cookie(mut response: Response, sid: &str, is_new: bool) -> Response {
    if is_new {
        let cookie = format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly; SameSite=Lax");
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn redirect_response(redirect: Redirect) -> Response {
    let status = StatusCode::from_u16(redirect.status).unwrap_or(StatusCode::FOUND);
    match HeaderValue::from_str(&redirect.location) {
        Ok(location) => (status, [(header::LOCATION, location)]).into_response(),
        Err(_) => internal_error("Invalid redirect target"),
    }
}

/// Follow the redirect the session signalled, or fall back to `fallback`
fn follow(slot: &RedirectSlot, fallback: &str) -> Response {
    redirect_response(slot.take().unwrap_or_else(|| Redirect {
        location: fallback.to_string(),
        status: FOUND,
    }))
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn to_login() -> Response {
    redirect_response(Redirect {
        location: "/login".to_string(),
        status: FOUND,
    })
}

fn registry_full() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "Too many active sessions, try again later"})),
    )
        .into_response()
}

fn logged_out_status() -> Value {
    json!({
        "loggedin": false,
        "remaining_seconds": 0,
        "expires_at": null,
        "token_scope": "",
        "login": "/login",
        "logout": "/logout",
    })
}

fn error_response(e: &Error) -> Response {
    match e {
        Error::Transport(_) | Error::Http(_) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "Identity provider unavailable"})),
        )
            .into_response(),
        _ => internal_error("Session error"),
    }
}

fn spawn_event_logger(sid: String, mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ScopeMismatch(mismatch)) => {
                    warn!(sid = %sid, %mismatch, "Scope mismatch");
                }
                Ok(event) => debug!(sid = %sid, ?event, "Session event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(sid = %sid, skipped, "Session event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// GET / - login status
async fn status_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let hosted = match session_cookie(&headers) {
        Some(sid) => match state.existing_session(&sid).await {
            Ok(hosted) => hosted,
            Err(e) => {
                error!(error = %e, "Failed to resume session");
                return error_response(&e);
            }
        },
        None => None,
    };
    let Some(hosted) = hosted else {
        return Json(logged_out_status()).into_response();
    };

    let mut hosted = hosted.lock().await;
    hosted.touch();
    let session = &hosted.session;
    // Out-of-range expiries (saturated `expires_in`) show as null
    let expires_at = i64::try_from(session.state().token_expires_at)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .filter(|_| session.is_logged_in())
        .map(|t| t.to_rfc3339());

    let body = json!({
        "loggedin": session.is_logged_in(),
        "remaining_seconds": session.remaining_seconds(),
        "expires_at": expires_at,
        "token_scope": session.state().token_scope,
        "login": "/login",
        "logout": "/logout",
    });
    Json(body).into_response()
}

/// GET /login - start the authorization code flow
async fn login_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let (sid, is_new) = session_id(&headers);
    let hosted = match state.open_session(&sid).await {
        Ok(Some(h)) => h,
        Ok(None) => return registry_full(),
        Err(e) => {
            error!(error = %e, "Failed to create session");
            return error_response(&e);
        }
    };
    let mut hosted = hosted.lock().await;
    hosted.touch();

    let started = hosted.session.login().map(|_| ());
    let response = match started {
        Ok(()) => follow(&hosted.redirects, state.landing()),
        Err(e) => {
            error!(error = %e, "Failed to build authorization request");
            error_response(&e)
        }
    };
    with_cookie(response, &sid, is_new)
}

/// GET <callback_path> - authority redirects back here
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(sid) = session_cookie(&headers) else {
        warn!("Authorization callback without a session cookie");
        return (StatusCode::BAD_REQUEST, "Authorization failed. Please sign in again.").into_response();
    };
    let hosted = match state.existing_session(&sid).await {
        Ok(Some(h)) => h,
        Ok(None) => {
            warn!("Authorization callback for an unknown session");
            return (StatusCode::BAD_REQUEST, "Authorization failed. Please sign in again.").into_response();
        }
        Err(e) => return error_response(&e),
    };
    let mut hosted = hosted.lock().await;
    hosted.touch();
    let landing = state.landing();

    if let Some(ref authority_error) = params.error {
        warn!(
            error = %authority_error,
            description = params.error_description.as_deref().unwrap_or_default(),
            "Authority returned an error to the callback"
        );
        if let Err(e) = hosted.session.clear(Some(landing)) {
            return error_response(&e);
        }
        return follow(&hosted.redirects, landing);
    }

    let result = hosted
        .session
        .handle_redirect(
            params.state.as_deref().unwrap_or_default(),
            params.code.as_deref().unwrap_or_default(),
            landing,
        )
        .await;

    match result {
        Ok(()) => follow(&hosted.redirects, landing),
        Err(Error::StateMismatch { .. }) => {
            (StatusCode::BAD_REQUEST, "Authorization failed. Please sign in again.").into_response()
        }
        Err(e @ Error::TokenExchange { .. }) => {
            warn!(error = %e, "Code exchange rejected");
            follow(&hosted.redirects, landing)
        }
        Err(e) => {
            error!(error = %e, "Authorization callback failed");
            error_response(&e)
        }
    }
}

/// GET /logout
async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let landing = state.landing();
    let Some(sid) = session_cookie(&headers) else {
        return follow(&RedirectSlot::new(), landing);
    };
    let hosted = match state.existing_session(&sid).await {
        Ok(Some(h)) => h,
        Ok(None) => return follow(&RedirectSlot::new(), landing),
        Err(e) => return error_response(&e),
    };
    let mut hosted = hosted.lock().await;

    let cleared = hosted.session.clear(Some(landing));
    state.evict(&sid);
    match cleared {
        Ok(()) => {
            info!("Logged out");
            follow(&hosted.redirects, landing)
        }
        Err(e) => error_response(&e),
    }
}

/// GET /me - proxy to Graph `me`
async fn me_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(sid) = session_cookie(&headers) else {
        return to_login();
    };
    let hosted = match state.existing_session(&sid).await {
        Ok(Some(h)) => h,
        Ok(None) => return to_login(),
        Err(e) => return error_response(&e),
    };
    let mut hosted = hosted.lock().await;
    hosted.touch();

    match hosted.session.get("me").await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(response.body)).into_response()
        }
        Err(e) if e.requires_login() => {
            debug!(error = %e, "Graph call needs a fresh login");
            to_login()
        }
        Err(e) => {
            error!(error = %e, "Graph call failed");
            error_response(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::test_support::ScriptedTransport;

    fn app_state(configure: impl FnOnce(&mut HostConfig)) -> AppState {
        let mut config = HostConfig::default();
        config.session = SessionConfig::new(
            "client-id",
            "client-secret",
            "http://localhost:5000/login/authorized",
            ["User.Read"],
        );
        configure(&mut config);
        AppState::with_transport(config, Arc::new(ScriptedTransport::default())).unwrap()
    }

    #[tokio::test]
    async fn unknown_session_is_not_created_on_lookup() {
        let state = app_state(|_| {});
        let sid = Uuid::new_v4().to_string();

        assert!(state.existing_session(&sid).await.unwrap().is_none());
        assert_eq!(state.sessions.len(), 0);

        assert!(state.open_session(&sid).await.unwrap().is_some());
        assert!(state.existing_session(&sid).await.unwrap().is_some());
        assert_eq!(state.sessions.len(), 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let state = app_state(|c| c.server.session_idle_timeout = Duration::ZERO);
        state.open_session("a").await.unwrap();
        state.open_session("b").await.unwrap();

        assert_eq!(state.reap_idle(), 2);
        assert_eq!(state.sessions.len(), 0);
    }

    #[tokio::test]
    async fn busy_sessions_survive_reaping() {
        let state = app_state(|c| c.server.session_idle_timeout = Duration::ZERO);
        let busy = state.open_session("busy").await.unwrap().unwrap();
        let _guard = busy.lock().await;

        assert_eq!(state.reap_idle(), 0);
        assert_eq!(state.sessions.len(), 1);
    }

    #[tokio::test]
    async fn full_registry_refuses_new_sessions() {
        let state = app_state(|c| c.server.max_sessions = 2);
        assert!(state.open_session("a").await.unwrap().is_some());
        assert!(state.open_session("b").await.unwrap().is_some());

        assert!(state.open_session("c").await.unwrap().is_none());
        // Known sessions are still served
        assert!(state.open_session("a").await.unwrap().is_some());

        state.evict("a");
        assert!(state.open_session("c").await.unwrap().is_some());
        assert_eq!(state.sessions.len(), 2);
    }

    #[tokio::test]
    async fn full_registry_makes_room_from_idle_sessions() {
        let state = app_state(|c| {
            c.server.max_sessions = 1;
            c.server.session_idle_timeout = Duration::ZERO;
        });
        state.open_session("old").await.unwrap();

        assert!(state.open_session("new").await.unwrap().is_some());
        assert!(state.sessions.get("old").is_none());
    }

    fn cookie_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn reads_session_cookie_among_others() {
        let sid = Uuid::new_v4().to_string();
        let headers = cookie_headers(&format!("theme=dark; {SESSION_COOKIE}={sid}; lang=en"));
        assert_eq!(session_cookie(&headers), Some(sid));
    }

    #[test]
    fn ignores_malformed_session_cookie() {
        let headers = cookie_headers(&format!("{SESSION_COOKIE}=../../etc/passwd"));
        assert!(session_cookie(&headers).is_none());
        assert!(session_cookie(&HeaderMap::new()).is_none());
    }

    #[test]
    fn mints_session_id_when_missing() {
        let (sid, is_new) = session_id(&HeaderMap::new());
        assert!(is_new);
        assert!(Uuid::parse_str(&sid).is_ok());

        let (same, is_new) = session_id(&cookie_headers(&format!("{SESSION_COOKIE}={sid}")));
        assert!(!is_new);
        assert_eq!(same, sid);
    }

    #[test]
    fn new_sessions_get_cookie() {
        let response = with_cookie(StatusCode::OK.into_response(), "abc", true);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("graph_sid=abc;"));
        assert!(cookie.contains("HttpOnly"));

        let response = with_cookie(StatusCode::OK.into_response(), "abc", false);
        assert!(!response.headers().contains_key(header::SET_COOKIE));
    }

    #[test]
    fn redirect_uses_found_status() {
        let response = redirect_response(Redirect {
            location: "https://login.example.com/authorize?state=x".to_string(),
            status: FOUND,
        });
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://login.example.com/authorize?state=x"
        );
    }

    #[test]
    fn follow_falls_back_to_landing() {
        let response = follow(&RedirectSlot::new(), "/");
        assert_eq!(response.headers()[header::LOCATION], "/");
    }
}
