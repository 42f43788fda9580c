//! Authorization flow
//!
//! Idle -> AwaitingCallback on `login()`, back to Idle when the callback
//! arrives, whether it is accepted or not. A state value is accepted at most once.

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::GraphSession;
use crate::events::SessionEvent;
use crate::redirect::FOUND;
use crate::{Error, Result};

impl GraphSession {
    /// Start an authorization attempt: generate a fresh `state`, build the
    /// authorization URL and redirect the user to it.
    ///
    /// Any previous open attempt is abandoned. Returns the authorization URL.
    pub fn login(&mut self) -> Result<&str> {
        let state = generate_state();

        let mut auth_url = Url::parse(&self.config.auth_endpoint())
            .map_err(|e| Error::Config(format!("Invalid auth endpoint: {e}")))?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope_string())
            .append_pair("state", &state);

        if self.authstate.is_some() {
            debug!("Replacing unfinished authorization attempt");
        }
        self.authstate = Some(state);
        self.state.authorization_url = auth_url.into();

        info!(scopes = %self.config.scope_string(), "Redirecting to authorization endpoint");
        self.emit(SessionEvent::LoginStarted);
        self.redirects.redirect(&self.state.authorization_url, FOUND);

        Ok(self.state.authorization_url.as_str())
    }

    /// Handle the authority's callback on `redirect_uri`.
    ///
    /// The in-flight state is consumed before anything else, so a replayed or
    /// forged callback can never match later. On a match the code is exchanged
    /// for tokens and the user is redirected to `redirect_to` whatever the
    /// exchange outcome.
    ///
    /// # Errors
    ///
    /// - `Error::StateMismatch` if `received_state` is not the in-flight state
    ///   (no token request is made and no redirect is issued)
    /// - `Error::TokenExchange` if the authority did not return an access token
    /// - transport and storage errors as raised
    pub async fn handle_redirect(
        &mut self,
        received_state: &str,
        received_code: &str,
        redirect_to: &str,
    ) -> Result<()> {
        let expected = self.authstate.take();

        if !state_matches(expected.as_deref(), received_state) {
            warn!(
                awaiting = expected.is_some(),
                "Authorization callback state mismatch"
            );
            return Err(Error::StateMismatch {
                expected: redact(expected.as_deref().unwrap_or_default()),
                received: redact(received_state),
            });
        }

        debug!("Authorization callback accepted, exchanging code");

        let token_endpoint = self.config.token_endpoint();
        let response = self
            .transport
            .post_form(
                &token_endpoint,
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("grant_type", "authorization_code"),
                    ("code", received_code),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                ],
            )
            .await?;

        let outcome = self.save(&response.body).and_then(|()| self.persist());
        if outcome.is_ok() {
            info!(expires_in = self.remaining_seconds(), "Logged in");
            self.emit(SessionEvent::LoggedIn {
                expires_at: self.state.token_expires_at,
            });
        }

        if !redirect_to.is_empty() {
            self.redirects.redirect(redirect_to, FOUND);
        }
        outcome
    }
}

/// Unpredictable anti-forgery token
fn generate_state() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Exact, constant-time comparison; nothing in flight never matches
fn state_matches(expected: Option<&str>, received: &str) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => {
            expected.as_bytes().ct_eq(received.as_bytes()).into()
        }
        _ => false,
    }
}

/// First few characters only; state values are not logged or surfaced in full
fn redact(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let head: String = value.chars().take(4).collect();
    format!("{head}…")
}
