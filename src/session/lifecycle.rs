//! Token lifecycle: expiry, refresh, saving token responses, scope checks.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::GraphSession;
use crate::config::OFFLINE_ACCESS;
use crate::events::{ScopeMismatch, SessionEvent};
use crate::state::unix_now;
use crate::{Error, Result};

/// Lifetime assumed when the authority omits `expires_in`
const DEFAULT_EXPIRES_IN: u64 = 3600;

impl GraphSession {
    /// Seconds until the access token expires; 0 without a token or once expired
    #[must_use]
    pub fn remaining_seconds(&self) -> u64 {
        self.state.remaining_seconds_at(unix_now())
    }

    /// Make sure the token is good for at least `min_seconds`, refreshing if
    /// it is not and refresh is enabled. Every Graph call passes through here.
    pub async fn ensure_valid(&mut self, min_seconds: u64) -> Result<()> {
        if self.remaining_seconds() < min_seconds && self.config.refresh_enable {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// No-op when refresh is disabled.
    ///
    /// # Errors
    ///
    /// `Error::TokenExchange` (session reset to logged out) if no refresh
    /// token is held or the authority rejects it; transport and storage
    /// errors as raised.
    pub async fn refresh(&mut self) -> Result<()> {
        if !self.config.refresh_enable {
            return Ok(());
        }

        let Some(refresh_token) = self.state.refresh_token.clone() else {
            // Nothing to exchange: an expiring token must not be kept
            warn!("No refresh token held, resetting session");
            self.clear(None)?;
            return Err(Error::token_exchange("missing refresh_token", None));
        };

        let token_endpoint = self.config.token_endpoint();
        let response = self
            .transport
            .post_form(
                &token_endpoint,
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                ],
            )
            .await?;

        self.save(&response.body)?;
        self.persist()?;

        info!(expires_in = self.remaining_seconds(), "Token refreshed successfully");
        self.emit(SessionEvent::TokenRefreshed {
            expires_at: self.state.token_expires_at,
        });
        Ok(())
    }

    /// Save a token endpoint response body.
    ///
    /// Without an `access_token` the session is reset to logged out (no
    /// redirect) and `Error::TokenExchange` is returned. Otherwise the scopes
    /// are checked (advisory only) and the token, expiry and refresh token are
    /// stored, with `loggedin` set in the same step.
    pub fn save(&mut self, body: &Value) -> Result<()> {
        let Some(access_token) = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        else {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("missing access_token")
                .to_string();
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .map(str::to_string);

            warn!(error = %error, "Token endpoint did not return an access token");
            if let Err(e) = self.clear(None) {
                warn!(error = %e, "Failed to clear session after rejected exchange");
            }
            return Err(Error::token_exchange(error, description));
        };

        match body.get("scope").and_then(Value::as_str) {
            Some(granted) => {
                self.verify_scopes(granted);
            }
            None => {
                // Omitted scope means the requested scope was granted
                self.state.token_scope = requested_scopes(&self.config.scopes)
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(" ");
            }
        }

        let expires_in = parse_expires_in(body.get("expires_in")).unwrap_or_else(|| {
            debug!(default = DEFAULT_EXPIRES_IN, "Token response has no expires_in");
            DEFAULT_EXPIRES_IN
        });

        self.state.access_token = Some(access_token.to_string());
        self.state.loggedin = true;
        self.state.token_expires_at = unix_now().saturating_add(expires_in);
        self.state.refresh_token = body
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        debug!(
            expires_in,
            has_refresh_token = self.state.refresh_token.is_some(),
            "Saved access token"
        );
        Ok(())
    }

    /// Record the granted scopes and compare them with the requested ones.
    ///
    /// A mismatch is reported (log and event) and returned, but the token is
    /// kept: it is still good for whatever the authority granted.
    pub fn verify_scopes(&mut self, granted: &str) -> Option<ScopeMismatch> {
        self.state.token_scope = granted.to_string();

        let mismatch = compare_scopes(&self.config.scopes, granted)?;
        warn!(
            missing = ?mismatch.missing(),
            unexpected = ?mismatch.unexpected(),
            "Token granted with different scopes than requested"
        );
        self.emit(SessionEvent::ScopeMismatch(mismatch.clone()));
        Some(mismatch)
    }
}

/// Case-insensitive set comparison of requested (minus `offline_access`) and
/// granted scopes. `None` when they agree.
#[must_use]
pub fn compare_scopes(requested: &[String], granted: &str) -> Option<ScopeMismatch> {
    let requested = requested_scopes(requested);
    let granted: BTreeSet<String> = granted.split_whitespace().map(str::to_lowercase).collect();

    if requested == granted {
        None
    } else {
        Some(ScopeMismatch { requested, granted })
    }
}

fn requested_scopes(scopes: &[String]) -> BTreeSet<String> {
    scopes
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| s != OFFLINE_ACCESS)
        .collect()
}

/// `expires_in` as a number, or a numeric string (older authority versions)
fn parse_expires_in(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
