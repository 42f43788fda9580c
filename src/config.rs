//! Configuration management

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Base URL for calls to Microsoft Graph
pub const DEFAULT_RESOURCE: &str = "https://graph.microsoft.com/";
/// Graph API version (`beta` is the alternative)
pub const DEFAULT_API_VERSION: &str = "v1.0";
/// Base URL of the authorization authority
pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com/common";
/// Authorization endpoint path under the authority
pub const AUTH_ENDPOINT_PATH: &str = "/oauth2/v2.0/authorize";
/// Token endpoint path under the authority
pub const TOKEN_ENDPOINT_PATH: &str = "/oauth2/v2.0/token";
/// Scope that governs refresh-token issuance
pub const OFFLINE_ACCESS: &str = "offline_access";

/// Host configuration: the session settings plus the demo server
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// OAuth session settings
    pub session: SessionConfig,
    /// Demo HTTP host settings
    pub server: ServerConfig,
}

/// Settings for one Graph session. Read-only once handed to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Client ID (application ID) from the app registration portal
    pub client_id: String,
    /// Client secret from the app registration portal.
    /// Supports: literal value, `env:VAR_NAME`, or `${VAR}` expansion
    pub client_secret: String,
    /// Must match the value registered with the authority
    pub redirect_uri: String,
    /// Requested scopes, in request order
    pub scopes: Vec<String>,
    /// Base URL for Graph calls
    pub resource: String,
    /// Graph API version
    pub api_version: String,
    /// Base URL for the authorization authority
    pub authority_url: String,
    /// Authorization endpoint (derived from `authority_url` when unset)
    pub auth_endpoint: Option<String>,
    /// Token endpoint (derived from `authority_url` when unset)
    pub token_endpoint: Option<String>,
    /// Persist session state to the state store
    pub cache_state: bool,
    /// Silently refresh expired tokens
    pub refresh_enable: bool,
    /// Minimum remaining token lifetime before a Graph call triggers refresh
    pub refresh_threshold_secs: u64,
    /// Directory for persisted session records (default `~/.graph-session`)
    pub state_dir: Option<PathBuf>,
    /// Record name for the persisted session state
    pub state_record: String,
    /// Timeout for outbound requests
    #[serde(with = "duration_str")]
    pub http_timeout: Duration,
    /// Skip TLS certificate verification on outbound calls. Never enable in production.
    pub danger_accept_invalid_certs: bool,
    /// User-Agent header for Graph calls
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scopes: Vec::new(),
            resource: DEFAULT_RESOURCE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            authority_url: DEFAULT_AUTHORITY_URL.to_string(),
            auth_endpoint: None,
            token_endpoint: None,
            cache_state: false,
            refresh_enable: true,
            refresh_threshold_secs: 5,
            state_dir: None,
            state_record: "state".to_string(),
            http_timeout: Duration::from_secs(30),
            danger_accept_invalid_certs: false,
            user_agent: concat!("graph-session/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a config with the required identity fields and scopes; everything else defaulted
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Enforce invariants and fill derived defaults.
    ///
    /// Normalizes scopes, reconciles `offline_access` with `refresh_enable`,
    /// derives endpoints from `authority_url` and rejects empty identity
    /// fields or malformed URLs.
    pub fn validated(mut self) -> Result<Self> {
        for (name, value) in [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", &self.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} is required")));
            }
        }

        if self.api_version.trim().is_empty() {
            return Err(Error::Config("api_version must not be empty".to_string()));
        }

        parse_url("redirect_uri", &self.redirect_uri)?;
        parse_url("authority_url", &self.authority_url)?;
        parse_url("resource", &self.resource)?;
        if !self.resource.ends_with('/') {
            self.resource.push('/');
        }

        let auth_endpoint = self.auth_endpoint();
        let token_endpoint = self.token_endpoint();
        parse_url("auth_endpoint", &auth_endpoint)?;
        parse_url("token_endpoint", &token_endpoint)?;
        self.auth_endpoint = Some(auth_endpoint);
        self.token_endpoint = Some(token_endpoint);

        self.normalize_scopes();
        self.reconcile_refresh_scope();

        if self.state_record.trim().is_empty() {
            return Err(Error::Config("state_record must not be empty".to_string()));
        }

        Ok(self)
    }

    /// Toggle silent refresh, keeping `offline_access` in step
    pub fn set_refresh_enable(&mut self, enable: bool) {
        self.refresh_enable = enable;
        self.reconcile_refresh_scope();
    }

    /// Authorization endpoint, explicit or derived from the authority
    #[must_use]
    pub fn auth_endpoint(&self) -> String {
        self.auth_endpoint
            .clone()
            .unwrap_or_else(|| join_authority(&self.authority_url, AUTH_ENDPOINT_PATH))
    }

    /// Token endpoint, explicit or derived from the authority
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.token_endpoint
            .clone()
            .unwrap_or_else(|| join_authority(&self.authority_url, TOKEN_ENDPOINT_PATH))
    }

    /// Requested scopes joined the way the authorization request carries them
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// Directory for persisted records, falling back to `~/.graph-session`
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(expand_home(&dir.to_string_lossy()).into());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".graph-session"))
    }

    /// Copy with the client secret masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.client_secret.is_empty() {
            copy.client_secret = "***".to_string();
        }
        copy
    }

    /// Trim, drop empties and de-duplicate (case-insensitive, first wins)
    fn normalize_scopes(&mut self) {
        let mut seen: Vec<String> = Vec::with_capacity(self.scopes.len());
        let mut normalized = Vec::with_capacity(self.scopes.len());
        for scope in &self.scopes {
            let scope = scope.trim();
            if scope.is_empty() {
                continue;
            }
            let key = scope.to_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                normalized.push(scope.to_string());
            }
        }
        self.scopes = normalized;
    }

    /// `refresh_enable` takes precedence over whether `offline_access` was requested
    fn reconcile_refresh_scope(&mut self) {
        let present = self
            .scopes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(OFFLINE_ACCESS));
        if self.refresh_enable {
            if !present {
                self.scopes.push(OFFLINE_ACCESS.to_string());
            }
        } else if present {
            self.scopes.retain(|s| !s.eq_ignore_ascii_case(OFFLINE_ACCESS));
        }
    }

    /// Resolve `env:VAR` secrets and expand `${VAR}` in identity fields
    fn expand_env_vars(&mut self, re: &Regex) {
        self.client_id = expand_string(re, &self.client_id);
        self.redirect_uri = expand_string(re, &self.redirect_uri);
        self.client_secret = if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_default()
        } else {
            expand_string(re, &self.client_secret)
        };
    }
}

/// Demo host server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Where users land after login, logout or a failed callback
    pub landing_path: String,
    /// Path the authority redirects back to (must match `redirect_uri`)
    pub callback_path: String,
    /// Upper bound on concurrently hosted sessions
    pub max_sessions: usize,
    /// Hosted sessions unused for this long are dropped
    #[serde(with = "duration_str")]
    pub session_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            landing_path: "/".to_string(),
            callback_path: "/login/authorized".to_string(),
            max_sessions: 1024,
            session_idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl HostConfig {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the session settings fail validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // GRAPH_SESSION__CLIENT_ID, GRAPH_SERVER__PORT, ...
        figment = figment.merge(Env::prefixed("GRAPH_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        let re = env_var_pattern();
        config.session.expand_env_vars(&re);
        config.session = config.session.validated()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Pattern: ${VAR} or ${VAR:-default}
fn env_var_pattern() -> Regex {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("static pattern is valid")
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

fn join_authority(authority_url: &str, path: &str) -> String {
    format!("{}{path}", authority_url.trim_end_matches('/'))
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| Error::Config(format!("Invalid {name} '{value}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!("{name} must be an http(s) URL")));
    }
    Ok(url)
}

/// `Duration` as a short string: `30s`, `2m`, `500ms` or bare seconds
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Environment overrides arrive as integers, YAML usually as strings
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(text) => text,
        };
        let raw = raw.trim();

        // "ms" before "s", or "500ms" would parse as "500m" seconds
        let parsed = if let Some(ms) = raw.strip_suffix("ms") {
            ms.trim().parse().map(Duration::from_millis)
        } else if let Some(mins) = raw.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            raw.strip_suffix('s').unwrap_or(raw).trim().parse().map(Duration::from_secs)
        };
        parsed.map_err(|e| D::Error::custom(format!("invalid duration '{raw}': {e}")))
    }
}
