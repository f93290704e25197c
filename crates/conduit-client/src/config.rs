//! Client configuration and authentication policy.
//!
//! A [`ClientConfig`] is immutable once a [`Client`](crate::Client) holds
//! it. Switching tokens or workspaces produces a new client value rather
//! than mutating shared state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::retry::Backoff;

/// Default timeout for requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for streaming requests.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Header carrying the selected workspace.
pub const WORKSPACE_HEADER: &str = "X-Workspace-Id";

/// Environment variables read by [`ClientConfig::from_env`].
pub mod env {
    pub const BASE_URL: &str = "CONDUIT_BASE_URL";
    pub const API_TOKEN: &str = "CONDUIT_API_TOKEN";
    pub const AUTH_SCHEME: &str = "CONDUIT_AUTH_SCHEME";
    pub const WORKSPACE_ID: &str = "CONDUIT_WORKSPACE_ID";
    pub const TIMEOUT_SECS: &str = "CONDUIT_TIMEOUT_SECS";
    pub const MAX_RETRIES: &str = "CONDUIT_MAX_RETRIES";
}

/// How the token is presented to the platform.
///
/// Both schemes currently send `Authorization: Bearer <token>`; they are
/// tracked separately so they can diverge without an API change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthScheme {
    #[default]
    Bearer,
    ApiKey,
}

impl AuthScheme {
    /// `Authorization` header value for a token.
    pub fn header_value(&self, token: &str) -> String {
        match self {
            AuthScheme::Bearer | AuthScheme::ApiKey => format!("Bearer {token}"),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bearer" => Ok(AuthScheme::Bearer),
            "api-key" | "api_key" | "apikey" => Ok(AuthScheme::ApiKey),
            other => Err(Error::Config(format!("unknown auth scheme '{other}'"))),
        }
    }
}

/// Settings shared by every request a client makes.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL, always ending in `/`.
    pub base_url: Url,
    pub auth_scheme: AuthScheme,
    /// API token. Empty means requests go out unauthenticated.
    pub token: String,
    /// Headers applied to every request before auth and per-request headers.
    pub default_headers: Vec<(String, String)>,
    pub workspace_id: Option<String>,
    pub timeout: Duration,
    pub stream_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub user_agent: String,
}

impl ClientConfig {
    /// Create a config with defaults for everything but the base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            auth_scheme: AuthScheme::default(),
            token: String::new(),
            default_headers: Vec::new(),
            workspace_id: None,
            timeout: DEFAULT_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            user_agent: default_user_agent(),
        })
    }

    /// Load configuration from `CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(env::BASE_URL)
            .ok_or_else(|| Error::Config(format!("{} is not set", env::BASE_URL)))?;
        let mut config = Self::new(&base_url)?;

        if let Some(token) = lookup(env::API_TOKEN) {
            config.token = token;
        }
        if let Some(scheme) = lookup(env::AUTH_SCHEME) {
            config.auth_scheme = scheme.parse()?;
        }
        config.workspace_id = lookup(env::WORKSPACE_ID).filter(|id| !id.is_empty());
        if let Some(secs) = lookup(env::TIMEOUT_SECS) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a number of seconds", env::TIMEOUT_SECS))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = lookup(env::MAX_RETRIES) {
            config.max_retries = retries.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be a non-negative integer",
                    env::MAX_RETRIES
                ))
            })?;
        }

        Ok(config)
    }

    /// `Authorization` header value, or `None` without a token.
    pub(crate) fn authorization(&self) -> Option<String> {
        if self.token.is_empty() {
            None
        } else {
            Some(self.auth_scheme.header_value(&self.token))
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url.as_str())
            .field("auth_scheme", &self.auth_scheme)
            .field("token", &if self.token.is_empty() { "" } else { "[redacted]" })
            .field("default_headers", &self.default_headers)
            .field("workspace_id", &self.workspace_id)
            .field("timeout", &self.timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn default_user_agent() -> String {
    format!("conduit-client/{}", env!("CARGO_PKG_VERSION"))
}

/// Parse a base URL and make sure relative paths join underneath it.
pub(crate) fn normalize_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() {
        return Err(Error::Config(format!("'{raw}' cannot be used as a base URL")));
    }
    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(
            normalize_base_url("http://localhost:8080").unwrap().as_str(),
            "http://localhost:8080/"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/v1").unwrap().as_str(),
            "https://api.example.com/v1/"
        );
        assert_eq!(
            normalize_base_url("https://api.example.com/v1/?x=1").unwrap().as_str(),
            "https://api.example.com/v1/"
        );
        assert!(normalize_base_url("not a url").is_err());
        assert!(normalize_base_url("mailto:ops@example.com").is_err());
    }

    #[test]
    fn test_both_schemes_send_bearer() {
        assert_eq!(AuthScheme::Bearer.header_value("t0k"), "Bearer t0k");
        assert_eq!(AuthScheme::ApiKey.header_value("t0k"), "Bearer t0k");
    }

    #[test]
    fn test_auth_scheme_parsing() {
        assert_eq!("Bearer".parse::<AuthScheme>().unwrap(), AuthScheme::Bearer);
        assert_eq!("api-key".parse::<AuthScheme>().unwrap(), AuthScheme::ApiKey);
        assert!("basic".parse::<AuthScheme>().is_err());
    }

    #[test]
    fn test_no_token_means_no_authorization() {
        let config = ClientConfig::new("http://localhost").unwrap();
        assert_eq!(config.authorization(), None);
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("http://localhost").unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.stream_timeout, DEFAULT_STREAM_TIMEOUT);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.backoff, Backoff::default());
        assert!(config.user_agent.starts_with("conduit-client/"));
    }

    #[test]
    fn test_from_lookup() {
        let config = ClientConfig::from_lookup(lookup(&[
            (env::BASE_URL, "https://api.example.com/v1"),
            (env::API_TOKEN, "secret"),
            (env::AUTH_SCHEME, "api-key"),
            (env::WORKSPACE_ID, "ws-1"),
            (env::TIMEOUT_SECS, "5"),
            (env::MAX_RETRIES, "0"),
        ]))
        .unwrap();

        assert_eq!(config.base_url.as_str(), "https://api.example.com/v1/");
        assert_eq!(config.auth_scheme, AuthScheme::ApiKey);
        assert_eq!(config.authorization().as_deref(), Some("Bearer secret"));
        assert_eq!(config.workspace_id.as_deref(), Some("ws-1"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_from_lookup_requires_base_url() {
        let err = ClientConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let err = ClientConfig::from_lookup(lookup(&[
            (env::BASE_URL, "http://localhost"),
            (env::MAX_RETRIES, "-1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut config = ClientConfig::new("http://localhost").unwrap();
        config.token = "super-secret".to_string();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[redacted]"));
    }
}
