use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::transport::negotiator::{
    DEFAULT_DISCOVERY_TIMEOUT, MAX_DISCOVERY_TIMEOUT, MIN_DISCOVERY_TIMEOUT,
};

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid relay url {url}: {reason}")]
    RelayUrl { url: String, reason: String },
}

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Relay server base URL (http/https or ws/wss)
    pub relay_url: String,
    /// Upper bound on candidate discovery before a description is sent
    pub discovery_timeout: Duration,
    /// STUN servers; empty means host candidates only
    pub stun_urls: Vec<String>,
    /// Overrides the platform config directory for persisted state
    pub home: Option<PathBuf>,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let relay_url = lookup("TETHER_RELAY_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let discovery_timeout = lookup("TETHER_DISCOVERY_TIMEOUT_MS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT)
            .clamp(MIN_DISCOVERY_TIMEOUT, MAX_DISCOVERY_TIMEOUT);

        let stun_urls = lookup("TETHER_STUN_URLS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let home = lookup("TETHER_HOME")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Self {
            relay_url,
            discovery_timeout,
            stun_urls,
            home,
        }
    }

    /// Websocket endpoint for the control connection.
    pub fn websocket_url(&self) -> Result<Url, ConfigError> {
        derive_websocket_url(&self.relay_url)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            stun_urls: Vec::new(),
            home: None,
        }
    }
}

/// `http://host:3000` becomes `ws://host:3000/ws`. An explicit path is kept.
pub fn derive_websocket_url(base: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::RelayUrl {
        url: base.to_string(),
        reason,
    };
    // Normalize localhost to IPv4 to avoid an IPv6 (::1) preference.
    let base = base.replacen("://localhost", "://127.0.0.1", 1);
    let mut url = Url::parse(&base).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot change scheme".into()))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}
