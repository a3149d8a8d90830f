use std::env;
use std::time::Duration;

/// Whether registering without a bearer credential is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Anonymous endpoints register and pair by code.
    Optional,
    /// Anonymous endpoints are told to log in first.
    Required,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Externally reachable base url, used for the provider redirect uri.
    pub public_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: u64,
    pub auth_policy: AuthPolicy,
    pub pairing_code_ttl: Duration,
    pub debug_pairing_code: bool,
    pub code_sweep_interval: Duration,
    pub oauth: Option<OAuthProviderConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str| {
            lookup(key)
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let number = |key: &str, fallback: u64| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(fallback)
        };

        let port = lookup("TETHER_ROAD_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let public_url = lookup("TETHER_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let oauth = match (
            lookup("TETHER_OAUTH_CLIENT_ID"),
            lookup("TETHER_OAUTH_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => Some(OAuthProviderConfig {
                name: lookup("TETHER_OAUTH_PROVIDER").unwrap_or_else(|| "google".into()),
                client_id,
                client_secret,
                authorize_url: lookup("TETHER_OAUTH_AUTHORIZE_URL")
                    .unwrap_or_else(|| "https://accounts.google.com/o/oauth2/v2/auth".into()),
                token_url: lookup("TETHER_OAUTH_TOKEN_URL")
                    .unwrap_or_else(|| "https://oauth2.googleapis.com/token".into()),
                userinfo_url: lookup("TETHER_OAUTH_USERINFO_URL")
                    .unwrap_or_else(|| "https://openidconnect.googleapis.com/v1/userinfo".into()),
                scopes: lookup("TETHER_OAUTH_SCOPES")
                    .unwrap_or_else(|| "openid email profile".into()),
            }),
            _ => None,
        };

        Self {
            port,
            public_url,
            jwt_secret: lookup("TETHER_JWT_SECRET").unwrap_or(defaults.jwt_secret),
            token_ttl_seconds: number("TETHER_TOKEN_TTL", defaults.token_ttl_seconds),
            auth_policy: if flag("TETHER_REQUIRE_LOGIN") {
                AuthPolicy::Required
            } else {
                AuthPolicy::Optional
            },
            pairing_code_ttl: Duration::from_secs(number(
                "TETHER_PAIRING_CODE_TTL",
                defaults.pairing_code_ttl.as_secs(),
            )),
            debug_pairing_code: flag("TETHER_DEBUG_PAIRING_CODE"),
            code_sweep_interval: Duration::from_secs(
                number(
                    "TETHER_CODE_SWEEP_INTERVAL",
                    defaults.code_sweep_interval.as_secs(),
                )
                .max(1),
            ),
            oauth,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.oauth
            .as_ref()
            .map(|provider| provider.name.as_str())
            .unwrap_or("google")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            public_url: "http://localhost:3000".to_string(),
            jwt_secret: "tether-development-secret".to_string(),
            token_ttl_seconds: 30 * 24 * 60 * 60,
            auth_policy: AuthPolicy::Optional,
            pairing_code_ttl: Duration::from_secs(5 * 60),
            debug_pairing_code: false,
            code_sweep_interval: Duration::from_secs(15),
            oauth: None,
        }
    }
}
