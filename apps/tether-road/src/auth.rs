//! Bearer credentials and the provider login round trip.
//!
//! Clients present an HS256 token issued here. Tokens are minted once the
//! configured OAuth2 provider has vouched for the user; after that the
//! provider is never consulted again.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tether_proto::{Role, UserProfile};
use thiserror::Error;
use url::Url;

use crate::config::{Config, OAuthProviderConfig};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token signing failed: {0}")]
    Signing(jsonwebtoken::errors::Error),
    #[error("login provider is not configured")]
    ProviderNotConfigured,
    #[error("unknown login provider {0}")]
    UnknownProvider(String),
    #[error("login state is missing or malformed")]
    InvalidState,
    #[error("invalid provider url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected login: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(&self, user: &UserProfile) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(AuthError::Signing)
    }

    /// Validates signature and expiry; returns the claims of a good token.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::Provider("token has no subject".into()));
        }
        Ok(data.claims)
    }
}

/// Where the login started, carried through the provider as `state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginState {
    pub device_id: String,
    pub role: Role,
}

impl LoginState {
    pub fn encode(&self) -> String {
        // Serializing two plain strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, AuthError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim_end_matches('='))
            .map_err(|_| AuthError::InvalidState)?;
        serde_json::from_slice(&bytes).map_err(|_| AuthError::InvalidState)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(alias = "id")]
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct OAuthProvider {
    config: OAuthProviderConfig,
    redirect_uri: String,
    client: Client,
}

impl OAuthProvider {
    pub fn new(config: OAuthProviderConfig, public_url: &str) -> Self {
        let redirect_uri = format!("{}/auth/{}/callback", public_url, config.name);
        Self {
            config,
            redirect_uri,
            client: Client::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn authorize_url(&self, state: &LoginState) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.config.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes)
            .append_pair("state", &state.encode());
        Ok(url)
    }

    pub async fn exchange(&self, code: &str) -> Result<UserProfile, AuthError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Provider(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;

        let response = self
            .client
            .get(&self.config.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Provider(format!(
                "userinfo endpoint returned {}",
                response.status()
            )));
        }
        let info: UserInfo = response.json().await?;
        Ok(UserProfile {
            id: info.sub,
            email: info.email,
            name: info.name,
        })
    }
}

/// Token issuing plus the optional provider, shared by the websocket and
/// HTTP handlers.
pub struct AuthService {
    pub tokens: TokenIssuer,
    provider: Option<OAuthProvider>,
}

impl AuthService {
    pub fn new(tokens: TokenIssuer, provider: Option<OAuthProvider>) -> Self {
        Self { tokens, provider }
    }

    pub fn from_config(config: &Config) -> Self {
        let tokens = TokenIssuer::new(
            config.jwt_secret.as_bytes(),
            Duration::from_secs(config.token_ttl_seconds),
        );
        let provider = config
            .oauth
            .clone()
            .map(|oauth| OAuthProvider::new(oauth, &config.public_url));
        Self::new(tokens, provider)
    }

    pub fn provider(&self, name: &str) -> Result<&OAuthProvider, AuthError> {
        let provider = self
            .provider
            .as_ref()
            .ok_or(AuthError::ProviderNotConfigured)?;
        if provider.name() != name {
            return Err(AuthError::UnknownProvider(name.to_string()));
        }
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(ttl: Duration) -> TokenIssuer {
        TokenIssuer::new(b"test-secret", ttl)
    }

    fn user() -> UserProfile {
        UserProfile {
            id: "user-123".into(),
            email: Some("u@example.com".into()),
            name: None,
        }
    }

    #[test_timeout::timeout]
    fn issued_token_verifies_to_subject() {
        let tokens = issuer(Duration::from_secs(3600));
        let token = tokens.issue(&user()).unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.email.as_deref(), Some("u@example.com"));
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test_timeout::timeout]
    fn foreign_or_garbage_tokens_are_rejected() {
        let token = TokenIssuer::new(b"other-secret", Duration::from_secs(60))
            .issue(&user())
            .unwrap();
        let tokens = issuer(Duration::from_secs(60));
        assert!(matches!(
            tokens.verify(&token),
            Err(AuthError::InvalidToken(_))
        ));
        assert!(tokens.verify("not.a.token").is_err());
    }

    #[test_timeout::timeout]
    fn expired_token_is_rejected() {
        let tokens = issuer(Duration::from_secs(60));
        let now = chrono::Utc::now().timestamp() as u64;
        let claims = Claims {
            sub: "user-123".into(),
            email: None,
            name: None,
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(tokens.verify(&token).is_err());
    }

    #[test_timeout::timeout]
    fn login_state_survives_provider_round_trip() {
        let state = LoginState {
            device_id: "dev-1".into(),
            role: Role::Viewer,
        };
        let raw = state.encode();
        assert!(!raw.contains('+') && !raw.contains('/'));
        assert_eq!(LoginState::decode(&raw).unwrap(), state);
        assert!(matches!(
            LoginState::decode("%%%"),
            Err(AuthError::InvalidState)
        ));
    }

    #[test_timeout::timeout]
    fn authorize_url_carries_client_and_state() {
        let provider = OAuthProvider::new(
            OAuthProviderConfig {
                name: "google".into(),
                client_id: "cid".into(),
                client_secret: "secret".into(),
                authorize_url: "https://idp.example.com/authorize".into(),
                token_url: "https://idp.example.com/token".into(),
                userinfo_url: "https://idp.example.com/userinfo".into(),
                scopes: "openid email".into(),
            },
            "https://relay.example.com",
        );
        let state = LoginState {
            device_id: "dev-1".into(),
            role: Role::Host,
        };
        let url = provider.authorize_url(&state).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(
            pairs["redirect_uri"],
            "https://relay.example.com/auth/google/callback"
        );
        assert_eq!(LoginState::decode(&pairs["state"]).unwrap(), state);
    }

    #[test_timeout::timeout]
    fn missing_provider_is_reported() {
        let service = AuthService::new(issuer(Duration::from_secs(60)), None);
        assert!(matches!(
            service.provider("google"),
            Err(AuthError::ProviderNotConfigured)
        ));
    }
}
