use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::UtcpError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Basic,
    OAuth2,
}

pub trait Auth: Send + Sync + std::fmt::Debug {
    fn auth_type(&self) -> AuthType;
    fn validate(&self) -> Result<(), AuthError>;
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API key must be provided")]
    MissingApiKey,
    #[error("Location must be 'header', 'query', or 'cookie'")]
    InvalidLocation,
    #[error("Username must be provided")]
    MissingUsername,
    #[error("Password must be provided")]
    MissingPassword,
    #[error("Token URL must be provided")]
    MissingTokenUrl,
    #[error("Client ID must be provided")]
    MissingClientId,
    #[error("Client secret must be provided")]
    MissingClientSecret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    pub auth_type: AuthType,
    pub api_key: String,
    pub var_name: String,
    pub location: String, // "header", "query", or "cookie"
}

impl ApiKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self {
            auth_type: AuthType::ApiKey,
            api_key,
            var_name: "X-Api-Key".to_string(),
            location: "header".to_string(),
        }
    }
}

impl Auth for ApiKeyAuth {
    fn auth_type(&self) -> AuthType {
        AuthType::ApiKey
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.api_key.is_empty() {
            return Err(AuthError::MissingApiKey);
        }
        match self.location.as_str() {
            "header" | "query" | "cookie" => Ok(()),
            _ => Err(AuthError::InvalidLocation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub auth_type: AuthType,
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: String, password: String) -> Self {
        Self {
            auth_type: AuthType::Basic,
            username,
            password,
        }
    }
}

impl Auth for BasicAuth {
    fn auth_type(&self) -> AuthType {
        AuthType::Basic
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.username.is_empty() {
            return Err(AuthError::MissingUsername);
        }
        if self.password.is_empty() {
            return Err(AuthError::MissingPassword);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Auth {
    pub auth_type: AuthType,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuth2Auth {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    ) -> Self {
        Self {
            auth_type: AuthType::OAuth2,
            token_url,
            client_id,
            client_secret,
            scope,
        }
    }
}

impl Auth for OAuth2Auth {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2
    }

    fn validate(&self) -> Result<(), AuthError> {
        if self.token_url.is_empty() {
            return Err(AuthError::MissingTokenUrl);
        }
        if self.client_id.is_empty() {
            return Err(AuthError::MissingClientId);
        }
        if self.client_secret.is_empty() {
            return Err(AuthError::MissingClientSecret);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthConfig {
    ApiKey(ApiKeyAuth),
    Basic(BasicAuth),
    OAuth2(OAuth2Auth),
}

impl Auth for AuthConfig {
    fn auth_type(&self) -> AuthType {
        match self {
            AuthConfig::ApiKey(auth) => auth.auth_type(),
            AuthConfig::Basic(auth) => auth.auth_type(),
            AuthConfig::OAuth2(auth) => auth.auth_type(),
        }
    }

    fn validate(&self) -> Result<(), AuthError> {
        match self {
            AuthConfig::ApiKey(auth) => auth.validate(),
            AuthConfig::Basic(auth) => auth.validate(),
            AuthConfig::OAuth2(auth) => auth.validate(),
        }
    }
}

/// Refresh the cached token once it is within this window of expiring.
const REFRESH_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-credentials token source for one provider's `oauth2` config.
///
/// The async mutex is held across the refresh request, so concurrent callers
/// sharing a provider coalesce into a single token fetch.
pub struct OAuth2TokenSource {
    client: reqwest::Client,
    current: Mutex<Option<CachedToken>>,
}

impl OAuth2TokenSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            current: Mutex::new(None),
        }
    }

    /// Return a valid access token, fetching or refreshing as needed.
    pub async fn access_token(&self, auth: &OAuth2Auth) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(tok) = current.as_ref() {
            if Instant::now() + REFRESH_MARGIN < tok.expires_at {
                return Ok(tok.access_token.clone());
            }
        }

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", auth.client_id.clone()),
            ("client_secret", auth.client_secret.clone()),
        ];
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.clone()));
        }

        let response = self
            .client
            .post(&auth.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| UtcpError::transport("oauth2", e.to_string()))?;
        if !response.status().is_success() {
            return Err(UtcpError::transport(
                "oauth2",
                format!("token endpoint returned {}", response.status()),
            )
            .into());
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| UtcpError::MalformedResponse(format!("token response: {}", e)))?;
        let ttl = Duration::from_secs(token.expires_in.unwrap_or(3600));

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + ttl,
        };
        *current = Some(cached);
        Ok(token.access_token)
    }
}

/// Per-transport cache of token sources, keyed by provider name.
#[derive(Default)]
pub struct OAuth2TokenManager {
    sources: Mutex<HashMap<String, Arc<OAuth2TokenSource>>>,
}

impl OAuth2TokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bearer_token(&self, provider_name: &str, auth: &OAuth2Auth) -> Result<String> {
        let source = {
            let mut sources = self.sources.lock().await;
            sources
                .entry(provider_name.to_string())
                .or_insert_with(|| Arc::new(OAuth2TokenSource::new(reqwest::Client::new())))
                .clone()
        };
        source.access_token(auth).await
    }

    pub async fn forget(&self, provider_name: &str) {
        self.sources.lock().await.remove(provider_name);
    }
}
