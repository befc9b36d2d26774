//! Upstream Authentication
//!
//! Produces the header that authenticates each upstream realtime connection:
//! either a static `api-key` or an `Authorization: Bearer` token obtained from
//! a token credential.

use crate::config::Credential;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, header::AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

/// Scope requested for Azure Cognitive Services tokens.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";
/// The Microsoft Entra authority used by [`ClientSecretCredential`].
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Tokens are refreshed once they are this close to expiring.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// A bearer token together with the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

/// A source of bearer tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, scope: &str) -> Result<AccessToken>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Obtains tokens for a service principal with the client-credentials grant.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
}

impl ClientSecretCredential {
    pub fn new(tenant_id: String, client_id: String, client_secret: SecretString) -> Self {
        Self::with_authority(DEFAULT_AUTHORITY, tenant_id, client_id, client_secret)
    }

    pub fn with_authority(
        authority: &str,
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            authority: authority.trim_end_matches('/').to_string(),
            tenant_id,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, scope: &str) -> Result<AccessToken> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let requested_at = Instant::now();
        let response: TokenResponse = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("scope", scope),
            ])
            .send()
            .await
            .context("Token request failed")?
            .error_for_status()
            .context("Token endpoint rejected the request")?
            .json()
            .await
            .context("Token endpoint returned an unexpected body")?;

        Ok(AccessToken {
            token: SecretString::from(response.access_token),
            expires_at: requested_at + Duration::from_secs(response.expires_in),
        })
    }
}

/// Hands out bearer tokens, reusing the last one while it is still fresh.
pub struct BearerTokenProvider {
    credential: Arc<dyn TokenCredential>,
    scope: String,
    cached: Mutex<Option<AccessToken>>,
}

impl BearerTokenProvider {
    /// Creates the provider and fetches the first token right away so the
    /// first relay session does not pay for it.
    pub async fn new(credential: Arc<dyn TokenCredential>, scope: &str) -> Result<Self> {
        let provider = Self {
            credential,
            scope: scope.to_string(),
            cached: Mutex::new(None),
        };
        provider.token().await?;
        Ok(provider)
    }

    /// Returns a valid token, fetching a new one if the cached one is stale.
    pub async fn token(&self) -> Result<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            debug!("Reusing cached bearer token");
            return Ok(token.token.clone());
        }
        let token = self
            .credential
            .get_token(&self.scope)
            .await
            .context("Failed to obtain a bearer token")?;
        info!("Obtained a new bearer token");
        let secret = token.token.clone();
        *cached = Some(token);
        Ok(secret)
    }
}

/// Authentication applied to every upstream connection.
pub enum AuthProvider {
    ApiKey(SecretString),
    Bearer(BearerTokenProvider),
}

impl AuthProvider {
    /// Resolves the configured credential, warming the token cache for
    /// bearer authentication.
    pub async fn from_credential(credential: &Credential) -> Result<Self> {
        match credential {
            Credential::ApiKey(key) => Ok(Self::ApiKey(key.clone())),
            Credential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let credential = ClientSecretCredential::new(
                    tenant_id.clone(),
                    client_id.clone(),
                    client_secret.clone(),
                );
                let provider =
                    BearerTokenProvider::new(Arc::new(credential), COGNITIVE_SERVICES_SCOPE)
                        .await?;
                Ok(Self::Bearer(provider))
            }
        }
    }

    /// The header to attach to a new upstream connection.
    pub async fn header(&self) -> Result<(HeaderName, HeaderValue)> {
        match self {
            Self::ApiKey(key) => {
                let mut value = HeaderValue::from_str(key.expose_secret())
                    .context("API key is not a valid header value")?;
                value.set_sensitive(true);
                Ok((HeaderName::from_static("api-key"), value))
            }
            Self::Bearer(provider) => {
                let token = provider.token().await?;
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                    .context("Bearer token is not a valid header value")?;
                value.set_sensitive(true);
                Ok((AUTHORIZATION, value))
            }
        }
    }
}
