//! # Ephemeral Credentials
//!
//! Every session starts by asking an external token service for a short-lived
//! bearer credential. The engine never sees a long-lived API key.
//!
//! ## Accepted response shapes:
//! - `{"value": "...", "expiresAt": 1700000000}`
//! - `{"token": "...", "apiUrl": "...", "sessionId": "..."}`
//! - `{"client_secret": {"value": "...", "expires_at": 1700000000}}`

use crate::error::TokenError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// A short-lived bearer credential for one session.
///
/// Not `Clone`: negotiation takes it by value so it is used at most once.
pub struct EphemeralCredential {
    value: String,
    expires_at: Option<DateTime<Utc>>,
    endpoint: Option<String>,
    session_id: Option<String>,
}

impl EphemeralCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
            endpoint: None,
            session_id: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Service URL the token service asked us to negotiate against.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Utc::now()).unwrap_or(false)
    }
}

impl fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("endpoint", &self.endpoint)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// What the token service needs to prepare a session.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialRequest {
    pub model: String,
    pub voice: String,
    #[serde(rename = "systemPrompt")]
    pub system_prompt: String,
    #[serde(rename = "memoryContext", skip_serializing_if = "Option::is_none")]
    pub memory_context: Option<String>,
}

/// Source of ephemeral credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self, request: &CredentialRequest) -> Result<EphemeralCredential, TokenError>;
}

/// Token service reached over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpCredentialProvider {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn issue(&self, request: &CredentialRequest) -> Result<EphemeralCredential, TokenError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let credential = parse_token_response(&body)?;
        debug!(
            expires_at = ?credential.expires_at(),
            endpoint = ?credential.endpoint(),
            "Obtained ephemeral credential"
        );
        Ok(credential)
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    value: Option<String>,
    token: Option<String>,
    client_secret: Option<ClientSecret>,
    #[serde(rename = "expiresAt", alias = "expires_at")]
    expires_at: Option<i64>,
    #[serde(rename = "apiUrl")]
    api_url: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Parse any of the accepted token response shapes.
pub fn parse_token_response(body: &str) -> Result<EphemeralCredential, TokenError> {
    let parsed: TokenResponse =
        serde_json::from_str(body).map_err(|e| TokenError::Request(format!("invalid token response: {}", e)))?;

    let (value, nested_expiry) = match (parsed.value, parsed.token, parsed.client_secret) {
        (Some(value), _, _) | (None, Some(value), _) => (value, None),
        (None, None, Some(secret)) => (secret.value, secret.expires_at),
        (None, None, None) => return Err(TokenError::MissingCredential),
    };

    if value.trim().is_empty() {
        return Err(TokenError::MissingCredential);
    }

    let expires_at = parsed
        .expires_at
        .or(nested_expiry)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Ok(EphemeralCredential {
        value,
        expires_at,
        endpoint: parsed.api_url.filter(|url| !url.trim().is_empty()),
        session_id: parsed.session_id,
    })
}
