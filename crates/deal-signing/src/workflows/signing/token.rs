//! Delegated-authorization grants for the e-signature provider.
//!
//! The service account signs a short-lived RS256 assertion with the server-held
//! private key and exchanges it at the provider's token endpoint. Grants are never
//! cached: every orchestration call chain acquires its own.

use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::SigningConfig;

/// Short-lived bearer credential for provider API calls.
#[derive(Clone)]
pub struct AuthGrant {
    pub access_token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub scope: Vec<String>,
}

impl AuthGrant {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl Debug for AuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGrant")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The service account has not been granted consent at the provider yet.
    #[error("provider consent has not been granted for the integration")]
    ConsentRequired { consent_url: String },
    #[error("provider rejected the integration credentials: {message}")]
    InvalidCredentials { message: String },
    #[error("token endpoint unavailable: {message}")]
    ProviderUnavailable { message: String },
    #[error("token request timed out")]
    Timeout,
}

#[async_trait]
pub trait TokenBroker: Send + Sync + Debug {
    async fn acquire_token(&self) -> Result<AuthGrant, TokenError>;

    /// One-time administrator consent URL for the integration.
    fn consent_url(&self) -> String;
}

/// Production broker performing the JWT bearer grant exchange.
pub struct JwtTokenBroker {
    integration_key: String,
    user_id: String,
    private_key: SecretString,
    auth_base: String,
    consent_redirect_url: String,
    scopes: Vec<String>,
    ttl: Duration,
    http: reqwest::Client,
}

impl Debug for JwtTokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtTokenBroker")
            .field("integration_key", &self.integration_key)
            .field("auth_base", &self.auth_base)
            .finish_non_exhaustive()
    }
}

impl JwtTokenBroker {
    pub fn from_config(config: &SigningConfig) -> Result<Self, TokenError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.http_timeout)
            .build()
            .map_err(|error| TokenError::ProviderUnavailable {
                message: error.to_string(),
            })?;

        Ok(Self {
            integration_key: config.integration_key.clone(),
            user_id: config.user_id.clone(),
            private_key: config.private_key.clone(),
            auth_base: config.auth_base.trim_end_matches('/').to_string(),
            consent_redirect_url: config.consent_redirect_url.clone(),
            scopes: config.scopes.clone(),
            ttl: config.token_ttl,
            http,
        })
    }

    /// Audience claim is the bare auth host, e.g. `account-d.docusign.com`.
    fn audience(&self) -> &str {
        let without_scheme = self
            .auth_base
            .split_once("://")
            .map_or(self.auth_base.as_str(), |(_, rest)| rest);
        without_scheme.split('/').next().unwrap_or(without_scheme)
    }

    fn signed_assertion(&self, now: u64) -> Result<String, TokenError> {
        #[derive(Debug, Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            sub: &'a str,
            aud: &'a str,
            iat: u64,
            exp: u64,
            scope: String,
        }

        let claims = Claims {
            iss: &self.integration_key,
            sub: &self.user_id,
            aud: self.audience(),
            iat: now,
            exp: now + self.ttl.as_secs(),
            scope: self.scopes.join(" "),
        };

        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|error| TokenError::InvalidCredentials {
                message: format!("private key unusable: {error}"),
            })?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|error| {
            TokenError::InvalidCredentials {
                message: format!("assertion signing failed: {error}"),
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[async_trait]
impl TokenBroker for JwtTokenBroker {
    async fn acquire_token(&self) -> Result<AuthGrant, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|error| TokenError::ProviderUnavailable {
                message: error.to_string(),
            })?
            .as_secs();
        let assertion = self.signed_assertion(now)?;

        let response = self
            .http
            .post(format!("{}/oauth/token", self.auth_base))
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_failure(status, &body, self.consent_url()));
        }

        let payload: TokenResponse =
            response
                .json()
                .await
                .map_err(|error| TokenError::ProviderUnavailable {
                    message: format!("malformed token response: {error}"),
                })?;

        let lifetime = payload
            .expires_in
            .map_or(self.ttl, Duration::from_secs)
            .min(self.ttl);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::hours(1));

        Ok(AuthGrant {
            access_token: SecretString::from(payload.access_token),
            expires_at,
            scope: self.scopes.clone(),
        })
    }

    fn consent_url(&self) -> String {
        format!(
            "{}/oauth/auth?response_type=code&scope={}&client_id={}&redirect_uri={}",
            self.auth_base,
            encode_component(&self.scopes.join(" ")),
            encode_component(&self.integration_key),
            encode_component(&self.consent_redirect_url),
        )
    }
}

fn transport_error(error: reqwest::Error) -> TokenError {
    if error.is_timeout() {
        TokenError::Timeout
    } else {
        TokenError::ProviderUnavailable {
            message: error.to_string(),
        }
    }
}

/// Maps a non-success token endpoint response. `consent_required` must never be
/// folded into the generic unavailable bucket: it needs an administrator, not a retry.
pub(crate) fn classify_token_failure(
    status: StatusCode,
    body: &str,
    consent_url: String,
) -> TokenError {
    let parsed: TokenErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error.as_deref().unwrap_or_default();
    let message = parsed
        .error_description
        .clone()
        .or_else(|| parsed.error.clone())
        .unwrap_or_else(|| format!("token endpoint returned {status}"));

    if code == "consent_required" {
        return TokenError::ConsentRequired { consent_url };
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return TokenError::ProviderUnavailable { message };
    }

    match code {
        "invalid_grant" | "invalid_client" | "unauthorized_client" | "no_valid_keys_or_signatures" => {
            TokenError::InvalidCredentials { message }
        }
        _ if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status == StatusCode::BAD_REQUEST =>
        {
            TokenError::InvalidCredentials { message }
        }
        _ => TokenError::ProviderUnavailable { message },
    }
}

fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}
