use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::domain::{EnvelopeStatus, Recipient, SigningDocument};
use super::token::AuthGrant;
use crate::config::SigningConfig;

/// Identifiers returned after the provider accepted a new envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEnvelope {
    pub envelope_id: String,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeDocument {
    pub document_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeState {
    pub status: EnvelopeStatus,
    pub completed: bool,
}

impl EnvelopeState {
    pub fn from_status(status: EnvelopeStatus) -> Self {
        Self {
            status,
            completed: status == EnvelopeStatus::Completed,
        }
    }
}

/// Everything the provider needs to open a signing transaction.
#[derive(Debug, Clone)]
pub struct EnvelopeDraft {
    pub document: SigningDocument,
    pub recipients: Vec<Recipient>,
    pub subject: String,
}

/// Provider document id for the merged, signed PDF.
pub const COMBINED_DOCUMENT_ID: &str = "combined";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope requires at least one recipient")]
    NoRecipients,
    #[error("envelope or recipient not found at provider: {0}")]
    NotFound(String),
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider call timed out")]
    Timeout,
}

impl EnvelopeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Provider calls needed by the signing workflow. Every call carries a fresh grant.
#[async_trait]
pub trait EnvelopeGateway: Send + Sync + Debug {
    async fn create_envelope(
        &self,
        grant: &AuthGrant,
        draft: &EnvelopeDraft,
    ) -> Result<CreatedEnvelope, EnvelopeError>;

    /// Returns a freshly minted embedded-signing URL. Repeated calls are expected and
    /// may yield different URLs.
    async fn signing_url(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
        recipient: &Recipient,
    ) -> Result<String, EnvelopeError>;

    async fn list_documents(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<Vec<EnvelopeDocument>, EnvelopeError>;

    async fn download_document(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
        document_id: &str,
    ) -> Result<Vec<u8>, EnvelopeError>;

    async fn envelope_state(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<EnvelopeState, EnvelopeError>;
}

/// Builds the provider create-envelope body. Fails fast when no recipient is present
/// so the caller never pays for a network round trip.
pub fn envelope_payload(draft: &EnvelopeDraft) -> Result<serde_json::Value, EnvelopeError> {
    if draft.recipients.is_empty() {
        return Err(EnvelopeError::NoRecipients);
    }

    let signers: Vec<serde_json::Value> = draft
        .recipients
        .iter()
        .enumerate()
        .map(|(index, recipient)| {
            json!({
                "email": recipient.email,
                "name": recipient.name,
                "recipientId": (index + 1).to_string(),
                "routingOrder": recipient.routing_order.to_string(),
                "clientUserId": recipient.client_user_id,
                "tabs": {
                    "signHereTabs": [{
                        "anchorString": recipient.anchor.tag,
                        "anchorUnits": "pixels",
                        "anchorXOffset": recipient.anchor.x_offset.to_string(),
                        "anchorYOffset": recipient.anchor.y_offset.to_string(),
                    }]
                }
            })
        })
        .collect();

    Ok(json!({
        "emailSubject": draft.subject,
        "documents": [{
            "documentBase64": BASE64.encode(&draft.document.bytes),
            "name": draft.document.name,
            "fileExtension": draft.document.file_extension,
            "documentId": "1",
        }],
        "recipients": { "signers": signers },
        "status": "sent",
    }))
}

/// REST client for the provider's envelope API (v2.1 shaped).
pub struct RestEnvelopeClient {
    api_base: String,
    account_id: String,
    return_url: String,
    http: reqwest::Client,
}

impl Debug for RestEnvelopeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestEnvelopeClient")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl RestEnvelopeClient {
    pub fn from_config(config: &SigningConfig) -> Result<Self, EnvelopeError> {
        Self::new(
            &config.api_base,
            &config.account_id,
            &config.return_url,
            config.http_timeout,
        )
    }

    pub fn new(
        api_base: &str,
        account_id: &str,
        return_url: &str,
        timeout: Duration,
    ) -> Result<Self, EnvelopeError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|error| EnvelopeError::Unavailable(error.to_string()))?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            return_url: return_url.to_string(),
            http,
        })
    }

    fn envelopes_url(&self) -> String {
        format!("{}/v2.1/accounts/{}/envelopes", self.api_base, self.account_id)
    }

    fn envelope_url(&self, envelope_id: &str) -> String {
        format!("{}/{}", self.envelopes_url(), envelope_id)
    }

    async fn checked(
        response: Result<reqwest::Response, reqwest::Error>,
        subject: &str,
    ) -> Result<reqwest::Response, EnvelopeError> {
        let response = response.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_provider_failure(status, &body, subject))
    }
}

#[async_trait]
impl EnvelopeGateway for RestEnvelopeClient {
    async fn create_envelope(
        &self,
        grant: &AuthGrant,
        draft: &EnvelopeDraft,
    ) -> Result<CreatedEnvelope, EnvelopeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            envelope_id: String,
        }

        let payload = envelope_payload(draft)?;
        let request = self
            .http
            .post(self.envelopes_url())
            .bearer_auth(grant.access_token.expose_secret())
            .json(&payload)
            .send()
            .await;
        let response = Self::checked(request, "envelope").await?;
        let created: Created = response
            .json()
            .await
            .map_err(|error| EnvelopeError::Unavailable(format!("malformed response: {error}")))?;

        Ok(CreatedEnvelope {
            envelope_id: created.envelope_id,
            account_id: self.account_id.clone(),
        })
    }

    async fn signing_url(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
        recipient: &Recipient,
    ) -> Result<String, EnvelopeError> {
        #[derive(Deserialize)]
        struct View {
            url: String,
        }

        let request = self
            .http
            .post(format!("{}/views/recipient", self.envelope_url(envelope_id)))
            .bearer_auth(grant.access_token.expose_secret())
            .json(&json!({
                "returnUrl": self.return_url,
                "authenticationMethod": "none",
                "email": recipient.email,
                "userName": recipient.name,
                "clientUserId": recipient.client_user_id,
            }))
            .send()
            .await;
        let response = Self::checked(request, envelope_id).await?;
        let view: View = response
            .json()
            .await
            .map_err(|error| EnvelopeError::Unavailable(format!("malformed response: {error}")))?;

        if view.url.trim().is_empty() {
            return Err(EnvelopeError::Provider {
                code: "EMPTY_SIGNING_URL".to_string(),
                message: "provider returned an empty recipient view url".to_string(),
            });
        }
        Ok(view.url)
    }

    async fn list_documents(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<Vec<EnvelopeDocument>, EnvelopeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Listing {
            #[serde(default)]
            envelope_documents: Vec<ListedDocument>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListedDocument {
            document_id: String,
            #[serde(default)]
            name: String,
            #[serde(default, rename = "type")]
            kind: Option<String>,
        }

        let request = self
            .http
            .get(format!("{}/documents", self.envelope_url(envelope_id)))
            .bearer_auth(grant.access_token.expose_secret())
            .send()
            .await;
        let response = Self::checked(request, envelope_id).await?;
        let listing: Listing = response
            .json()
            .await
            .map_err(|error| EnvelopeError::Unavailable(format!("malformed response: {error}")))?;

        Ok(listing
            .envelope_documents
            .into_iter()
            .map(|doc| EnvelopeDocument {
                document_id: doc.document_id,
                name: doc.name,
                kind: doc.kind,
            })
            .collect())
    }

    async fn download_document(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
        document_id: &str,
    ) -> Result<Vec<u8>, EnvelopeError> {
        let request = self
            .http
            .get(format!(
                "{}/documents/{}",
                self.envelope_url(envelope_id),
                document_id
            ))
            .bearer_auth(grant.access_token.expose_secret())
            .send()
            .await;
        let response = Self::checked(request, envelope_id).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn envelope_state(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<EnvelopeState, EnvelopeError> {
        #[derive(Deserialize)]
        struct Envelope {
            status: String,
        }

        let request = self
            .http
            .get(self.envelope_url(envelope_id))
            .bearer_auth(grant.access_token.expose_secret())
            .send()
            .await;
        let response = Self::checked(request, envelope_id).await?;
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|error| EnvelopeError::Unavailable(format!("malformed response: {error}")))?;

        Ok(EnvelopeState::from_status(EnvelopeStatus::from_provider(
            &envelope.status,
        )))
    }
}

fn transport_error(error: reqwest::Error) -> EnvelopeError {
    if error.is_timeout() {
        EnvelopeError::Timeout
    } else {
        EnvelopeError::Unavailable(error.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

const NOT_FOUND_CODES: &[&str] = &[
    "ENVELOPE_DOES_NOT_EXIST",
    "INVALID_ENVELOPE_ID",
    "UNKNOWN_ENVELOPE_RECIPIENT",
    "RECIPIENT_NOT_IN_SEQUENCE",
];

pub(crate) fn classify_provider_failure(
    status: StatusCode,
    body: &str,
    subject: &str,
) -> EnvelopeError {
    let parsed: ProviderErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error_code
        .clone()
        .unwrap_or_else(|| status.as_u16().to_string());

    if status == StatusCode::NOT_FOUND || NOT_FOUND_CODES.contains(&code.as_str()) {
        return EnvelopeError::NotFound(subject.to_string());
    }

    let message = parsed
        .message
        .unwrap_or_else(|| format!("provider returned {status}"));

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return EnvelopeError::Unavailable(format!("{code}: {message}"));
    }

    EnvelopeError::Provider { code, message }
}
