use std::fmt::Debug;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use super::domain::ContractForm;
use crate::config::MailConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub attachment: Option<Attachment>,
}

/// Credential failures and connectivity failures need different user-facing copy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("mail provider rejected our credentials: {0}")]
    AuthFailed(String),
    #[error("unable to reach mail provider: {0}")]
    ConnectionFailed(String),
    #[error("mail provider refused the message ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl NotifyError {
    pub fn user_message(&self) -> &'static str {
        match self {
            NotifyError::AuthFailed(_) => {
                "Email could not be sent because the mail account credentials were rejected. Contact your administrator."
            }
            NotifyError::ConnectionFailed(_) => {
                "Email could not be sent because the mail service is unreachable. Please try again shortly."
            }
            NotifyError::Rejected { .. } => {
                "Email could not be sent. Check the recipient address and try again."
            }
        }
    }
}

#[async_trait]
pub trait NotificationGateway: Send + Sync + Debug {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError>;
}

/// Transactional mail over a JSON HTTP API with bearer authentication.
pub struct HttpMailer {
    api_url: String,
    api_key: SecretString,
    from: String,
    http: reqwest::Client,
}

impl Debug for HttpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMailer")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl HttpMailer {
    pub fn from_config(config: &MailConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| NotifyError::ConnectionFailed(error.to_string()))?;

        Ok(Self {
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
            http,
        })
    }
}

#[async_trait]
impl NotificationGateway for HttpMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError> {
        let attachments: Vec<serde_json::Value> = message
            .attachment
            .iter()
            .map(|attachment| {
                json!({
                    "filename": attachment.filename,
                    "content_type": attachment.content_type,
                    "content": BASE64.encode(&attachment.bytes),
                })
            })
            .collect();

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
                "attachments": attachments,
            }))
            .send()
            .await
            .map_err(|error| NotifyError::ConnectionFailed(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_mail_failure(status, body))
    }
}

pub(crate) fn classify_mail_failure(status: StatusCode, body: String) -> NotifyError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => NotifyError::AuthFailed(body),
        status if status.is_server_error() => NotifyError::ConnectionFailed(format!(
            "mail provider returned {status}"
        )),
        status => NotifyError::Rejected {
            status: status.as_u16(),
            message: body,
        },
    }
}

pub mod notices {
    //! Transactional email bodies.

    use std::fmt::Write as _;

    use super::{Attachment, ContractForm, EmailMessage};

    /// Delivers the buyer-signed contract to the seller.
    pub fn seller_delivery(
        form: &ContractForm,
        seller_email: &str,
        seller_name: &str,
        document: Vec<u8>,
    ) -> EmailMessage {
        let mut html = String::new();
        let _ = writeln!(html, "<p>Hello {},</p>", escape_html(seller_name));
        let _ = writeln!(
            html,
            "<p>The buyer, {}, has signed the purchase agreement for <strong>{}</strong>.</p>",
            escape_html(&form.buyer_name),
            escape_html(&form.property_address)
        );
        let _ = writeln!(
            html,
            "<p>Purchase price: ${} | Closing date: {}</p>",
            format_dollars(form.purchase_price),
            form.closing_date.format("%B %d, %Y")
        );
        html.push_str(
            "<p>The signed agreement is attached. A separate signing request will follow for your counter-signature.</p>",
        );

        EmailMessage {
            to: seller_email.trim().to_string(),
            subject: format!("Signed purchase agreement: {}", form.property_address),
            html,
            attachment: Some(Attachment {
                filename: format!("{}.pdf", attachment_stem(&form.property_address)),
                content_type: "application/pdf".to_string(),
                bytes: document,
            }),
        }
    }

    /// Tells the scout an admin approved their submitted deal.
    pub fn deal_approved(
        scout_email: &str,
        scout_name: &str,
        property_address: &str,
        note: Option<&str>,
    ) -> EmailMessage {
        let mut html = String::new();
        let _ = writeln!(html, "<p>Hi {},</p>", escape_html(scout_name));
        let _ = writeln!(
            html,
            "<p>Your deal at <strong>{}</strong> has been approved and is moving to buyer matching.</p>",
            escape_html(property_address)
        );
        if let Some(note) = note.filter(|note| !note.trim().is_empty()) {
            let _ = writeln!(html, "<p>Note from the team: {}</p>", escape_html(note.trim()));
        }

        EmailMessage {
            to: scout_email.trim().to_string(),
            subject: format!("Deal approved: {property_address}"),
            html,
            attachment: None,
        }
    }

    pub(crate) fn attachment_stem(address: &str) -> String {
        let stem: String = address
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let trimmed = stem.trim_matches('_');
        if trimmed.is_empty() {
            "signed_contract".to_string()
        } else {
            format!("signed_contract_{trimmed}")
        }
    }

    pub(crate) fn format_dollars(amount: u64) -> String {
        let digits = amount.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (index, c) in digits.chars().enumerate() {
            if index > 0 && (digits.len() - index) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }

    pub(crate) fn escape_html(raw: &str) -> String {
        let mut escaped = String::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '&' => escaped.push_str("&amp;"),
                '<' => escaped.push_str("&lt;"),
                '>' => escaped.push_str("&gt;"),
                '"' => escaped.push_str("&quot;"),
                '\'' => escaped.push_str("&#39;"),
                other => escaped.push(other),
            }
        }
        escaped
    }
}
