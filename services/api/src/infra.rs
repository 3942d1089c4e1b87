use async_trait::async_trait;
use chrono::Utc;
use deal_signing::workflows::signing::{
    AuthGrant, CreatedEnvelope, EmailMessage, EnvelopeDocument, EnvelopeDraft, EnvelopeError,
    EnvelopeGateway, EnvelopeState, EnvelopeStatus, NotificationGateway, NotifyError, Recipient,
    TokenBroker, TokenError, COMBINED_DOCUMENT_ID,
};
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

pub(crate) const SANDBOX_CONSENT_URL: &str =
    "https://sandbox.local/oauth/auth?response_type=code&scope=signature%20impersonation&client_id=sandbox";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Debug, Clone)]
struct SandboxEnvelope {
    name: String,
    document: Vec<u8>,
    signers: Vec<String>,
    status: EnvelopeStatus,
    viewed: bool,
}

/// In-process stand-in for the e-signature provider used by `demo` and by local runs
/// without credentials. A recipient counts as signed once a signing URL has been
/// issued for the envelope and its status is checked.
#[derive(Debug, Default, Clone)]
pub(crate) struct SandboxProvider {
    envelopes: Arc<Mutex<HashMap<String, SandboxEnvelope>>>,
    created: Arc<AtomicUsize>,
    tickets: Arc<AtomicUsize>,
    outages: Arc<AtomicU32>,
}

impl SandboxProvider {
    /// The next `count` envelope creations fail as if the provider were down.
    pub(crate) fn simulate_outages(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    pub(crate) fn decline(&self, envelope_id: &str) -> bool {
        let mut guard = self.envelopes.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get_mut(envelope_id) {
            Some(envelope) => {
                envelope.status = EnvelopeStatus::Declined;
                true
            }
            None => false,
        }
    }

    fn with_envelope<T>(
        &self,
        envelope_id: &str,
        f: impl FnOnce(&mut SandboxEnvelope) -> T,
    ) -> Result<T, EnvelopeError> {
        let mut guard = self.envelopes.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get_mut(envelope_id)
            .map(f)
            .ok_or_else(|| EnvelopeError::NotFound(envelope_id.to_string()))
    }

    fn take_outage(&self) -> bool {
        self.outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TokenBroker for SandboxProvider {
    async fn acquire_token(&self) -> Result<AuthGrant, TokenError> {
        Ok(AuthGrant {
            access_token: SecretString::from("sandbox-access-token".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            scope: vec!["signature".to_string(), "impersonation".to_string()],
        })
    }

    fn consent_url(&self) -> String {
        SANDBOX_CONSENT_URL.to_string()
    }
}

#[async_trait]
impl EnvelopeGateway for SandboxProvider {
    async fn create_envelope(
        &self,
        _grant: &AuthGrant,
        draft: &EnvelopeDraft,
    ) -> Result<CreatedEnvelope, EnvelopeError> {
        if self.take_outage() {
            return Err(EnvelopeError::Unavailable(
                "sandbox: simulated provider outage".to_string(),
            ));
        }
        if draft.recipients.is_empty() {
            return Err(EnvelopeError::NoRecipients);
        }

        let envelope_id = format!("sbx-{:04}", self.created.fetch_add(1, Ordering::SeqCst) + 1);
        let envelope = SandboxEnvelope {
            name: draft.document.name.clone(),
            document: draft.document.bytes.clone(),
            signers: draft.recipients.iter().map(|r| r.email.clone()).collect(),
            status: EnvelopeStatus::Sent,
            viewed: false,
        };
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(envelope_id.clone(), envelope);
        debug!(envelope_id = %envelope_id, subject = %draft.subject, "sandbox envelope created");

        Ok(CreatedEnvelope {
            envelope_id,
            account_id: "sandbox-account".to_string(),
        })
    }

    async fn signing_url(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
        recipient: &Recipient,
    ) -> Result<String, EnvelopeError> {
        self.with_envelope(envelope_id, |envelope| {
            envelope.viewed = true;
            if envelope.status == EnvelopeStatus::Sent {
                envelope.status = EnvelopeStatus::Delivered;
            }
        })?;
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "https://sandbox.local/sign/{envelope_id}?recipient={}&ticket={ticket}",
            recipient.client_user_id
        ))
    }

    async fn list_documents(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<Vec<EnvelopeDocument>, EnvelopeError> {
        self.with_envelope(envelope_id, |envelope| {
            vec![EnvelopeDocument {
                document_id: "1".to_string(),
                name: envelope.name.clone(),
                kind: Some("content".to_string()),
            }]
        })
    }

    async fn download_document(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
        document_id: &str,
    ) -> Result<Vec<u8>, EnvelopeError> {
        if document_id != COMBINED_DOCUMENT_ID && document_id != "1" {
            return Err(EnvelopeError::NotFound(format!("{envelope_id}/{document_id}")));
        }
        self.with_envelope(envelope_id, |envelope| {
            let mut bytes = envelope.document.clone();
            if envelope.status == EnvelopeStatus::Completed {
                for signer in &envelope.signers {
                    bytes.extend_from_slice(
                        format!("\n<!-- signed in sandbox by {signer} -->").as_bytes(),
                    );
                }
            }
            bytes
        })
    }

    async fn envelope_state(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<EnvelopeState, EnvelopeError> {
        let status = self.with_envelope(envelope_id, |envelope| {
            if envelope.viewed && !envelope.status.is_terminal() {
                envelope.status = EnvelopeStatus::Completed;
            }
            envelope.status
        })?;
        Ok(EnvelopeState::from_status(status))
    }
}

/// Mail gateway that keeps messages in memory and logs them instead of sending.
#[derive(Debug, Default, Clone)]
pub(crate) struct OutboxMailer {
    outbox: Arc<Mutex<Vec<EmailMessage>>>,
}

impl OutboxMailer {
    pub(crate) fn outbox(&self) -> Vec<EmailMessage> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl NotificationGateway for OutboxMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            attachment = message.attachment.as_ref().map(|a| a.filename.as_str()),
            "mail captured in outbox"
        );
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
