#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use deal_signing::config::RetryConfig;
use deal_signing::workflows::signing::{
    AuthGrant, ContractForm, ContractOrchestrator, CreatedEnvelope, DealKey, EmailMessage,
    EnvelopeDocument, EnvelopeDraft, EnvelopeError, EnvelopeGateway, EnvelopeState,
    EnvelopeStatus, MemorySessionStore, NotificationGateway, NotifyError, Recipient, RetryBudget,
    TokenBroker, TokenError,
};
use secrecy::SecretString;

pub const CONSENT_URL: &str = "https://auth.example/oauth/auth?client_id=fake";

#[derive(Debug, Default)]
pub struct FakeTokens {
    scripted: Mutex<VecDeque<TokenError>>,
    always: Mutex<Option<TokenError>>,
    calls: Mutex<usize>,
}

impl FakeTokens {
    pub fn fail_next(&self, error: TokenError) {
        self.scripted.lock().expect("token mutex").push_back(error);
    }

    pub fn fail_always(&self, error: TokenError) {
        *self.always.lock().expect("token mutex") = Some(error);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("token mutex")
    }
}

#[async_trait]
impl TokenBroker for FakeTokens {
    async fn acquire_token(&self) -> Result<AuthGrant, TokenError> {
        *self.calls.lock().expect("token mutex") += 1;
        if let Some(error) = self.scripted.lock().expect("token mutex").pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always.lock().expect("token mutex").clone() {
            return Err(error);
        }
        Ok(AuthGrant {
            access_token: SecretString::from("fake-access-token".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            scope: vec!["signature".to_string(), "impersonation".to_string()],
        })
    }

    fn consent_url(&self) -> String {
        CONSENT_URL.to_string()
    }
}

/// Counts every provider call so tests can assert exactly how much network traffic
/// an operation produced.
#[derive(Debug, Default)]
pub struct Counters {
    pub create: usize,
    pub signing_url: usize,
    pub list: usize,
    pub download: usize,
    pub status: usize,
}

impl Counters {
    pub fn total(&self) -> usize {
        self.create + self.signing_url + self.list + self.download + self.status
    }
}

#[derive(Debug, Default)]
pub struct FakeEnvelopes {
    counters: Mutex<Counters>,
    create_failures: Mutex<VecDeque<EnvelopeError>>,
    create_always_fails: Mutex<Option<EnvelopeError>>,
    url_failures: Mutex<VecDeque<EnvelopeError>>,
    drafts: Mutex<Vec<EnvelopeDraft>>,
    statuses: Mutex<HashMap<String, EnvelopeStatus>>,
    completes_after: Mutex<HashMap<String, usize>>,
    status_checks: Mutex<HashMap<String, usize>>,
    missing: Mutex<HashSet<String>>,
    crash_on_status: AtomicBool,
}

impl FakeEnvelopes {
    pub fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().expect("counter mutex")
    }

    pub fn fail_create_next(&self, error: EnvelopeError) {
        self.create_failures.lock().expect("envelope mutex").push_back(error);
    }

    pub fn fail_create_always(&self, error: EnvelopeError) {
        *self.create_always_fails.lock().expect("envelope mutex") = Some(error);
    }

    pub fn fail_signing_url_next(&self, error: EnvelopeError) {
        self.url_failures.lock().expect("envelope mutex").push_back(error);
    }

    pub fn set_status(&self, envelope_id: &str, status: EnvelopeStatus) {
        self.statuses
            .lock()
            .expect("envelope mutex")
            .insert(envelope_id.to_string(), status);
    }

    /// The envelope reports `Completed` from the n-th status check onwards.
    pub fn complete_after(&self, envelope_id: &str, checks: usize) {
        self.completes_after
            .lock()
            .expect("envelope mutex")
            .insert(envelope_id.to_string(), checks);
    }

    pub fn remove_envelope(&self, envelope_id: &str) {
        self.missing
            .lock()
            .expect("envelope mutex")
            .insert(envelope_id.to_string());
    }

    /// The next status check panics inside the gateway.
    pub fn crash_on_status_check(&self) {
        self.crash_on_status.store(true, Ordering::SeqCst);
    }

    pub fn drafts(&self) -> Vec<EnvelopeDraft> {
        self.drafts.lock().expect("envelope mutex").clone()
    }

    pub fn signed_document(envelope_id: &str) -> Vec<u8> {
        format!("%PDF-1.7 signed {envelope_id}").into_bytes()
    }

    fn ensure_exists(&self, envelope_id: &str) -> Result<(), EnvelopeError> {
        if self.missing.lock().expect("envelope mutex").contains(envelope_id) {
            return Err(EnvelopeError::NotFound(envelope_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeGateway for FakeEnvelopes {
    async fn create_envelope(
        &self,
        _grant: &AuthGrant,
        draft: &EnvelopeDraft,
    ) -> Result<CreatedEnvelope, EnvelopeError> {
        self.counters().create += 1;
        if let Some(error) = self.create_failures.lock().expect("envelope mutex").pop_front() {
            return Err(error);
        }
        if let Some(error) = self.create_always_fails.lock().expect("envelope mutex").clone() {
            return Err(error);
        }
        if draft.recipients.is_empty() {
            return Err(EnvelopeError::NoRecipients);
        }

        let mut drafts = self.drafts.lock().expect("envelope mutex");
        drafts.push(draft.clone());
        let envelope_id = format!("E{}", drafts.len());
        self.set_status(&envelope_id, EnvelopeStatus::Sent);
        Ok(CreatedEnvelope {
            envelope_id,
            account_id: "acct-1".to_string(),
        })
    }

    async fn signing_url(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
        recipient: &Recipient,
    ) -> Result<String, EnvelopeError> {
        let call = {
            let mut counters = self.counters();
            counters.signing_url += 1;
            counters.signing_url
        };
        self.ensure_exists(envelope_id)?;
        if let Some(error) = self.url_failures.lock().expect("envelope mutex").pop_front() {
            return Err(error);
        }
        Ok(format!(
            "https://sign.example/{envelope_id}/view?recipient={}&ticket={call}",
            recipient.client_user_id
        ))
    }

    async fn list_documents(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<Vec<EnvelopeDocument>, EnvelopeError> {
        self.counters().list += 1;
        self.ensure_exists(envelope_id)?;
        Ok(vec![
            EnvelopeDocument {
                document_id: "1".to_string(),
                name: "Purchase Agreement".to_string(),
                kind: Some("content".to_string()),
            },
            EnvelopeDocument {
                document_id: "certificate".to_string(),
                name: "Summary".to_string(),
                kind: Some("summary".to_string()),
            },
        ])
    }

    async fn download_document(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
        _document_id: &str,
    ) -> Result<Vec<u8>, EnvelopeError> {
        self.counters().download += 1;
        self.ensure_exists(envelope_id)?;
        Ok(Self::signed_document(envelope_id))
    }

    async fn envelope_state(
        &self,
        _grant: &AuthGrant,
        envelope_id: &str,
    ) -> Result<EnvelopeState, EnvelopeError> {
        self.counters().status += 1;
        if self.crash_on_status.swap(false, Ordering::SeqCst) {
            panic!("status backend crashed for {envelope_id}");
        }
        self.ensure_exists(envelope_id)?;

        let checks = {
            let mut checks = self.status_checks.lock().expect("envelope mutex");
            let entry = checks.entry(envelope_id.to_string()).or_default();
            *entry += 1;
            *entry
        };
        if let Some(threshold) = self
            .completes_after
            .lock()
            .expect("envelope mutex")
            .get(envelope_id)
        {
            if checks >= *threshold {
                return Ok(EnvelopeState::from_status(EnvelopeStatus::Completed));
            }
        }

        let status = self
            .statuses
            .lock()
            .expect("envelope mutex")
            .get(envelope_id)
            .copied()
            .unwrap_or(EnvelopeStatus::Sent);
        Ok(EnvelopeState::from_status(status))
    }
}

#[derive(Debug, Default)]
pub struct FakeMailer {
    failure: Mutex<Option<NotifyError>>,
    sent: Mutex<Vec<EmailMessage>>,
}

impl FakeMailer {
    pub fn fail_with(&self, error: NotifyError) {
        *self.failure.lock().expect("mail mutex") = Some(error);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().expect("mail mutex").clone()
    }
}

#[async_trait]
impl NotificationGateway for FakeMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), NotifyError> {
        if let Some(error) = self.failure.lock().expect("mail mutex").clone() {
            return Err(error);
        }
        self.sent.lock().expect("mail mutex").push(message);
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: ContractOrchestrator,
    pub tokens: Arc<FakeTokens>,
    pub envelopes: Arc<FakeEnvelopes>,
    pub mailer: Arc<FakeMailer>,
    pub sessions: MemorySessionStore,
}

impl Harness {
    pub fn new() -> Self {
        let tokens = Arc::new(FakeTokens::default());
        let envelopes = Arc::new(FakeEnvelopes::default());
        let mailer = Arc::new(FakeMailer::default());
        let sessions = MemorySessionStore::default();
        let orchestrator = ContractOrchestrator::new(
            tokens.clone(),
            envelopes.clone(),
            Arc::new(sessions.clone()),
            mailer.clone(),
        );

        Self {
            orchestrator,
            tokens,
            envelopes,
            mailer,
            sessions,
        }
    }

    pub fn network_calls(&self) -> usize {
        self.tokens.calls() + self.envelopes.counters().total()
    }
}

pub fn deal() -> DealKey {
    DealKey::from_address(&contract_form().property_address).expect("deal key")
}

pub fn contract_form() -> ContractForm {
    ContractForm {
        property_address: "40 Mesa Ridge Rd, Marfa TX".to_string(),
        parcel_id: Some("R-1120".to_string()),
        acreage: Some("12.5".to_string()),
        buyer_name: "B".to_string(),
        buyer_email: "buyer@x.com".to_string(),
        seller_name: "Sam Seller".to_string(),
        seller_email: Some("seller@x.com".to_string()),
        purchase_price: 85_000,
        earnest_money: 1_000,
        closing_date: NaiveDate::from_ymd_opt(2026, 12, 1).expect("valid date"),
        inspection_period_days: Some(10),
        additional_terms: None,
    }
}

pub fn budget(manual: u32, auto: u32) -> RetryBudget {
    RetryBudget::new(manual, auto, Duration::ZERO)
}

pub fn default_budget() -> RetryBudget {
    RetryBudget::from_config(&RetryConfig {
        backoff: Duration::ZERO,
        ..RetryConfig::default()
    })
}
