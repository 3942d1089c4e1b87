use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::domain::{
    ContractForm, DealKey, EnvelopeStatus, FailureReason, InvalidInput, Recipient,
    SessionKey, SignatureAnchor, SigningDocument, SigningRound, SigningStage, SELLER_ANCHOR,
};
use super::envelope::{EnvelopeDraft, EnvelopeGateway, EnvelopeState, COMBINED_DOCUMENT_ID};
use super::error::SigningError;
use super::notify::{notices, NotificationGateway};
use super::render::{ContractRenderer, HtmlContractRenderer};
use super::retry::RetryBudget;
use super::session::{SessionStore, SigningSession};
use super::token::{AuthGrant, TokenBroker};

/// Caller switches for "prepare contract".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PrepareOptions {
    /// Discard any live envelope and create a new one (hard refresh).
    #[serde(default)]
    pub force_new: bool,
}

impl PrepareOptions {
    pub fn force_new() -> Self {
        Self { force_new: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedContract {
    pub deal: DealKey,
    pub round: SigningRound,
    pub stage: SigningStage,
    pub envelope_id: String,
    pub signing_url: String,
    /// True when an envelope from an earlier call was reused instead of created.
    pub reused_envelope: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub deal: DealKey,
    pub round: SigningRound,
    pub stage: SigningStage,
    pub status: EnvelopeStatus,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SellerDelivery {
    pub deal: DealKey,
    pub stage: SigningStage,
    pub seller_email: String,
    pub document: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDocument {
    pub round: SigningRound,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Both rounds of a deal as currently stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContractSnapshot {
    pub buyer: Option<SigningSession>,
    pub seller: Option<SigningSession>,
}

impl ContractSnapshot {
    /// The furthest stage reached: the seller round once it exists, the buyer round otherwise.
    pub fn stage(&self) -> Option<&SigningStage> {
        self.seller
            .as_ref()
            .or(self.buyer.as_ref())
            .map(|session| &session.stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApprovalNotice {
    pub scout_email: String,
    pub scout_name: String,
    pub property_address: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// Serializes provider calls per session key. Entries are tiny and keyed by deal, so
/// they are kept for the life of the process.
#[derive(Debug, Default, Clone)]
struct SessionLocks {
    inner: Arc<Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    fn handle(&self, key: &SessionKey) -> Arc<AsyncMutex<()>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guard.entry(key.clone()).or_default())
    }
}

/// Drives a deal's contract through both signing rounds.
#[derive(Clone)]
pub struct ContractOrchestrator {
    tokens: Arc<dyn TokenBroker>,
    envelopes: Arc<dyn EnvelopeGateway>,
    sessions: Arc<dyn SessionStore>,
    mailer: Arc<dyn NotificationGateway>,
    renderer: Arc<dyn ContractRenderer>,
    locks: SessionLocks,
}

impl fmt::Debug for ContractOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractOrchestrator")
            .field("tokens", &self.tokens)
            .field("envelopes", &self.envelopes)
            .field("mailer", &self.mailer)
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

impl ContractOrchestrator {
    pub fn new(
        tokens: Arc<dyn TokenBroker>,
        envelopes: Arc<dyn EnvelopeGateway>,
        sessions: Arc<dyn SessionStore>,
        mailer: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            tokens,
            envelopes,
            sessions,
            mailer,
            renderer: Arc::new(HtmlContractRenderer::default()),
            locks: SessionLocks::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ContractRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// One-time administrator consent URL for the signing integration.
    pub fn consent_url(&self) -> String {
        self.tokens.consent_url()
    }

    /// Draft -> EnvelopeCreated -> AwaitingBuyerSignature for the buyer round.
    ///
    /// A live envelope stored for the deal is reused and only its signing URL is
    /// regenerated, unless `options.force_new` asks for a hard refresh.
    pub async fn prepare_contract(
        &self,
        deal: &DealKey,
        form: ContractForm,
        options: PrepareOptions,
        budget: &mut RetryBudget,
    ) -> Result<PreparedContract, SigningError> {
        form.validate()?;

        let key = SessionKey::for_round(deal, SigningRound::Buyer);
        let lock = self.locks.handle(&key);
        let _guard = lock.lock().await;

        let existing = self.sessions.get(&key)?;
        if let Some(SigningStage::Failed(reason)) = existing.as_ref().map(|s| s.stage.clone()) {
            return Err(self.halted(reason));
        }

        let session = match existing {
            Some(existing) if !options.force_new && existing.has_live_envelope() => {
                debug!(deal = %deal, envelope_id = ?existing.envelope_id, "reusing live envelope");
                existing
            }
            Some(existing) if !is_buyer_restartable(&existing.stage) => {
                return Err(SigningError::InvalidTransition {
                    action: "prepare the contract",
                    stage: existing.stage,
                });
            }
            Some(existing) => {
                if let Some(envelope_id) = &existing.envelope_id {
                    info!(deal = %deal, envelope_id = %envelope_id, "superseding envelope");
                }
                SigningSession::draft(deal, SigningRound::Buyer, form.buyer(), form)
            }
            None => SigningSession::draft(deal, SigningRound::Buyer, form.buyer(), form),
        };

        self.drive_round(session, budget).await
    }

    /// The buyer came back from the provider's signing page. The redirect alone is
    /// enough to advance; the provider status is re-checked to record confirmation.
    pub async fn record_buyer_return(&self, deal: &DealKey) -> Result<SigningSession, SigningError> {
        let key = SessionKey::for_round(deal, SigningRound::Buyer);
        let lock = self.locks.handle(&key);
        let _guard = lock.lock().await;

        let mut session = self.load(&key)?;
        match session.stage.clone() {
            SigningStage::BuyerSigned | SigningStage::SentToSeller => return Ok(session),
            SigningStage::EnvelopeCreated | SigningStage::AwaitingBuyerSignature => {}
            SigningStage::Failed(reason) => return Err(self.halted(reason)),
            stage => {
                return Err(SigningError::InvalidTransition {
                    action: "record the buyer return",
                    stage,
                })
            }
        }
        let envelope_id = require_envelope(&session, "record the buyer return")?;

        let confirmed = match self.fetch_state(&envelope_id).await {
            Ok(state) => match state.status {
                EnvelopeStatus::Declined => {
                    self.halt(&mut session, FailureReason::Declined)?;
                    return Err(SigningError::Halted(FailureReason::Declined));
                }
                EnvelopeStatus::Voided => {
                    self.halt(&mut session, FailureReason::Voided)?;
                    return Err(SigningError::Halted(FailureReason::Voided));
                }
                _ => state.completed,
            },
            Err(SigningError::NotFound(subject)) => {
                self.invalidate(&session)?;
                return Err(SigningError::NotFound(subject));
            }
            Err(err) if err.is_transient() => {
                warn!(deal = %deal, error = %err, "status check failed; advancing on redirect alone");
                false
            }
            Err(err) => return Err(err),
        };

        session.stage = SigningStage::BuyerSigned;
        session.signing_url = None;
        session.signature_confirmed = confirmed;
        session.completed = confirmed;
        self.save(&mut session)?;
        info!(
            deal = %deal,
            envelope_id = %envelope_id,
            stage = session.stage.label(),
            confirmed,
            "buyer returned from signing"
        );
        Ok(session)
    }

    /// BuyerSigned -> SentToSeller: download the signed contract and email it.
    ///
    /// The download is the authority check; it fails unless the provider reports the
    /// buyer envelope completed. A mail failure after a good download is reported as
    /// `PartialFailure` carrying the document, and the stage stays `BuyerSigned`.
    pub async fn send_to_seller(
        &self,
        deal: &DealKey,
        seller_email: &str,
        seller_name: &str,
    ) -> Result<SellerDelivery, SigningError> {
        let seller = seller_recipient(seller_email, seller_name)?;

        let key = SessionKey::for_round(deal, SigningRound::Buyer);
        let lock = self.locks.handle(&key);
        let _guard = lock.lock().await;

        let mut session = self.load(&key)?;
        require_buyer_signed(&session, "send the contract to the seller")
            .map_err(|err| self.with_consent_link(err))?;
        let envelope_id = require_envelope(&session, "send the contract to the seller")?;

        let grant = self.tokens.acquire_token().await?;
        let document = match self.signed_bytes(&grant, &envelope_id, SigningRound::Buyer).await {
            Ok(document) => document,
            Err(SigningError::NotFound(subject)) => {
                self.invalidate(&session)?;
                return Err(SigningError::NotFound(subject));
            }
            Err(err) => return Err(err),
        };
        session.signature_confirmed = true;
        session.mark_completed();

        let message = notices::seller_delivery(
            &session.contract_snapshot,
            &seller.email,
            &seller.name,
            document.clone(),
        );
        if let Err(source) = self.mailer.send(message).await {
            self.save(&mut session)?;
            warn!(deal = %deal, error = %source, "signed contract downloaded but seller email failed");
            return Err(SigningError::PartialFailure { document, source });
        }

        session.stage = SigningStage::SentToSeller;
        self.save(&mut session)?;
        info!(
            deal = %deal,
            envelope_id = %envelope_id,
            stage = session.stage.label(),
            "signed contract sent to seller"
        );

        Ok(SellerDelivery {
            deal: deal.clone(),
            stage: session.stage,
            seller_email: seller.email,
            document,
        })
    }

    /// Opens the seller's counter-signature round on the buyer-signed document, stored
    /// under its own session key so the buyer record is kept intact.
    pub async fn prepare_seller_signing(
        &self,
        deal: &DealKey,
        seller_email: &str,
        seller_name: &str,
        options: PrepareOptions,
        budget: &mut RetryBudget,
    ) -> Result<PreparedContract, SigningError> {
        let recipient =
            seller_recipient(seller_email, seller_name)?.with_anchor(SignatureAnchor::at(SELLER_ANCHOR));

        let buyer_key = SessionKey::for_round(deal, SigningRound::Buyer);
        let seller_key = SessionKey::for_round(deal, SigningRound::Seller);
        let buyer_lock = self.locks.handle(&buyer_key);
        let _buyer_guard = buyer_lock.lock().await;
        let seller_lock = self.locks.handle(&seller_key);
        let _seller_guard = seller_lock.lock().await;

        let mut buyer = self.load(&buyer_key)?;
        require_buyer_signed(&buyer, "prepare the seller envelope")
            .map_err(|err| self.with_consent_link(err))?;

        let existing = self.sessions.get(&seller_key)?;
        if let Some(SigningStage::Failed(reason)) = existing.as_ref().map(|s| s.stage.clone()) {
            return Err(self.halted(reason));
        }
        let session = match existing {
            Some(existing) if !options.force_new && existing.has_live_envelope() => existing,
            Some(existing) if existing.stage == SigningStage::FullyExecuted => {
                return Err(SigningError::InvalidTransition {
                    action: "prepare the seller envelope",
                    stage: existing.stage,
                });
            }
            _ => SigningSession::draft(
                deal,
                SigningRound::Seller,
                recipient,
                buyer.contract_snapshot.clone(),
            ),
        };

        let prepared = self.drive_round(session, budget).await?;

        if !buyer.completed || buyer.signing_url.is_some() {
            buyer.mark_completed();
            self.save(&mut buyer)?;
        }
        Ok(prepared)
    }

    /// One status check against the provider for the deal's active round.
    pub async fn refresh_status(&self, deal: &DealKey) -> Result<StatusReport, SigningError> {
        let seller_key = SessionKey::for_round(deal, SigningRound::Seller);
        let round = if self.sessions.get(&seller_key)?.is_some() {
            SigningRound::Seller
        } else {
            SigningRound::Buyer
        };

        let key = SessionKey::for_round(deal, round);
        let lock = self.locks.handle(&key);
        let _guard = lock.lock().await;

        let mut session = self.load(&key)?;
        let envelope_id = require_envelope(&session, "check envelope status")?;
        let state = match self.fetch_state(&envelope_id).await {
            Ok(state) => state,
            Err(SigningError::NotFound(subject)) => {
                self.invalidate(&session)?;
                return Err(SigningError::NotFound(subject));
            }
            Err(err) => return Err(err),
        };

        let previous = session.stage.clone();
        if apply_status(&mut session, state) {
            self.save(&mut session)?;
            info!(
                deal = %deal,
                round = round.label(),
                envelope_id = %envelope_id,
                from = previous.label(),
                stage = session.stage.label(),
                "envelope status advanced"
            );
        }
        debug!(deal = %deal, round = round.label(), status = state.status.label(), "envelope status checked");

        Ok(StatusReport {
            deal: deal.clone(),
            round,
            stage: session.stage,
            status: state.status,
            completed: state.completed,
        })
    }

    /// Downloads the combined document of the latest round once the provider has it signed.
    pub async fn download_signed_document(&self, deal: &DealKey) -> Result<SignedDocument, SigningError> {
        let seller = self
            .sessions
            .get(&SessionKey::for_round(deal, SigningRound::Seller))?
            .filter(|session| session.envelope_id.is_some());
        let session = match seller {
            Some(session) => session,
            None => self.load(&SessionKey::for_round(deal, SigningRound::Buyer))?,
        };
        let envelope_id = require_envelope(&session, "download the signed document")?;

        let grant = self.tokens.acquire_token().await?;
        let bytes = self.signed_bytes(&grant, &envelope_id, session.round).await?;
        Ok(SignedDocument {
            round: session.round,
            file_name: format!(
                "{}.pdf",
                notices::attachment_stem(&session.contract_snapshot.property_address)
            ),
            bytes,
        })
    }

    pub fn snapshot(&self, deal: &DealKey) -> Result<ContractSnapshot, SigningError> {
        Ok(ContractSnapshot {
            buyer: self
                .sessions
                .get(&SessionKey::for_round(deal, SigningRound::Buyer))?,
            seller: self
                .sessions
                .get(&SessionKey::for_round(deal, SigningRound::Seller))?,
        })
    }

    /// Forgets both rounds so the deal starts over from `Draft`.
    pub async fn restart(&self, deal: &DealKey) -> Result<(), SigningError> {
        let buyer_key = SessionKey::for_round(deal, SigningRound::Buyer);
        let seller_key = SessionKey::for_round(deal, SigningRound::Seller);
        let buyer_lock = self.locks.handle(&buyer_key);
        let _buyer_guard = buyer_lock.lock().await;
        let seller_lock = self.locks.handle(&seller_key);
        let _seller_guard = seller_lock.lock().await;

        self.sessions.remove(&seller_key)?;
        self.sessions.remove(&buyer_key)?;
        info!(deal = %deal, "signing sessions cleared");
        Ok(())
    }

    pub async fn send_approval_notice(&self, notice: &ApprovalNotice) -> Result<(), SigningError> {
        Recipient::signer(notice.scout_email.trim(), notice.scout_name.trim()).validate("scout")?;
        if notice.property_address.trim().is_empty() {
            return Err(InvalidInput::new("property_address", "must not be empty").into());
        }

        let message = notices::deal_approved(
            &notice.scout_email,
            notice.scout_name.trim(),
            notice.property_address.trim(),
            notice.note.as_deref(),
        );
        self.mailer.send(message).await.map_err(SigningError::Notify)?;
        info!(property = %notice.property_address.trim(), "approval notice sent");
        Ok(())
    }

    async fn drive_round(
        &self,
        mut session: SigningSession,
        budget: &mut RetryBudget,
    ) -> Result<PreparedContract, SigningError> {
        if !budget.begin_attempt() {
            self.halt(&mut session, FailureReason::MaxRetriesExceeded)?;
            return Err(SigningError::MaxRetriesExceeded);
        }

        let initial_envelope = session.envelope_id.clone();
        let mut invalidated = false;
        loop {
            match self.open_round(&mut session).await {
                Ok(signing_url) => {
                    let envelope_id = session.envelope_id.clone().unwrap_or_default();
                    return Ok(PreparedContract {
                        deal: session.deal.clone(),
                        round: session.round,
                        stage: session.stage.clone(),
                        reused_envelope: initial_envelope.as_deref() == Some(envelope_id.as_str()),
                        envelope_id,
                        signing_url,
                    });
                }
                Err(SigningError::NotFound(subject)) if !invalidated => {
                    warn!(deal = %session.deal, subject = %subject, "stale envelope; restarting round from draft");
                    invalidated = true;
                    self.invalidate(&session)?;
                    session.reset_to_draft();
                }
                Err(err @ SigningError::ConsentRequired { .. }) => {
                    self.halt(&mut session, FailureReason::ConsentRequired)?;
                    return Err(err);
                }
                Err(err) if err.is_transient() => {
                    if let Some(delay) = budget.take_auto_refresh() {
                        warn!(
                            deal = %session.deal,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            auto_remaining = budget.auto_remaining(),
                            "transient provider failure; refreshing"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if budget.is_exhausted() {
                        self.halt(&mut session, FailureReason::MaxRetriesExceeded)?;
                        return Err(SigningError::MaxRetriesExceeded);
                    }
                    self.save(&mut session)?;
                    warn!(
                        deal = %session.deal,
                        error = %err,
                        manual_remaining = budget.manual_remaining(),
                        "signing round left for manual retry"
                    );
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates the envelope if the session has none yet, then mints a signing URL.
    async fn open_round(&self, session: &mut SigningSession) -> Result<String, SigningError> {
        let grant = self.tokens.acquire_token().await?;
        let envelope_id = match session.envelope_id.clone() {
            Some(envelope_id) => envelope_id,
            None => self.create_envelope(&grant, session).await?,
        };

        let signing_url = self
            .envelopes
            .signing_url(&grant, &envelope_id, &session.recipient)
            .await?;
        if signing_url.trim().is_empty() {
            return Err(SigningError::ProviderUnavailable(
                "provider returned an empty signing url".to_string(),
            ));
        }

        session.signing_url = Some(signing_url.clone());
        session.stage = awaiting_stage(session.round);
        self.save(session)?;
        info!(
            deal = %session.deal,
            round = session.round.label(),
            envelope_id = %envelope_id,
            stage = session.stage.label(),
            "signing url issued"
        );
        Ok(signing_url)
    }

    async fn create_envelope(
        &self,
        grant: &AuthGrant,
        session: &mut SigningSession,
    ) -> Result<String, SigningError> {
        let document = self.source_document(grant, session).await?;
        let subject = match session.round {
            SigningRound::Buyer => format!(
                "Please sign: purchase agreement for {}",
                session.contract_snapshot.property_address
            ),
            SigningRound::Seller => format!(
                "Counter-signature requested: {}",
                session.contract_snapshot.property_address
            ),
        };
        let draft = EnvelopeDraft {
            document,
            recipients: vec![session.recipient.clone()],
            subject,
        };

        let created = self.envelopes.create_envelope(grant, &draft).await?;
        session.envelope_id = Some(created.envelope_id.clone());
        session.account_id = Some(created.account_id);
        session.signing_url = None;
        session.stage = SigningStage::EnvelopeCreated;
        self.save(session)?;
        info!(
            deal = %session.deal,
            round = session.round.label(),
            envelope_id = %created.envelope_id,
            stage = session.stage.label(),
            "envelope created"
        );
        Ok(created.envelope_id)
    }

    async fn source_document(
        &self,
        grant: &AuthGrant,
        session: &SigningSession,
    ) -> Result<SigningDocument, SigningError> {
        match session.round {
            SigningRound::Buyer => Ok(self.renderer.render(&session.contract_snapshot)?),
            SigningRound::Seller => {
                let buyer_key = SessionKey::for_round(&session.deal, SigningRound::Buyer);
                let envelope_id = self
                    .sessions
                    .get(&buyer_key)?
                    .and_then(|buyer| buyer.envelope_id)
                    .ok_or_else(|| SigningError::NoSession(buyer_key.to_string()))?;
                let bytes = self
                    .signed_bytes(grant, &envelope_id, SigningRound::Buyer)
                    .await?;
                Ok(SigningDocument {
                    name: format!(
                        "Purchase Agreement - {} (buyer signed)",
                        session.contract_snapshot.property_address.trim()
                    ),
                    file_extension: "pdf".to_string(),
                    bytes,
                })
            }
        }
    }

    /// Combined document of a completed envelope. Refuses while the provider has not
    /// recorded the signature.
    async fn signed_bytes(
        &self,
        grant: &AuthGrant,
        envelope_id: &str,
        round: SigningRound,
    ) -> Result<Vec<u8>, SigningError> {
        let state = self.envelopes.envelope_state(grant, envelope_id).await?;
        if !state.completed {
            return Err(SigningError::NotSigned(party(round)));
        }

        let documents = self.envelopes.list_documents(grant, envelope_id).await?;
        if documents.is_empty() {
            return Err(SigningError::Provider {
                code: "NO_DOCUMENTS".to_string(),
                message: format!("envelope {envelope_id} has no documents"),
            });
        }
        Ok(self
            .envelopes
            .download_document(grant, envelope_id, COMBINED_DOCUMENT_ID)
            .await?)
    }

    async fn fetch_state(&self, envelope_id: &str) -> Result<EnvelopeState, SigningError> {
        let grant = self.tokens.acquire_token().await?;
        Ok(self.envelopes.envelope_state(&grant, envelope_id).await?)
    }

    fn halted(&self, reason: FailureReason) -> SigningError {
        self.with_consent_link(SigningError::Halted(reason))
    }

    fn with_consent_link(&self, err: SigningError) -> SigningError {
        match err {
            SigningError::Halted(FailureReason::ConsentRequired) => SigningError::AwaitingConsent {
                consent_url: self.consent_url(),
            },
            other => other,
        }
    }

    fn load(&self, key: &SessionKey) -> Result<SigningSession, SigningError> {
        self.sessions
            .get(key)?
            .ok_or_else(|| SigningError::NoSession(key.to_string()))
    }

    fn save(&self, session: &mut SigningSession) -> Result<(), SigningError> {
        session.touch();
        self.sessions.set(session)?;
        Ok(())
    }

    fn halt(&self, session: &mut SigningSession, reason: FailureReason) -> Result<(), SigningError> {
        session.stage = SigningStage::Failed(reason);
        session.signing_url = None;
        self.save(session)?;
        warn!(
            deal = %session.deal,
            round = session.round.label(),
            reason = reason.label(),
            "signing workflow halted"
        );
        Ok(())
    }

    fn invalidate(&self, session: &SigningSession) -> Result<(), SigningError> {
        self.sessions.remove(&session.key)?;
        warn!(
            deal = %session.deal,
            envelope_id = ?session.envelope_id,
            "envelope missing at provider; session invalidated"
        );
        Ok(())
    }
}

/// Mirrors provider status onto the session. Returns whether anything changed.
fn apply_status(session: &mut SigningSession, state: EnvelopeState) -> bool {
    if session.stage.is_failed() {
        return false;
    }
    match state.status {
        EnvelopeStatus::Declined => {
            session.stage = SigningStage::Failed(FailureReason::Declined);
            session.signing_url = None;
            return true;
        }
        EnvelopeStatus::Voided => {
            session.stage = SigningStage::Failed(FailureReason::Voided);
            session.signing_url = None;
            return true;
        }
        _ => {}
    }
    if !state.completed {
        return false;
    }

    let next = match (session.round, &session.stage) {
        (
            SigningRound::Buyer,
            SigningStage::EnvelopeCreated | SigningStage::AwaitingBuyerSignature,
        ) => Some(SigningStage::BuyerSigned),
        (
            SigningRound::Seller,
            SigningStage::EnvelopeCreated | SigningStage::AwaitingSellerSignature,
        ) => Some(SigningStage::FullyExecuted),
        _ => None,
    };
    let changed = next.is_some() || !session.signature_confirmed || !session.completed;
    if let Some(next) = next {
        session.stage = next;
    }
    session.signature_confirmed = true;
    session.mark_completed();
    changed
}

fn awaiting_stage(round: SigningRound) -> SigningStage {
    match round {
        SigningRound::Buyer => SigningStage::AwaitingBuyerSignature,
        SigningRound::Seller => SigningStage::AwaitingSellerSignature,
    }
}

fn party(round: SigningRound) -> &'static str {
    match round {
        SigningRound::Buyer => "buyer",
        SigningRound::Seller => "seller",
    }
}

fn is_buyer_restartable(stage: &SigningStage) -> bool {
    matches!(
        stage,
        SigningStage::Draft | SigningStage::EnvelopeCreated | SigningStage::AwaitingBuyerSignature
    )
}

fn require_buyer_signed(session: &SigningSession, action: &'static str) -> Result<(), SigningError> {
    match &session.stage {
        SigningStage::BuyerSigned | SigningStage::SentToSeller => Ok(()),
        SigningStage::Failed(reason) => Err(SigningError::Halted(*reason)),
        stage => Err(SigningError::InvalidTransition {
            action,
            stage: stage.clone(),
        }),
    }
}

fn require_envelope(session: &SigningSession, action: &'static str) -> Result<String, SigningError> {
    session
        .envelope_id
        .clone()
        .ok_or_else(|| SigningError::InvalidTransition {
            action,
            stage: session.stage.clone(),
        })
}

fn seller_recipient(email: &str, name: &str) -> Result<Recipient, InvalidInput> {
    let email = email.trim();
    let name = name.trim();
    if email.is_empty() {
        return Err(InvalidInput::new("seller_email", "must not be empty"));
    }
    if !email.contains('@') {
        return Err(InvalidInput::new("seller_email", "must contain '@'"));
    }
    if name.is_empty() {
        return Err(InvalidInput::new("seller_name", "must not be empty"));
    }
    Ok(Recipient::signer(email, name))
}
