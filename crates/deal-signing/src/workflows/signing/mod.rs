//! Contract e-signature workflow: provider token exchange, envelopes, resumable
//! per-deal sessions and the two-round buyer/seller orchestration.

pub mod domain;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod polling;
pub mod render;
pub mod retry;
pub mod router;
pub mod session;
pub mod token;

pub use domain::{
    ContractForm, DealKey, EnvelopeStatus, FailureReason, InvalidInput, Recipient, SessionKey,
    SignatureAnchor, SigningDocument, SigningRound, SigningStage, DEFAULT_ANCHOR, SELLER_ANCHOR,
};
pub use envelope::{
    CreatedEnvelope, EnvelopeDocument, EnvelopeDraft, EnvelopeError, EnvelopeGateway,
    EnvelopeState, RestEnvelopeClient, COMBINED_DOCUMENT_ID,
};
pub use error::{ErrorPolicy, SigningError};
pub use notify::{
    notices, Attachment, EmailMessage, HttpMailer, NotificationGateway, NotifyError,
};
pub use orchestrator::{
    ApprovalNotice, ContractOrchestrator, ContractSnapshot, PrepareOptions, PreparedContract,
    SellerDelivery, SignedDocument, StatusReport,
};
pub use polling::{PollHandle, PollOutcome, StatusPoller, MIN_POLL_INTERVAL};
pub use render::{ContractRenderer, HtmlContractRenderer, RenderError};
pub use retry::RetryBudget;
pub use router::{signing_router, RetryLedger, SigningApi, WatchRegistry};
pub use session::{
    FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError, SigningSession,
};
pub use token::{AuthGrant, JwtTokenBroker, TokenBroker, TokenError};
