use serde::Serialize;

use super::domain::{FailureReason, InvalidInput, SigningStage};
use super::envelope::EnvelopeError;
use super::notify::NotifyError;
use super::render::RenderError;
use super::session::SessionStoreError;
use super::token::TokenError;

/// How a caller should react to a failed signing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Transient provider trouble; retry within the budget.
    Retry,
    /// Bad caller input; never retried.
    FailFast,
    /// The cached envelope is stale; the session was dropped and the flow restarts from draft.
    InvalidateSession,
    /// Needs an administrator (provider consent, credentials).
    ContactAdministrator,
    /// Surface the failure as-is.
    Report,
}

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),
    #[error("provider consent required; an administrator must grant it at {consent_url}")]
    ConsentRequired { consent_url: String },
    #[error("provider rejected integration credentials: {0}")]
    InvalidCredentials(String),
    #[error("signing provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("signing provider timed out")]
    Timeout,
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("envelope {0} no longer exists at the provider; session reset")]
    NotFound(String),
    #[error("maximum retries exceeded; restart the contract from draft")]
    MaxRetriesExceeded,
    #[error("signing workflow halted ({}); restart required", .0.label())]
    Halted(FailureReason),
    /// A round halted on missing consent; every later call carries the link again.
    #[error("signing workflow halted until provider consent is granted at {consent_url}; restart required")]
    AwaitingConsent { consent_url: String },
    #[error("no signing session for {0}")]
    NoSession(String),
    #[error("cannot {action} while contract is {}", .stage.label())]
    InvalidTransition {
        action: &'static str,
        stage: SigningStage,
    },
    #[error("provider has not recorded the {0} signature yet")]
    NotSigned(&'static str),
    #[error("signed document downloaded but notification failed: {source}")]
    PartialFailure {
        document: Vec<u8>,
        #[source]
        source: NotifyError,
    },
    #[error(transparent)]
    Notify(NotifyError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

impl SigningError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            SigningError::ProviderUnavailable(_) | SigningError::Timeout => ErrorPolicy::Retry,
            SigningError::InvalidInput(_) => ErrorPolicy::FailFast,
            SigningError::NotFound(_) => ErrorPolicy::InvalidateSession,
            SigningError::ConsentRequired { .. }
            | SigningError::InvalidCredentials(_)
            | SigningError::AwaitingConsent { .. }
            | SigningError::Halted(FailureReason::ConsentRequired) => {
                ErrorPolicy::ContactAdministrator
            }
            SigningError::Notify(NotifyError::AuthFailed(_)) => ErrorPolicy::ContactAdministrator,
            SigningError::Notify(NotifyError::ConnectionFailed(_)) => ErrorPolicy::Retry,
            _ => ErrorPolicy::Report,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.policy() == ErrorPolicy::Retry
    }

    /// Copy shown to the person driving the UI step.
    pub fn user_message(&self) -> String {
        match self {
            SigningError::InvalidInput(err) => format!("Please fix the form: {err}."),
            SigningError::ConsentRequired { .. } | SigningError::InvalidCredentials(_) => {
                "E-signature is not authorized for this account yet. Contact your administrator."
                    .to_string()
            }
            SigningError::ProviderUnavailable(_) | SigningError::Timeout => {
                "The signing service is not responding. Please try again.".to_string()
            }
            SigningError::NotFound(_) => {
                "The previous signing request expired. Please prepare the contract again."
                    .to_string()
            }
            SigningError::AwaitingConsent { .. }
            | SigningError::Halted(FailureReason::ConsentRequired) => {
                "E-signature was not authorized for this account. Once your administrator grants access, restart the contract."
                    .to_string()
            }
            SigningError::Halted(FailureReason::Declined | FailureReason::Voided) => {
                "The signing request was declined or cancelled. Restart the contract to send a new one."
                    .to_string()
            }
            SigningError::MaxRetriesExceeded
            | SigningError::Halted(FailureReason::MaxRetriesExceeded) => {
                "Signing could not be completed after several attempts. Restart the contract from the beginning."
                    .to_string()
            }
            SigningError::NotSigned(party) => {
                format!("The {party} signature has not been recorded yet. Please try again in a moment.")
            }
            SigningError::PartialFailure { source, .. } | SigningError::Notify(source) => {
                source.user_message().to_string()
            }
            SigningError::Provider { message, .. } => {
                format!("The signing service rejected the request: {message}")
            }
            SigningError::NoSession(_) | SigningError::InvalidTransition { .. } => {
                "This step is not available yet. Refresh the page to continue.".to_string()
            }
            SigningError::Render(_) | SigningError::Store(_) => {
                "Something went wrong preparing the contract. Please try again.".to_string()
            }
        }
    }
}

impl SigningError {
    /// Administrator consent link carried by the error, if any.
    pub fn consent_url(&self) -> Option<&str> {
        match self {
            SigningError::ConsentRequired { consent_url }
            | SigningError::AwaitingConsent { consent_url } => Some(consent_url.as_str()),
            _ => None,
        }
    }
}

impl From<TokenError> for SigningError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::ConsentRequired { consent_url } => {
                SigningError::ConsentRequired { consent_url }
            }
            TokenError::InvalidCredentials { message } => SigningError::InvalidCredentials(message),
            TokenError::ProviderUnavailable { message } => SigningError::ProviderUnavailable(message),
            TokenError::Timeout => SigningError::Timeout,
        }
    }
}

impl From<EnvelopeError> for SigningError {
    fn from(value: EnvelopeError) -> Self {
        match value {
            EnvelopeError::NoRecipients => SigningError::InvalidInput(InvalidInput::new(
                "recipients",
                "at least one recipient is required",
            )),
            EnvelopeError::NotFound(subject) => SigningError::NotFound(subject),
            EnvelopeError::Provider { code, message } => SigningError::Provider { code, message },
            EnvelopeError::Unavailable(message) => SigningError::ProviderUnavailable(message),
            EnvelopeError::Timeout => SigningError::Timeout,
        }
    }
}
