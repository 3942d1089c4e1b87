use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Stable identifier for a deal's signing flow, derivable from the deal itself so a
/// reloaded client lands on the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DealKey(String);

impl DealKey {
    /// Accepts an already-normalized key (deal id or address slug).
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidInput> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidInput::new("deal_key", "must not be empty"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidInput::new(
                "deal_key",
                "may only contain ASCII letters, digits, '-' and '_'",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Derives the key from a free-form property address: lowercase, alphanumeric runs
    /// joined by single dashes. "12 Oak Rd., Austin" and "12 oak rd austin" collide on purpose.
    pub fn from_address(address: &str) -> Result<Self, InvalidInput> {
        let mut slug = String::with_capacity(address.len());
        let mut pending_dash = false;
        for c in address.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(c.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }

        if slug.is_empty() {
            return Err(InvalidInput::new(
                "property_address",
                "must contain at least one letter or digit",
            ));
        }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which party a signing round collects a signature from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningRound {
    Buyer,
    Seller,
}

impl SigningRound {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Buyer => "Buyer",
            Self::Seller => "Seller",
        }
    }
}

/// Key under which a round's session is stored. Seller rounds get their own
/// identifier so the buyer's record is never overwritten by the counter-signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn for_round(deal: &DealKey, round: SigningRound) -> Self {
        match round {
            SigningRound::Buyer => Self(deal.as_str().to_string()),
            SigningRound::Seller => Self(format!("seller_{}", deal.as_str())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Person asked to sign inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub name: String,
    #[serde(default = "default_routing_order")]
    pub routing_order: u32,
    /// Embedded-signing marker; recipients with a client user id sign inside our UI.
    pub client_user_id: String,
    #[serde(default)]
    pub anchor: SignatureAnchor,
}

fn default_routing_order() -> u32 {
    1
}

impl Recipient {
    /// Embedded signer sharing routing order 1 with every other signer in the round.
    pub fn signer(email: impl Into<String>, name: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            client_user_id: email.trim().to_ascii_lowercase(),
            email,
            name: name.into(),
            routing_order: 1,
            anchor: SignatureAnchor::default(),
        }
    }

    pub fn with_anchor(mut self, anchor: SignatureAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub(crate) fn validate(&self, field: &'static str) -> Result<(), InvalidInput> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err(InvalidInput::new(field, "email must not be empty"));
        }
        if !email.contains('@') {
            return Err(InvalidInput::new(field, "email must contain '@'"));
        }
        if self.name.trim().is_empty() {
            return Err(InvalidInput::new(field, "name must not be empty"));
        }
        Ok(())
    }
}

pub const DEFAULT_ANCHOR: &str = "/sn1/";
pub const SELLER_ANCHOR: &str = "/sn2/";
pub const DEFAULT_ANCHOR_X_OFFSET: i32 = 20;
pub const DEFAULT_ANCHOR_Y_OFFSET: i32 = 10;

/// Text marker in the document where the provider places a recipient's signature field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureAnchor {
    pub tag: String,
    pub x_offset: i32,
    pub y_offset: i32,
}

impl SignatureAnchor {
    pub fn at(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }
}

impl Default for SignatureAnchor {
    fn default() -> Self {
        Self {
            tag: DEFAULT_ANCHOR.to_string(),
            x_offset: DEFAULT_ANCHOR_X_OFFSET,
            y_offset: DEFAULT_ANCHOR_Y_OFFSET,
        }
    }
}

/// Contract form data captured when the contract is prepared. Kept on the session so
/// a retry can re-render the exact same document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractForm {
    pub property_address: String,
    pub parcel_id: Option<String>,
    pub acreage: Option<String>,
    pub buyer_name: String,
    pub buyer_email: String,
    pub seller_name: String,
    #[serde(default)]
    pub seller_email: Option<String>,
    /// Whole dollars.
    pub purchase_price: u64,
    #[serde(default)]
    pub earnest_money: u64,
    pub closing_date: NaiveDate,
    #[serde(default)]
    pub inspection_period_days: Option<u16>,
    #[serde(default)]
    pub additional_terms: Option<String>,
}

impl ContractForm {
    pub fn validate(&self) -> Result<(), InvalidInput> {
        if self.property_address.trim().is_empty() {
            return Err(InvalidInput::new("property_address", "must not be empty"));
        }
        if self.purchase_price == 0 {
            return Err(InvalidInput::new("purchase_price", "must be greater than zero"));
        }
        if self.earnest_money > self.purchase_price {
            return Err(InvalidInput::new(
                "earnest_money",
                "must not exceed the purchase price",
            ));
        }
        self.buyer().validate("buyer")?;
        if self.seller_name.trim().is_empty() {
            return Err(InvalidInput::new("seller_name", "must not be empty"));
        }
        Ok(())
    }

    pub fn buyer(&self) -> Recipient {
        Recipient::signer(self.buyer_email.trim(), self.buyer_name.trim())
    }
}

/// Rendered artifact handed to the provider. Immutable once an envelope is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningDocument {
    pub name: String,
    pub file_extension: String,
    pub bytes: Vec<u8>,
}

/// Provider-side envelope status; the provider's copy is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Created,
    Sent,
    Delivered,
    Completed,
    Declined,
    Voided,
}

impl EnvelopeStatus {
    /// Maps the provider's wire value. Unknown values are treated as still in flight.
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "delivered" => Self::Delivered,
            "completed" | "signed" => Self::Completed,
            "declined" => Self::Declined,
            "voided" | "deleted" => Self::Voided,
            _ => Self::Sent,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Declined | Self::Voided)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Sent => "Sent",
            Self::Delivered => "Delivered",
            Self::Completed => "Completed",
            Self::Declined => "Declined",
            Self::Voided => "Voided",
        }
    }
}

/// Where a deal's contract sits in the signing lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "stage", content = "reason")]
pub enum SigningStage {
    Draft,
    EnvelopeCreated,
    AwaitingBuyerSignature,
    BuyerSigned,
    SentToSeller,
    AwaitingSellerSignature,
    FullyExecuted,
    Failed(FailureReason),
}

impl SigningStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::EnvelopeCreated => "Envelope Created",
            Self::AwaitingBuyerSignature => "Awaiting Buyer Signature",
            Self::BuyerSigned => "Buyer Signed",
            Self::SentToSeller => "Sent To Seller",
            Self::AwaitingSellerSignature => "Awaiting Seller Signature",
            Self::FullyExecuted => "Fully Executed",
            Self::Failed(_) => "Failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConsentRequired,
    MaxRetriesExceeded,
    Declined,
    Voided,
}

impl FailureReason {
    pub const fn label(self) -> &'static str {
        match self {
            Self::ConsentRequired => "administrator consent required",
            Self::MaxRetriesExceeded => "maximum retries exceeded",
            Self::Declined => "recipient declined to sign",
            Self::Voided => "envelope voided",
        }
    }
}

/// Caller-supplied data failed validation before any provider call was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct InvalidInput {
    pub field: &'static str,
    pub reason: String,
}

impl InvalidInput {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
