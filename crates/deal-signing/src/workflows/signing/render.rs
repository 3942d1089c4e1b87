use std::fmt::Debug;
use std::fmt::Write as _;

use super::domain::{ContractForm, SigningDocument, DEFAULT_ANCHOR, SELLER_ANCHOR};
use super::notify::notices::{escape_html, format_dollars};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("contract template failed: {0}")]
    Template(String),
}

/// Turns contract form data into the artifact sent for signature. Must be pure: the
/// same form always yields the same bytes so a retry re-renders the identical document.
pub trait ContractRenderer: Send + Sync + Debug {
    fn render(&self, form: &ContractForm) -> Result<SigningDocument, RenderError>;
}

/// HTML purchase agreement with signature anchors for buyer and seller.
#[derive(Debug, Clone)]
pub struct HtmlContractRenderer {
    buyer_anchor: String,
    seller_anchor: String,
}

impl Default for HtmlContractRenderer {
    fn default() -> Self {
        Self {
            buyer_anchor: DEFAULT_ANCHOR.to_string(),
            seller_anchor: SELLER_ANCHOR.to_string(),
        }
    }
}

impl HtmlContractRenderer {
    pub fn with_anchors(buyer_anchor: impl Into<String>, seller_anchor: impl Into<String>) -> Self {
        Self {
            buyer_anchor: buyer_anchor.into(),
            seller_anchor: seller_anchor.into(),
        }
    }

    fn write_body(&self, form: &ContractForm, html: &mut String) -> std::fmt::Result {
        writeln!(html, "<html><body>")?;
        writeln!(html, "<h1>Vacant Land Purchase Agreement</h1>")?;
        writeln!(
            html,
            "<p>Property: <strong>{}</strong></p>",
            escape_html(&form.property_address)
        )?;
        if let Some(parcel) = &form.parcel_id {
            writeln!(html, "<p>Parcel ID: {}</p>", escape_html(parcel))?;
        }
        if let Some(acreage) = &form.acreage {
            writeln!(html, "<p>Acreage: {} acres</p>", escape_html(acreage))?;
        }
        writeln!(
            html,
            "<p>Seller: {} | Buyer: {}</p>",
            escape_html(&form.seller_name),
            escape_html(&form.buyer_name)
        )?;
        writeln!(
            html,
            "<p>Purchase price: ${} | Earnest money: ${}</p>",
            format_dollars(form.purchase_price),
            format_dollars(form.earnest_money)
        )?;
        writeln!(
            html,
            "<p>Closing on or before {}.</p>",
            form.closing_date.format("%B %d, %Y")
        )?;
        if let Some(days) = form.inspection_period_days {
            writeln!(
                html,
                "<p>Buyer has a {days}-day inspection and due diligence period.</p>"
            )?;
        }
        if let Some(terms) = form
            .additional_terms
            .as_deref()
            .filter(|terms| !terms.trim().is_empty())
        {
            writeln!(
                html,
                "<h2>Additional terms</h2><p>{}</p>",
                escape_html(terms.trim())
            )?;
        }

        // Anchors are rendered white so they locate the tab without showing on paper.
        writeln!(
            html,
            "<p>Buyer signature: <span style=\"color:#ffffff\">{}</span></p>",
            escape_html(&self.buyer_anchor)
        )?;
        writeln!(
            html,
            "<p>Seller signature: <span style=\"color:#ffffff\">{}</span></p>",
            escape_html(&self.seller_anchor)
        )?;
        writeln!(html, "</body></html>")
    }
}

impl ContractRenderer for HtmlContractRenderer {
    fn render(&self, form: &ContractForm) -> Result<SigningDocument, RenderError> {
        let mut html = String::new();
        self.write_body(form, &mut html)
            .map_err(|err| RenderError::Template(err.to_string()))?;

        Ok(SigningDocument {
            name: format!("Purchase Agreement - {}", form.property_address.trim()),
            file_extension: "html".to_string(),
            bytes: html.into_bytes(),
        })
    }
}
