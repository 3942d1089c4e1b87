use crate::infra::{OutboxMailer, SandboxProvider};
use chrono::{Local, NaiveDate};
use clap::Args;
use deal_signing::config::RetryConfig;
use deal_signing::error::AppError;
use deal_signing::workflows::signing::{
    ApprovalNotice, ContractForm, ContractOrchestrator, DealKey, MemorySessionStore, PollOutcome,
    PrepareOptions, RetryBudget, StatusPoller,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Property address; also determines the deal key.
    #[arg(long, default_value = "40 Mesa Ridge Rd, Marfa TX")]
    pub(crate) address: String,
    #[arg(long, default_value = "Avery Buyer")]
    pub(crate) buyer_name: String,
    #[arg(long, default_value = "buyer@example.com")]
    pub(crate) buyer_email: String,
    #[arg(long, default_value = "Sam Seller")]
    pub(crate) seller_name: String,
    #[arg(long, default_value = "seller@example.com")]
    pub(crate) seller_email: String,
    /// Purchase price in whole dollars.
    #[arg(long, default_value_t = 85_000)]
    pub(crate) purchase_price: u64,
    /// Closing date (YYYY-MM-DD). Defaults to 30 days from today.
    #[arg(long, value_parser = parse_date)]
    pub(crate) closing_date: Option<NaiveDate>,
    /// Number of envelope creations the sandbox fails before recovering.
    #[arg(long, default_value_t = 0)]
    pub(crate) simulated_outages: u32,
    /// Have the buyer decline instead of sign, then restart the workflow.
    #[arg(long)]
    pub(crate) buyer_declines: bool,
    /// Write the fully executed document to this path.
    #[arg(long)]
    pub(crate) save_document: Option<PathBuf>,
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let sandbox = Arc::new(SandboxProvider::default());
    sandbox.simulate_outages(args.simulated_outages);
    let mailer = Arc::new(OutboxMailer::default());
    let orchestrator = ContractOrchestrator::new(
        sandbox.clone(),
        sandbox.clone(),
        Arc::new(MemorySessionStore::default()),
        mailer.clone(),
    );
    let retry = RetryConfig {
        backoff: Duration::from_millis(100),
        ..RetryConfig::default()
    };

    let closing_date = args
        .closing_date
        .unwrap_or_else(|| Local::now().date_naive() + chrono::Duration::days(30));
    let form = ContractForm {
        property_address: args.address.clone(),
        parcel_id: None,
        acreage: None,
        buyer_name: args.buyer_name.clone(),
        buyer_email: args.buyer_email.clone(),
        seller_name: args.seller_name.clone(),
        seller_email: Some(args.seller_email.clone()),
        purchase_price: args.purchase_price,
        earnest_money: args.purchase_price / 100,
        closing_date,
        inspection_period_days: Some(10),
        additional_terms: None,
    };
    let deal = DealKey::from_address(&form.property_address)?;

    println!("Contract signing demo (sandbox provider)");
    println!("- Deal key: {deal}");
    println!("- Administrator consent URL: {}", orchestrator.consent_url());

    println!("\nBuyer round");
    let mut budget = RetryBudget::from_config(&retry);
    let prepared = orchestrator
        .prepare_contract(&deal, form.clone(), PrepareOptions::default(), &mut budget)
        .await?;
    println!(
        "- Envelope {} -> {}",
        prepared.envelope_id,
        prepared.stage.label()
    );
    println!("  Signing URL: {}", prepared.signing_url);
    let refreshes = retry.auto_refreshes - budget.auto_remaining();
    if refreshes > 0 {
        println!("  Recovered after {refreshes} automatic refresh(es)");
    }

    let reload = orchestrator
        .prepare_contract(
            &deal,
            form.clone(),
            PrepareOptions::default(),
            &mut RetryBudget::from_config(&retry),
        )
        .await?;
    println!(
        "- Page reload: envelope {} (reused: {}) with a fresh signing URL",
        reload.envelope_id, reload.reused_envelope
    );

    if args.buyer_declines {
        sandbox.decline(&prepared.envelope_id);
        if let Err(err) = orchestrator.record_buyer_return(&deal).await {
            println!("- Buyer returned: {}", err.user_message());
            println!("  Policy: {:?}", err.policy());
        }
        orchestrator.restart(&deal).await?;
        println!("- Workflow restarted from Draft");
        return Ok(());
    }

    let session = orchestrator.record_buyer_return(&deal).await?;
    println!(
        "- Buyer returned -> {} (confirmed by provider: {})",
        session.stage.label(),
        session.signature_confirmed
    );

    println!("\nSeller delivery");
    let delivery = orchestrator
        .send_to_seller(&deal, &args.seller_email, &args.seller_name)
        .await?;
    println!(
        "- Emailed signed contract ({} bytes) to {} -> {}",
        delivery.document.len(),
        delivery.seller_email,
        delivery.stage.label()
    );

    println!("\nSeller round");
    let seller = orchestrator
        .prepare_seller_signing(
            &deal,
            &args.seller_email,
            &args.seller_name,
            PrepareOptions::default(),
            &mut RetryBudget::from_config(&retry),
        )
        .await?;
    println!(
        "- Envelope {} -> {}",
        seller.envelope_id,
        seller.stage.label()
    );
    println!("  Signing URL: {}", seller.signing_url);

    let poller = StatusPoller::with_interval(orchestrator.clone(), Duration::from_millis(250));
    match poller.watch(deal.clone()).outcome().await {
        PollOutcome::Finished(report) => println!(
            "- Status polling finished: {} (provider status {})",
            report.stage.label(),
            report.status.label()
        ),
        PollOutcome::Cancelled => println!("- Status polling cancelled"),
        PollOutcome::Stopped { error } => println!("- Status polling stopped: {error}"),
    }

    let document = orchestrator.download_signed_document(&deal).await?;
    println!(
        "- Fully executed document: {} ({} bytes)",
        document.file_name,
        document.bytes.len()
    );
    if let Some(path) = args.save_document {
        std::fs::write(&path, &document.bytes)?;
        println!("  Saved to {}", path.display());
    }

    orchestrator
        .send_approval_notice(&ApprovalNotice {
            scout_email: "scout@example.com".to_string(),
            scout_name: "Deal Scout".to_string(),
            property_address: form.property_address.clone(),
            note: Some("Both parties have signed.".to_string()),
        })
        .await?;

    println!("\nOutbox");
    for message in mailer.outbox() {
        match &message.attachment {
            Some(attachment) => println!(
                "- {} | {} | attachment {}",
                message.to, message.subject, attachment.filename
            ),
            None => println!("- {} | {}", message.to, message.subject),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> DemoArgs {
        DemoArgs {
            address: "40 Mesa Ridge Rd, Marfa TX".to_string(),
            buyer_name: "Avery Buyer".to_string(),
            buyer_email: "buyer@example.com".to_string(),
            seller_name: "Sam Seller".to_string(),
            seller_email: "seller@example.com".to_string(),
            purchase_price: 85_000,
            closing_date: NaiveDate::from_ymd_opt(2026, 12, 1),
            simulated_outages: 0,
            buyer_declines: false,
            save_document: None,
        }
    }

    #[test]
    fn parse_date_rejects_other_formats() {
        assert_eq!(
            parse_date("2026-12-01"),
            Ok(NaiveDate::from_ymd_opt(2026, 12, 1).expect("valid date"))
        );
        assert!(parse_date("12/01/2026").is_err());
    }

    #[tokio::test]
    async fn demo_runs_both_rounds() {
        run_demo(args()).await.expect("demo completes");
    }

    #[tokio::test]
    async fn demo_recovers_from_simulated_outage() {
        let mut args = args();
        args.simulated_outages = 1;
        run_demo(args).await.expect("demo completes");
    }

    #[tokio::test]
    async fn demo_handles_declined_buyer() {
        let mut args = args();
        args.buyer_declines = true;
        run_demo(args).await.expect("demo completes");
    }
}
