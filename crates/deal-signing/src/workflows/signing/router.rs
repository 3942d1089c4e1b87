use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::domain::{ContractForm, DealKey, SessionKey, SigningRound};
use super::orchestrator::{ApprovalNotice, ContractOrchestrator, PrepareOptions, PreparedContract};
use super::polling::{PollHandle, StatusPoller};
use super::retry::RetryBudget;
use crate::config::{PollingConfig, RetryConfig};
use crate::error::AppError;

/// Per-session retry budgets for HTTP callers. A budget lives until the round
/// succeeds or the deal is restarted.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    config: RetryConfig,
    budgets: Arc<Mutex<HashMap<SessionKey, RetryBudget>>>,
}

impl RetryLedger {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            budgets: Arc::default(),
        }
    }

    pub fn checkout(&self, key: &SessionKey) -> RetryBudget {
        let guard = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get(key)
            .copied()
            .unwrap_or_else(|| RetryBudget::from_config(&self.config))
    }

    pub fn record(&self, key: &SessionKey, budget: RetryBudget) {
        let mut guard = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.clone(), budget);
    }

    pub fn settle(&self, key: &SessionKey) {
        let mut guard = self.budgets.lock().unwrap_or_else(PoisonError::into_inner);
        guard.remove(key);
    }

    pub fn reset(&self, deal: &DealKey) {
        self.settle(&SessionKey::for_round(deal, SigningRound::Buyer));
        self.settle(&SessionKey::for_round(deal, SigningRound::Seller));
    }
}

/// Running status watchers, one per deal. Replacing or removing a handle cancels it.
#[derive(Debug, Clone, Default)]
pub struct WatchRegistry {
    handles: Arc<Mutex<HashMap<DealKey, PollHandle>>>,
}

impl WatchRegistry {
    pub fn replace(&self, handle: PollHandle) {
        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|_, existing| !existing.is_finished());
        guard.insert(handle.deal().clone(), handle);
    }

    pub fn cancel(&self, deal: &DealKey) -> bool {
        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.remove(deal) {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn is_watching(&self, deal: &DealKey) -> bool {
        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get(deal) {
            Some(handle) if handle.is_finished() => {
                guard.remove(deal);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared state behind the signing routes.
#[derive(Debug, Clone)]
pub struct SigningApi {
    orchestrator: ContractOrchestrator,
    poller: StatusPoller,
    ledger: RetryLedger,
    watchers: WatchRegistry,
}

impl SigningApi {
    pub fn new(orchestrator: ContractOrchestrator, polling: &PollingConfig, retry: RetryConfig) -> Self {
        Self {
            poller: StatusPoller::new(orchestrator.clone(), polling),
            orchestrator,
            ledger: RetryLedger::new(retry),
            watchers: WatchRegistry::default(),
        }
    }

    pub fn orchestrator(&self) -> &ContractOrchestrator {
        &self.orchestrator
    }

    pub fn watchers(&self) -> &WatchRegistry {
        &self.watchers
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }
}

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
    #[serde(flatten)]
    pub form: ContractForm,
    #[serde(default)]
    pub force_new: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SellerRequest {
    #[serde(default)]
    pub seller_email: String,
    #[serde(default)]
    pub seller_name: String,
    #[serde(default)]
    pub force_new: bool,
}

#[derive(Debug, Serialize)]
struct SellerEnvelopeResponse {
    #[serde(flatten)]
    contract: PreparedContract,
    polling_interval_secs: u64,
}

/// Router builder exposing the contract signing steps to browser UI.
pub fn signing_router(api: Arc<SigningApi>) -> Router {
    Router::new()
        .route(
            "/api/v1/deals/:deal_key/contract",
            post(prepare_handler).get(snapshot_handler).delete(restart_handler),
        )
        .route("/api/v1/deals/:deal_key/contract/return", post(buyer_return_handler))
        .route("/api/v1/deals/:deal_key/contract/seller/send", post(send_to_seller_handler))
        .route(
            "/api/v1/deals/:deal_key/contract/seller/envelope",
            post(seller_envelope_handler),
        )
        .route("/api/v1/deals/:deal_key/contract/status", post(refresh_status_handler))
        .route(
            "/api/v1/deals/:deal_key/contract/watch",
            axum::routing::delete(cancel_watch_handler),
        )
        .route("/api/v1/deals/:deal_key/contract/document", get(document_handler))
        .route("/api/v1/deals/:deal_key/approval-notice", post(approval_notice_handler))
        .route("/api/v1/signing/consent-url", get(consent_url_handler))
        .with_state(api)
}

pub(crate) async fn prepare_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
    Json(request): Json<PrepareRequest>,
) -> Result<Json<PreparedContract>, AppError> {
    let deal = DealKey::new(deal_key)?;
    let key = SessionKey::for_round(&deal, SigningRound::Buyer);
    let options = PrepareOptions {
        force_new: request.force_new,
    };

    let mut budget = api.ledger.checkout(&key);
    let result = api
        .orchestrator
        .prepare_contract(&deal, request.form, options, &mut budget)
        .await;
    settle_budget(&api.ledger, &key, budget, result.is_ok());
    Ok(Json(result?))
}

pub(crate) async fn snapshot_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let snapshot = api.orchestrator.snapshot(&deal)?;
    let payload = json!({
        "deal": deal,
        "stage": snapshot.stage(),
        "buyer": snapshot.buyer,
        "seller": snapshot.seller,
        "watching": api.watchers.is_watching(&deal),
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn restart_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<StatusCode, AppError> {
    let deal = DealKey::new(deal_key)?;
    api.watchers.cancel(&deal);
    api.orchestrator.restart(&deal).await?;
    api.ledger.reset(&deal);
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn buyer_return_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let session = api.orchestrator.record_buyer_return(&deal).await?;
    Ok((StatusCode::OK, Json(session)).into_response())
}

pub(crate) async fn send_to_seller_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
    Json(request): Json<SellerRequest>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let delivery = api
        .orchestrator
        .send_to_seller(&deal, &request.seller_email, &request.seller_name)
        .await?;
    let payload = json!({
        "deal": delivery.deal,
        "stage": delivery.stage,
        "seller_email": delivery.seller_email,
        "document_bytes": delivery.document.len(),
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn seller_envelope_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
    Json(request): Json<SellerRequest>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let key = SessionKey::for_round(&deal, SigningRound::Seller);
    let options = PrepareOptions {
        force_new: request.force_new,
    };

    let mut budget = api.ledger.checkout(&key);
    let result = api
        .orchestrator
        .prepare_seller_signing(
            &deal,
            &request.seller_email,
            &request.seller_name,
            options,
            &mut budget,
        )
        .await;
    settle_budget(&api.ledger, &key, budget, result.is_ok());
    let contract = result?;

    api.watchers.replace(api.poller.watch(deal));
    let response = SellerEnvelopeResponse {
        contract,
        polling_interval_secs: api.poller.interval().as_secs(),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}

pub(crate) async fn refresh_status_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let report = api.orchestrator.refresh_status(&deal).await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

pub(crate) async fn cancel_watch_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let cancelled = api.watchers.cancel(&deal);
    Ok((StatusCode::OK, Json(json!({ "cancelled": cancelled }))).into_response())
}

pub(crate) async fn document_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    let document = api.orchestrator.download_signed_document(&deal).await?;
    let disposition = format!("attachment; filename=\"{}\"", document.file_name);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document.bytes,
    )
        .into_response())
}

pub(crate) async fn approval_notice_handler(
    State(api): State<Arc<SigningApi>>,
    Path(deal_key): Path<String>,
    Json(notice): Json<ApprovalNotice>,
) -> Result<Response, AppError> {
    let deal = DealKey::new(deal_key)?;
    api.orchestrator.send_approval_notice(&notice).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "deal": deal, "sent_to": notice.scout_email.trim() })),
    )
        .into_response())
}

pub(crate) async fn consent_url_handler(State(api): State<Arc<SigningApi>>) -> Json<serde_json::Value> {
    Json(json!({ "consent_url": api.orchestrator.consent_url() }))
}

fn settle_budget(ledger: &RetryLedger, key: &SessionKey, budget: RetryBudget, succeeded: bool) {
    if succeeded {
        ledger.settle(key);
    } else {
        ledger.record(key, budget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ledger_hands_out_fresh_budget_until_recorded() {
        let ledger = RetryLedger::new(RetryConfig {
            manual_retries: 1,
            auto_refreshes: 0,
            backoff: Duration::ZERO,
        });
        let deal = DealKey::new("deal-9").expect("key");
        let key = SessionKey::for_round(&deal, SigningRound::Buyer);

        let mut budget = ledger.checkout(&key);
        assert!(budget.begin_attempt());
        ledger.record(&key, budget);
        assert_eq!(ledger.checkout(&key), budget);

        ledger.reset(&deal);
        assert_eq!(ledger.checkout(&key).manual_remaining(), 1);
    }

    #[test]
    fn settled_budget_starts_over() {
        let ledger = RetryLedger::new(RetryConfig::default());
        let key = SessionKey::for_round(&DealKey::new("deal-3").expect("key"), SigningRound::Seller);
        let mut budget = ledger.checkout(&key);
        budget.begin_attempt();
        budget.begin_attempt();
        settle_budget(&ledger, &key, budget, true);
        assert_eq!(ledger.checkout(&key), RetryBudget::from_config(&RetryConfig::default()));
    }
}
