use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use deal_signing::config::SigningConfig;
use deal_signing::workflows::signing::{
    AuthGrant, EnvelopeDraft, EnvelopeError, EnvelopeGateway, EnvelopeStatus, JwtTokenBroker,
    Recipient, RestEnvelopeClient, SigningDocument, TokenBroker, TokenError, COMBINED_DOCUMENT_ID,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

const TEST_KEY: &str = include_str!("fixtures/test_rsa_key.pem");
const ACCESS_TOKEN: &str = "tok-123";

#[derive(Debug, Clone, Copy, Default)]
enum TokenMode {
    #[default]
    Issue,
    ConsentRequired,
    BadGrant,
    Down,
}

#[derive(Clone, Default)]
struct ProviderState {
    token_mode: Arc<Mutex<TokenMode>>,
    token_bodies: Arc<Mutex<Vec<String>>>,
    created: Arc<Mutex<Vec<Value>>>,
    authorizations: Arc<Mutex<Vec<String>>>,
    views: Arc<AtomicUsize>,
}

impl ProviderState {
    fn set_token_mode(&self, mode: TokenMode) {
        *self.token_mode.lock().expect("mode mutex") = mode;
    }

    fn remember_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.authorizations.lock().expect("auth mutex").push(value);
    }
}

async fn token(State(state): State<ProviderState>, body: String) -> Response {
    state.token_bodies.lock().expect("body mutex").push(body);
    let mode = *state.token_mode.lock().expect("mode mutex");
    match mode {
        TokenMode::Issue => Json(json!({
            "access_token": ACCESS_TOKEN,
            "token_type": "Bearer",
            "expires_in": 3600,
        }))
        .into_response(),
        TokenMode::ConsentRequired => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "consent_required" })),
        )
            .into_response(),
        TokenMode::BadGrant => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "no_valid_keys_or_signatures",
            })),
        )
            .into_response(),
        TokenMode::Down => (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response(),
    }
}

async fn create_envelope(
    State(state): State<ProviderState>,
    Path(_account): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.remember_auth(&headers);
    let mut created = state.created.lock().expect("created mutex");
    created.push(body);
    Json(json!({ "envelopeId": format!("env-{}", created.len()), "status": "sent" }))
}

async fn recipient_view(
    State(state): State<ProviderState>,
    Path((_account, envelope)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.remember_auth(&headers);
    if envelope == "gone" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "errorCode": "ENVELOPE_DOES_NOT_EXIST",
                "message": "The envelope specified does not exist.",
            })),
        )
            .into_response();
    }
    let ticket = state.views.fetch_add(1, Ordering::SeqCst) + 1;
    let client_user_id = body["clientUserId"].as_str().unwrap_or_default().to_string();
    Json(json!({
        "url": format!("https://sign.local/{envelope}?client={client_user_id}&ticket={ticket}")
    }))
    .into_response()
}

async fn envelope_status(Path((_account, envelope)): Path<(String, String)>) -> Response {
    match envelope.as_str() {
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Json(json!({ "status": "sent" })).into_response()
        }
        "busy" => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "errorCode": "HOURLY_APIINVOCATION_LIMIT_EXCEEDED", "message": "slow down" })),
        )
            .into_response(),
        _ => Json(json!({ "status": "completed", "envelopeId": envelope })).into_response(),
    }
}

async fn documents(Path((_account, _envelope)): Path<(String, String)>) -> Json<Value> {
    Json(json!({
        "envelopeId": "env-1",
        "envelopeDocuments": [
            { "documentId": "1", "name": "Purchase Agreement", "type": "content" },
            { "documentId": "certificate", "name": "Summary", "type": "summary" },
        ]
    }))
}

async fn download(Path((_account, envelope, document)): Path<(String, String, String)>) -> Vec<u8> {
    format!("%PDF-1.7 {envelope}/{document}").into_bytes()
}

async fn spawn_provider() -> (SocketAddr, ProviderState) {
    let state = ProviderState::default();
    let app = Router::new()
        .route("/oauth/token", post(token))
        .route("/restapi/v2.1/accounts/:account/envelopes", post(create_envelope))
        .route(
            "/restapi/v2.1/accounts/:account/envelopes/:envelope",
            get(envelope_status),
        )
        .route(
            "/restapi/v2.1/accounts/:account/envelopes/:envelope/views/recipient",
            post(recipient_view),
        )
        .route(
            "/restapi/v2.1/accounts/:account/envelopes/:envelope/documents",
            get(documents),
        )
        .route(
            "/restapi/v2.1/accounts/:account/envelopes/:envelope/documents/:document",
            get(download),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake provider");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fake provider");
    });
    (addr, state)
}

fn signing_config(addr: SocketAddr) -> SigningConfig {
    SigningConfig {
        integration_key: "ik-123".to_string(),
        user_id: "user-456".to_string(),
        private_key: SecretString::from(TEST_KEY.to_string()),
        account_id: "acct-789".to_string(),
        auth_base: format!("http://{addr}"),
        api_base: format!("http://{addr}/restapi"),
        return_url: "http://localhost:3000/contract/return".to_string(),
        consent_redirect_url: "http://localhost:3000/consent".to_string(),
        scopes: vec!["signature".to_string(), "impersonation".to_string()],
        token_ttl: Duration::from_secs(3600),
        http_timeout: Duration::from_millis(300),
    }
}

fn grant() -> AuthGrant {
    AuthGrant {
        access_token: SecretString::from(ACCESS_TOKEN.to_string()),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        scope: vec!["signature".to_string()],
    }
}

fn draft() -> EnvelopeDraft {
    EnvelopeDraft {
        document: SigningDocument {
            name: "Purchase Agreement - 40 Mesa Ridge Rd".to_string(),
            file_extension: "html".to_string(),
            bytes: b"<html><p>/sn1/</p></html>".to_vec(),
        },
        recipients: vec![Recipient::signer("buyer@x.com", "B")],
        subject: "Please sign".to_string(),
    }
}

#[tokio::test]
async fn jwt_grant_exchanges_signed_assertion() {
    let (addr, provider) = spawn_provider().await;
    let broker = JwtTokenBroker::from_config(&signing_config(addr)).expect("broker");

    let grant = broker.acquire_token().await.expect("token issued");
    assert_eq!(grant.access_token.expose_secret(), ACCESS_TOKEN);
    assert!(!grant.is_expired(Utc::now()));

    let bodies = provider.token_bodies.lock().expect("body mutex").clone();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"));
    let assertion = bodies[0]
        .split('&')
        .find_map(|pair| pair.strip_prefix("assertion="))
        .expect("assertion field");
    let header = jsonwebtoken::decode_header(assertion).expect("jwt header");
    assert_eq!(header.alg, jsonwebtoken::Algorithm::RS256);
}

#[tokio::test]
async fn consent_required_is_reported_with_consent_url() {
    let (addr, provider) = spawn_provider().await;
    provider.set_token_mode(TokenMode::ConsentRequired);
    let broker = JwtTokenBroker::from_config(&signing_config(addr)).expect("broker");

    let err = broker.acquire_token().await.expect_err("consent missing");
    match err {
        TokenError::ConsentRequired { consent_url } => {
            assert!(consent_url.starts_with(&format!("http://{addr}/oauth/auth?response_type=code")));
            assert!(consent_url.contains("client_id=ik-123"));
            assert!(consent_url.contains("scope=signature%20impersonation"));
            assert_eq!(consent_url, broker.consent_url());
        }
        other => panic!("expected consent required, got {other:?}"),
    }
}

#[tokio::test]
async fn token_failures_are_classified() {
    let (addr, provider) = spawn_provider().await;
    let broker = JwtTokenBroker::from_config(&signing_config(addr)).expect("broker");

    provider.set_token_mode(TokenMode::BadGrant);
    assert!(matches!(
        broker.acquire_token().await,
        Err(TokenError::InvalidCredentials { .. })
    ));

    provider.set_token_mode(TokenMode::Down);
    assert!(matches!(
        broker.acquire_token().await,
        Err(TokenError::ProviderUnavailable { .. })
    ));
}

#[tokio::test]
async fn unusable_private_key_fails_before_network() {
    let (addr, provider) = spawn_provider().await;
    let mut config = signing_config(addr);
    config.private_key = SecretString::from("not a pem".to_string());
    let broker = JwtTokenBroker::from_config(&config).expect("broker");

    assert!(matches!(
        broker.acquire_token().await,
        Err(TokenError::InvalidCredentials { .. })
    ));
    assert!(provider.token_bodies.lock().expect("body mutex").is_empty());
}

#[tokio::test]
async fn create_envelope_posts_document_and_anchored_signer() {
    let (addr, provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");

    let created = client
        .create_envelope(&grant(), &draft())
        .await
        .expect("envelope created");
    assert_eq!(created.envelope_id, "env-1");
    assert_eq!(created.account_id, "acct-789");

    let bodies = provider.created.lock().expect("created mutex").clone();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["status"], "sent");
    assert_eq!(body["emailSubject"], "Please sign");
    assert_eq!(
        body["documents"][0]["documentBase64"],
        BASE64.encode(b"<html><p>/sn1/</p></html>")
    );
    let signer = &body["recipients"]["signers"][0];
    assert_eq!(signer["email"], "buyer@x.com");
    assert_eq!(signer["clientUserId"], "buyer@x.com");
    assert_eq!(signer["tabs"]["signHereTabs"][0]["anchorString"], "/sn1/");

    let auth = provider.authorizations.lock().expect("auth mutex").clone();
    assert_eq!(auth, vec![format!("Bearer {ACCESS_TOKEN}")]);
}

#[tokio::test]
async fn signing_urls_are_minted_per_request() {
    let (addr, _provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");
    let buyer = Recipient::signer("buyer@x.com", "B");

    let first = client
        .signing_url(&grant(), "env-1", &buyer)
        .await
        .expect("first url");
    let second = client
        .signing_url(&grant(), "env-1", &buyer)
        .await
        .expect("second url");

    assert!(first.starts_with("https://sign.local/env-1"));
    assert!(first.contains("client=buyer@x.com"));
    assert_ne!(first, second);
}

#[tokio::test]
async fn missing_envelope_maps_to_not_found() {
    let (addr, _provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");

    let err = client
        .signing_url(&grant(), "gone", &Recipient::signer("buyer@x.com", "B"))
        .await
        .expect_err("envelope gone");
    assert_eq!(err, EnvelopeError::NotFound("gone".to_string()));
}

#[tokio::test]
async fn status_documents_and_download() {
    let (addr, _provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");

    let state = client
        .envelope_state(&grant(), "env-1")
        .await
        .expect("status");
    assert_eq!(state.status, EnvelopeStatus::Completed);
    assert!(state.completed);

    let listed = client
        .list_documents(&grant(), "env-1")
        .await
        .expect("documents");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].document_id, "1");
    assert_eq!(listed[0].kind.as_deref(), Some("content"));

    let bytes = client
        .download_document(&grant(), "env-1", COMBINED_DOCUMENT_ID)
        .await
        .expect("download");
    assert_eq!(bytes, b"%PDF-1.7 env-1/combined".to_vec());
}

#[tokio::test]
async fn throttling_is_transient() {
    let (addr, _provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");

    let err = client
        .envelope_state(&grant(), "busy")
        .await
        .expect_err("throttled");
    assert!(err.is_transient());
    assert!(matches!(err, EnvelopeError::Unavailable(_)));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let (addr, _provider) = spawn_provider().await;
    let client = RestEnvelopeClient::from_config(&signing_config(addr)).expect("client");

    let err = client
        .envelope_state(&grant(), "slow")
        .await
        .expect_err("timed out");
    assert_eq!(err, EnvelopeError::Timeout);
}
