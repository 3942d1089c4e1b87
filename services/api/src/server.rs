use crate::cli::ServeArgs;
use crate::infra::{AppState, OutboxMailer, SandboxProvider};
use crate::routes::with_service_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use deal_signing::config::AppConfig;
use deal_signing::error::AppError;
use deal_signing::telemetry;
use deal_signing::workflows::signing::{
    ContractOrchestrator, FileSessionStore, HttpMailer, JwtTokenBroker, MemorySessionStore,
    NotificationGateway, RestEnvelopeClient, SessionStore, SigningApi, SigningError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let orchestrator = build_orchestrator(&config)?;
    let api = Arc::new(SigningApi::new(orchestrator, &config.polling, config.retry));

    let app = with_service_routes(api)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "contract signing service ready");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Wires the orchestrator from configuration. Without provider credentials the
/// in-process sandbox stands in for the e-signature provider.
pub(crate) fn build_orchestrator(config: &AppConfig) -> Result<ContractOrchestrator, AppError> {
    let sessions: Arc<dyn SessionStore> = match &config.sessions.directory {
        Some(directory) => {
            info!(directory = %directory.display(), "persisting signing sessions to disk");
            Arc::new(FileSessionStore::open(directory.clone()).map_err(SigningError::from)?)
        }
        None => Arc::new(MemorySessionStore::default()),
    };

    let mailer: Arc<dyn NotificationGateway> = match &config.mail {
        Some(mail) => Arc::new(HttpMailer::from_config(mail).map_err(SigningError::Notify)?),
        None => {
            warn!("MAIL_API_URL not set; outgoing mail is captured in memory only");
            Arc::new(OutboxMailer::default())
        }
    };

    let orchestrator = match &config.signing {
        Some(signing) => {
            let tokens = JwtTokenBroker::from_config(signing).map_err(SigningError::from)?;
            let envelopes = RestEnvelopeClient::from_config(signing).map_err(SigningError::from)?;
            info!(
                api_base = %signing.api_base,
                account_id = %signing.account_id,
                "using configured e-signature provider"
            );
            ContractOrchestrator::new(Arc::new(tokens), Arc::new(envelopes), sessions, mailer)
        }
        None => {
            warn!("SIGNING_INTEGRATION_KEY not set; using the sandbox e-signature provider");
            let sandbox = Arc::new(SandboxProvider::default());
            ContractOrchestrator::new(sandbox.clone(), sandbox, sessions, mailer)
        }
    };

    Ok(orchestrator)
}
