use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::workflows::signing::{FailureReason, InvalidInput, SigningError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Signing(SigningError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Signing(err) => signing_status(err),
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn signing_status(err: &SigningError) -> StatusCode {
    match err {
        SigningError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SigningError::ConsentRequired { .. }
        | SigningError::InvalidCredentials(_)
        | SigningError::AwaitingConsent { .. }
        | SigningError::Halted(FailureReason::ConsentRequired) => StatusCode::FORBIDDEN,
        SigningError::NotFound(_) | SigningError::NoSession(_) => StatusCode::NOT_FOUND,
        SigningError::Halted(_)
        | SigningError::MaxRetriesExceeded
        | SigningError::InvalidTransition { .. }
        | SigningError::NotSigned(_) => StatusCode::CONFLICT,
        SigningError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        SigningError::ProviderUnavailable(_)
        | SigningError::Provider { .. }
        | SigningError::PartialFailure { .. }
        | SigningError::Notify(_) => StatusCode::BAD_GATEWAY,
        SigningError::Render(_) | SigningError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Signing(err) => write!(f, "signing error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Signing(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Signing(err) => {
                let mut body = json!({
                    "error": self.to_string(),
                    "message": err.user_message(),
                    "policy": err.policy(),
                });
                if let Some(consent_url) = err.consent_url() {
                    body["consent_url"] = json!(consent_url);
                }
                match err {
                    SigningError::InvalidInput(invalid) => {
                        body["field"] = json!(invalid.field);
                    }
                    SigningError::PartialFailure { document, .. } => {
                        body["document_bytes"] = json!(document.len());
                    }
                    _ => {}
                }
                body
            }
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<SigningError> for AppError {
    fn from(value: SigningError) -> Self {
        Self::Signing(value)
    }
}

impl From<InvalidInput> for AppError {
    fn from(value: InvalidInput) -> Self {
        Self::Signing(SigningError::InvalidInput(value))
    }
}
