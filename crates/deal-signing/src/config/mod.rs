use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    /// Provider credentials. `None` runs the service against the sandbox provider.
    pub signing: Option<SigningConfig>,
    pub retry: RetryConfig,
    pub polling: PollingConfig,
    pub sessions: SessionConfig,
    pub mail: Option<MailConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            signing: SigningConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            polling: PollingConfig::from_env()?,
            sessions: SessionConfig::from_env(),
            mail: MailConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

pub const DEFAULT_AUTH_BASE: &str = "https://account-d.docusign.com";
pub const DEFAULT_API_BASE: &str = "https://demo.docusign.net/restapi";
pub const DEFAULT_SCOPES: &str = "signature impersonation";

/// Server-held delegated-authorization material for the e-signature provider.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub integration_key: String,
    pub user_id: String,
    pub private_key: SecretString,
    pub account_id: String,
    pub auth_base: String,
    pub api_base: String,
    pub return_url: String,
    pub consent_redirect_url: String,
    pub scopes: Vec<String>,
    pub token_ttl: Duration,
    pub http_timeout: Duration,
}

impl SigningConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let integration_key = match optional_var("SIGNING_INTEGRATION_KEY") {
            Some(key) => key,
            None => return Ok(None),
        };

        let user_id = required_var("SIGNING_USER_ID")?;
        let account_id = required_var("SIGNING_ACCOUNT_ID")?;
        let private_key = match optional_var("SIGNING_PRIVATE_KEY") {
            Some(pem) => pem.replace("\\n", "\n"),
            None => {
                let path = PathBuf::from(required_var("SIGNING_PRIVATE_KEY_PATH")?);
                std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::UnreadableKey { path, source })?
            }
        };

        let return_url = optional_var("SIGNING_RETURN_URL")
            .unwrap_or_else(|| "http://localhost:3000/contract/return".to_string());
        let consent_redirect_url =
            optional_var("SIGNING_CONSENT_REDIRECT_URL").unwrap_or_else(|| return_url.clone());
        let scopes = optional_var("SIGNING_SCOPES")
            .unwrap_or_else(|| DEFAULT_SCOPES.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(Some(Self {
            integration_key,
            user_id,
            private_key: SecretString::from(private_key),
            account_id,
            auth_base: optional_var("SIGNING_AUTH_BASE")
                .unwrap_or_else(|| DEFAULT_AUTH_BASE.to_string()),
            api_base: optional_var("SIGNING_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            return_url,
            consent_redirect_url,
            scopes,
            token_ttl: Duration::from_secs(parse_var("SIGNING_TOKEN_TTL_SECS", 3600)?),
            http_timeout: parse_nonzero_secs("SIGNING_HTTP_TIMEOUT_SECS", 30)?,
        }))
    }
}

/// Bounds for the prepare-contract retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub manual_retries: u32,
    pub auto_refreshes: u32,
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            manual_retries: 3,
            auto_refreshes: 2,
            backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            manual_retries: parse_var("SIGNING_MANUAL_RETRIES", defaults.manual_retries)?,
            auto_refreshes: parse_var("SIGNING_AUTO_REFRESHES", defaults.auto_refreshes)?,
            backoff: Duration::from_millis(parse_var("SIGNING_RETRY_BACKOFF_MS", 1000)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl PollingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            interval: parse_nonzero_secs("SIGNING_POLL_INTERVAL_SECS", 30)?,
        })
    }
}

/// Where signing sessions live. `None` keeps them in process memory.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub directory: Option<PathBuf>,
}

impl SessionConfig {
    fn from_env() -> Self {
        Self {
            directory: optional_var("SIGNING_SESSION_DIR").map(PathBuf::from),
        }
    }
}

/// Transactional e-mail API settings.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: SecretString,
    pub from: String,
    pub timeout: Duration,
}

impl MailConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let api_url = match optional_var("MAIL_API_URL") {
            Some(url) => url,
            None => return Ok(None),
        };

        Ok(Some(Self {
            api_url,
            api_key: SecretString::from(required_var("MAIL_API_KEY")?),
            from: required_var("MAIL_FROM")?,
            timeout: parse_nonzero_secs("MAIL_TIMEOUT_SECS", 20)?,
        }))
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required_var(name: &'static str) -> Result<String, ConfigError> {
    optional_var(name).ok_or(ConfigError::Missing { name })
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        None => Ok(default),
    }
}

/// Whole seconds that feed timers and client timeouts, where zero is meaningless.
fn parse_nonzero_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match parse_var(name, default)? {
        0 => Err(ConfigError::ZeroDuration { name }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost {
        source: std::net::AddrParseError,
    },
    Missing {
        name: &'static str,
    },
    InvalidNumber {
        name: &'static str,
        value: String,
    },
    ZeroDuration {
        name: &'static str,
    },
    UnreadableKey {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::Missing { name } => {
                write!(f, "{name} is required when signing or mail is configured")
            }
            ConfigError::InvalidNumber { name, value } => {
                write!(f, "{name} must be a non-negative integer (found '{value}')")
            }
            ConfigError::ZeroDuration { name } => {
                write!(f, "{name} must be at least 1 second")
            }
            ConfigError::UnreadableKey { path, .. } => {
                write!(f, "unable to read private key at {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::UnreadableKey { source, .. } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::Missing { .. }
            | ConfigError::InvalidNumber { .. }
            | ConfigError::ZeroDuration { .. } => None,
        }
    }
}
