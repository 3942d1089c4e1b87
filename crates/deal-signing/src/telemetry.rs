use crate::config::TelemetryConfig;
use std::fmt;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Crates behind the provider and mail clients. Their `debug` output buries the
/// signing workflow events, so they stay at `warn` unless a directive names them.
const TRANSPORT_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

#[derive(Debug)]
pub enum TelemetryError {
    InvalidFilter { value: String, source: ParseError },
    AlreadyInstalled(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::InvalidFilter { value, .. } => {
                write!(f, "invalid log filter '{value}'")
            }
            TelemetryError::AlreadyInstalled(err) => {
                write!(f, "tracing subscriber already installed: {err}")
            }
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TelemetryError::InvalidFilter { source, .. } => Some(source),
            TelemetryError::AlreadyInstalled(err) => Some(&**err),
        }
    }
}

/// Expands `APP_LOG_LEVEL` into filter directives, capping the HTTP transport crates.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim();
    let mut directives = if level.is_empty() {
        "info".to_string()
    } else {
        level.to_string()
    };

    for target in TRANSPORT_TARGETS {
        let named = directives
            .split(',')
            .any(|directive| directive.trim().split(['=', '[']).next() == Some(*target));
        if !named {
            directives.push(',');
            directives.push_str(target);
            directives.push_str("=warn");
        }
    }
    directives
}

fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = filter_directives(&config.log_level);
    EnvFilter::try_new(&directives).map_err(|source| TelemetryError::InvalidFilter {
        value: config.log_level.clone(),
        source,
    })
}

/// Installs the global fmt subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(config)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_ansi(false)
        .try_init()
        .map_err(TelemetryError::AlreadyInstalled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_crates_are_capped() {
        assert_eq!(
            filter_directives("debug"),
            "debug,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn"
        );
        assert!(filter_directives("  ").starts_with("info,"));
    }

    #[test]
    fn explicit_transport_directives_are_kept() {
        let directives = filter_directives("info,reqwest=trace");
        assert!(directives.contains("reqwest=trace"));
        assert!(!directives.contains("reqwest=warn"));
        assert!(directives.contains("hyper=warn"));
    }

    #[test]
    fn rejects_unparseable_filter() {
        std::env::remove_var("RUST_LOG");
        let config = TelemetryConfig {
            log_level: "signing=[bogus".to_string(),
        };
        match build_filter(&config) {
            Err(TelemetryError::InvalidFilter { value, .. }) => assert_eq!(value, "signing=[bogus"),
            other => panic!("expected invalid filter, got {other:?}"),
        }
    }
}
