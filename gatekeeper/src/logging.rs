use crate::config::LoggingConfig;
use sentry::ClientInitGuard;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLevel(#[from] ParseError),
    #[error("could not install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
///
/// Errors are reported to Sentry when a DSN is configured. The returned guard
/// flushes pending events on drop and must be held until exit.
pub fn init(config: &LoggingConfig) -> Result<Option<ClientInitGuard>, LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()?;

    Ok(guard)
}
