use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ProtocolError::Config(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_deref() {
        Some("json") => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };

    result.map_err(|e| ProtocolError::Config(format!("Failed to install subscriber: {}", e)))
}
