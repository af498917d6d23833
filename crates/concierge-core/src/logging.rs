use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::Environment, Error, Result};

/// Initialize tracing for the bot.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to our crates and
/// everything else stays at `warn`.
pub fn init(service_name: &str, env: Environment, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,concierge={level},concierge_core={level},concierge_telegram={level},{service_name}={level}"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(matches!(env, Environment::Development))
        .with_ansi(matches!(env, Environment::Development))
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
