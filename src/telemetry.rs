//! Logging setup for the binaries.

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Installs a stderr fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (e.g. `info`, `debug`) is used.
pub fn init_logging(level: &str) -> Result<()> {
    let level: tracing::Level = level.trim().parse().context("invalid log level")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string())))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("logging already initialized")?;

    Ok(())
}
