// 📜 Logging setup
//
// The library only emits `tracing` events. Embedding applications call
// `init_logging` once to get them printed.

use crate::error::{FlowsaError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when RUST_LOG is not set
pub const DEFAULT_FILTER: &str = "flowsa=info";

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `filter`. With `json` every event is one JSON line.
/// Fails if a global subscriber is already installed.
pub fn init_logging(filter: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| FlowsaError::Config(format!("invalid log filter {:?}: {}", filter, e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| FlowsaError::Config(format!("logging already initialized: {}", e)))
}
