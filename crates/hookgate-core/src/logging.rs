use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::LogFormat, errors::Error, Result};

/// Initialize tracing for the process.
///
/// Default: info for our crates, warn for everything else. `RUST_LOG` overrides.
pub fn init(service_name: &str, format: LogFormat) -> Result<()> {
    let crate_name = service_name.replace('-', "_");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,hookgate=info,hookgate_core=info,hookgate_bridge=info,hookgate_redis=info,hookgate_sqlite=info,{crate_name}=info"
        ))
    });

    let res = match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
        LogFormat::Console => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(true)
            .try_init(),
    };

    res.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
