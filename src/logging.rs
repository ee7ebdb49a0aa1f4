//! Diagnostic logging to stderr, filtered by the STALE_LOG variable.
//! Build output proper goes through Progress, not here.

use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_VAR: &str = "STALE_LOG";

/// The filter to use: STALE_LOG if set, else `info` when verbose and
/// `warn` otherwise.
fn filter(verbose: bool) -> anyhow::Result<EnvFilter> {
    match std::env::var(ENV_VAR) {
        Ok(directives) => EnvFilter::try_new(&directives).map_err(|err| anyhow::anyhow!("bad {}={:?}: {}", ENV_VAR, directives, err)),
        Err(_) => Ok(EnvFilter::new(if verbose { "stale=info" } else { "stale=warn" })),
    }
}

/// Install the global subscriber.  Later calls are ignored.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter(verbose)?)
        .with(layer)
        .try_init();
    Ok(())
}
