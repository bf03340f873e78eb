use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the fmt subscriber. `RUST_LOG` selects the filter, `info` when unset.
pub fn init() -> anyhow::Result<()> {
    let fmt_layer = fmt::layer().with_target(true).with_level(true).compact();
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
