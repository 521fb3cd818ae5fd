use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default level; the `debug` configuration key raises the default from
/// `info` to `debug`.
pub fn install(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // try_init: tests install per-process and may race.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    if debug {
        tracing::info!("debugging enabled");
    }
}
