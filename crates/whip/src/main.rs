use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use whip::{logging, AssetServer, Config, SERVER_NAME, VERSION};

/// Content-addressed asset server for virtual-world platforms.
#[derive(Debug, Parser)]
#[command(name = "whip", about, version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(default_value = "whip.cfg")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors at startup are fatal.
    let config = Config::load(&cli.config)?;
    logging::install(config.debug);
    tracing::info!("{SERVER_NAME} {VERSION}");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("clean shutdown initiated");
        signal_token.cancel();
    });

    let server = AssetServer::bind(config, Some(cli.config), cancel).await?;
    server.serve().await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            tracing::error!(%err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
