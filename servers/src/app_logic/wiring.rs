use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_telemetry::retrieve::OpenSkyClient;
use lib_telemetry::{Credentials, PollerError};

use super::config::Config;

/// Loads the primary (and optional alternate) credentials and builds the
/// upstream client.
pub fn opensky_client(config: &Config) -> Result<OpenSkyClient> {
    let path = config
        .credentials_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("credentials.json"));
    let credentials = Credentials::from_file(&path).context("cannot load OpenSky credentials")?;

    let alternate = match &config.alternate_credentials_path {
        Some(path) => Some(Credentials::from_file(path).context("cannot load alternate OpenSky credentials")?),
        None => None,
    };
    if alternate.is_some() {
        log::info!("Alternate credentials loaded; they will be used after the first 429.");
    }

    let settings = config.opensky_settings()?;
    log::info!(
        "Polling {}/states/all for bbox {:?} as client '{}'",
        settings.base_url,
        settings.bbox,
        credentials.client_id
    );
    OpenSkyClient::new(&settings, credentials, alternate).context("cannot build OpenSky client")
}

/// Logs the escalation and terminates the process with status 1.
pub fn escalate(err: &PollerError) -> ! {
    log::error!("FATAL: {}. Exiting.", err);
    log::logger().flush();
    std::process::exit(1)
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
pub fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-unix platforms, just wait forever.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => log::info!("SIGTERM received, initiating shutdown."),
    }
}
