use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use encoder_engine::{Encoder, EncoderConfig, EngineError};

use crate::cli::ServeArgs;
use crate::error::ServerError;
use crate::wiring;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("encoder-server starting");

    // --- Load config ---
    let mut config = EncoderConfig::load(&args.config)?;
    if let Some(password) = args.encryption_password {
        config.encryption_password = password;
    }
    if let Some(addr) = args.listen_addr {
        config.listen_addr = addr;
    }
    config.validate()?;
    tracing::info!(config = %args.config, "loaded config");

    // --- Start collaborators, recover streams ---
    let collaborators = wiring::collaborators(&config)?;
    let encoder = Encoder::bootstrap(&config, collaborators).await?;
    let report = encoder.recovery_report();
    tracing::info!(
        active = report.active.len(),
        pending = report.failed.len(),
        "engine ready"
    );

    // --- Open the RPC surface only after recovery ---
    let app = match encoder_api_server::router(encoder.manager().clone(), encoder.metrics_registry().clone()) {
        Ok(app) => app,
        Err(e) => {
            encoder.shutdown(Instant::now() + config.shutdown_grace()).await;
            return Err(EngineError::from(e).into());
        }
    };
    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(source) => {
            encoder.shutdown(Instant::now() + config.shutdown_grace()).await;
            return Err(ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            });
        }
    };
    let token = CancellationToken::new();
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = encoder_api_server::run(listener, app, api_token).await {
            tracing::error!(error = %e, "api server error");
        }
    });

    tracing::info!(listen_addr = %config.listen_addr, "server ready, press Ctrl+C to stop");

    // --- Wait for Ctrl+C ---
    let signal = tokio::signal::ctrl_c().await;
    let deadline = Instant::now() + encoder.shutdown_grace();
    tracing::info!(grace_ms = config.shutdown_grace_ms, "shutting down...");

    // Stop accepting lifecycle calls; open ones share the grace deadline.
    token.cancel();
    if tokio::time::timeout_at(deadline, &mut api_handle).await.is_err() {
        tracing::warn!("api requests still open at deadline, aborting");
        api_handle.abort();
    }

    encoder.shutdown(deadline).await;
    tracing::info!("shutdown complete");
    signal.map_err(ServerError::Signal)
}
