pub mod api;
pub mod classifier;
pub mod config;
pub mod context;
pub mod preprocess;
pub mod turbidity;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::api::ServerError;
use crate::classifier::ModelError;
use crate::config::ServerConfig;
use crate::context::ServiceContext;

/// Anything that stops the service from coming up or keeps it from serving.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Cannot load model: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

/// Load the model and serve `/predict` until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    init_tracing();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = ServerConfig::default();
    let ctx = Arc::new(ServiceContext::load(&config)?);

    api::serve(ctx, &config, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
