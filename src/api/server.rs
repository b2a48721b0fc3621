//! Prediction server lifecycle.
//!
//! `serve` runs in the foreground until its shutdown future resolves; it is
//! what the binary uses. `start_server_on` binds, spawns the server in a
//! background task and returns a handle with a shutdown channel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::router::predict_router;
use crate::config::ServerConfig;
use crate::context::ServiceContext;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════
// Foreground
// ═══════════════════════════════════════════════════════════

/// Bind `config.bind_addr` and serve `/predict` until `shutdown` resolves.
pub async fn serve<F>(
    ctx: Arc<ServiceContext>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let model = ctx.model_name();
    let app = predict_router(ctx, config.max_upload_bytes);

    tracing::info!(%addr, model, "Turbidity server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Turbidity server stopped");
    Ok(())
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

// ═══════════════════════════════════════════════════════════
// Background
// ═══════════════════════════════════════════════════════════

/// Handle to a server running in a background task.
pub struct PredictServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl PredictServer {
    /// Shut down the server gracefully.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tracing::info!("Turbidity server shutdown signal sent");
        }
    }
}

/// Start the server on `addr` in a background task.
///
/// Port 0 picks an ephemeral port; the bound address is in the handle.
pub async fn start_server_on(
    ctx: Arc<ServiceContext>,
    addr: SocketAddr,
    max_upload_bytes: usize,
) -> Result<PredictServer, ServerError> {
    let listener = bind(addr).await?;
    let addr = listener.local_addr()?;
    let model = ctx.model_name();
    let app = predict_router(ctx, max_upload_bytes);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown_rx.await;
            tracing::info!("Turbidity server received shutdown signal");
        };

        tracing::info!(%addr, model, "Turbidity server started");

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            tracing::error!("Turbidity server error: {e}");
        }

        tracing::info!("Turbidity server stopped");
    });

    Ok(PredictServer {
        addr,
        shutdown_tx: Some(shutdown_tx),
    })
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
