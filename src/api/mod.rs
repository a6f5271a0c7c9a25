pub mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{create_router, AppState};

use std::net::SocketAddr;
use tracing::info;

/// Serves the API until ctrl-c or until `state.shutdown` is cancelled.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await
}
