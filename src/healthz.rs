//! Health endpoint served by every role.
//!
//! A deliberately tiny surface: `GET /healthz` answering `{}` as long as the
//! process event loops are running. Liveness probes point here.

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;

async fn handle_health_check() -> &'static str {
    "{}"
}

/// Serve `GET /healthz` on the given port until the token is cancelled.
///
/// Binding failures are fatal (the caller aborts startup); anything after
/// that is logged and survived.
pub async fn run_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/healthz", get(handle_health_check));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Healthz server is listening");
    let drained = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { drained.cancelled().await })
        .await;
    if let Err(e) = result {
        error!(error = %e, "Healthz server error");
    } else {
        info!("Healthz server is shutting down");
    }
    Ok(())
}
