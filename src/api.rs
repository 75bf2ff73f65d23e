//! Admin HTTP surface
//!
//! A small plain-HTTP listener for operators and probes:
//! - `GET /healthz` → liveness, always "ok" while the process runs
//! - `POST /reconcile/{namespace}` → force one namespace reconcile now
//!
//! Manual reconciles go straight to the reconciler and do not touch the
//! scheduler's staleness stamps, so the periodic sweep still runs on its
//! own clock.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;
use crate::reconciler::Reconciler;
use crate::registry::Registry;
use crate::Result;

/// Shared state for admin handlers
#[derive(Clone)]
pub struct ApiState {
    /// Registry probed for readiness before accepting manual work
    pub registry: Arc<dyn Registry>,
    /// Reconciler that manual requests are handed to
    pub reconciler: Arc<dyn Reconciler>,
}

/// Build the admin router
pub fn admin_routes(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/reconcile/{namespace}", post(reconcile_handler))
        .with_state(state)
}

/// Serve the admin surface until the token is cancelled
pub async fn serve_admin(
    addr: SocketAddr,
    state: ApiState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal("admin_server", e))?;
    info!(addr = %addr, "admin surface listening");

    axum::serve(listener, admin_routes(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::internal("admin_server", e))
}

/// Handle `POST /reconcile/{namespace}`
async fn reconcile_handler(
    State(state): State<ApiState>,
    Path(namespace): Path<String>,
) -> (StatusCode, String) {
    if !state.registry.ready().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "registry is not ready".to_string(),
        );
    }

    info!(namespace = %namespace, "manual reconcile requested");
    match state.reconciler.reconcile_namespace(&namespace).await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}
