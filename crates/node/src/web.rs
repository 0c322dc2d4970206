use anyhow::Context;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::state::SharedStatus;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(status: SharedStatus) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/healthz", get(healthz))
        .with_state(status)
}

async fn api_status(State(status): State<SharedStatus>) -> impl IntoResponse {
    let st = status.read().await;
    Json(st.to_status())
}

async fn healthz() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(status: SharedStatus, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status port {addr}"))?;

    tracing::info!(%addr, "status api listening");

    axum::serve(listener, router(status))
        .await
        .context("status api server error")
}

// ===========================================================================
// Tests
// ===========================================================================
