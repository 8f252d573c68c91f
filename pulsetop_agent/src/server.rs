//! HTTP surface: the viewer WebSocket, the liveness probe, and serving.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::state::AppState;
use crate::ws::ws_handler;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// ok once both snapshot kinds are cached (placeholders included).
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.cache.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ok")
    }
}

/// Plain-TCP serving on an already bound listener, until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("pulsetop_agent: listening at ws://{addr}/ws");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
