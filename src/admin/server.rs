use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use super::{
    services::{checkpoint, gc, get_ledger, health, mark_deleted},
    state::AdminState,
};

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ledgers/{ledger_id}", get(get_ledger))
        .route("/admin/checkpoint", post(checkpoint))
        .route("/admin/gc", post(gc))
        .route("/admin/ledgers/{ledger_id}/deleted", post(mark_deleted))
        .with_state(state)
}

/// Serve the admin API until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AdminState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(address) = listener.local_addr() {
        info!(%address, "Admin API listening");
    }
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
