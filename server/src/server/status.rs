use axum::{extract::State, http::StatusCode, routing::get, Router};
use tracing::{trace, warn};

use crate::server::Dependencies;

pub fn create_router(deps: Dependencies) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/ready", get(ready))
        .with_state(deps)
}

async fn ping() -> (StatusCode, &'static str) {
    trace!(route = "/ping", method = "GET", "handle request");
    (StatusCode::OK, "pong")
}

// ready while the user store answers queries
async fn ready(State(state): State<Dependencies>) -> (StatusCode, &'static str) {
    trace!(route = "/ready", method = "GET", "handle request");
    match state.users.count_users().await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
    }
}
