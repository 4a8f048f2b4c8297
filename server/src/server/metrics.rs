use crate::{metrics::RequestLabels, server::Dependencies};
use axum::{
    debug_handler,
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::get,
    Router,
};
use prometheus_client::encoding::text::encode;
use tracing::trace;

pub fn create_router(deps: Dependencies) -> Router {
    let router: Router = Router::new()
        .route("/metrics", get(metrics))
        .with_state(deps);

    router
}

#[debug_handler]
async fn metrics(State(state): State<Dependencies>) -> (StatusCode, String) {
    trace!(route = "/metrics", method = "GET", "handle request");

    let registry = state.metrics.registry;
    let mut body = String::new();

    match encode(&mut body, &registry) {
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, body),
        Ok(_) => (StatusCode::OK, body),
    }
}

/// Count every response by matched route template and status code.
pub async fn track_requests(
    State(state): State<Dependencies>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    state
        .metrics
        .http
        .requests_total
        .get_or_create(&RequestLabels {
            route,
            status: response.status().as_u16(),
        })
        .inc();
    response
}
