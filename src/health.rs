use axum::routing::get;
use axum::Router;

/// Liveness endpoint served on `HTTP_PORT`.
pub fn router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz() -> &'static str {
    "ok"
}
