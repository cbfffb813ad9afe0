use axum::{extract::Request, middleware::Next, response::Response};

/// Structured request log for the HTTP surface (health, metrics); the
/// WebSocket upgrade path logs its own Accept-stage fields from
/// `connection::ws_upgrade_handler` instead of going through this layer.
pub async fn log_requests_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    tracing::debug!(method = %method, uri = %uri, "incoming request");

    next.run(request).await
}
