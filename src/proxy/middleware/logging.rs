use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Logs every request with its status and latency. Health checks stay at
/// trace level so they do not flood the log.
pub async fn request_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed_ms = started.elapsed().as_millis();
    let status = response.status().as_u16();
    if path == "/health" {
        tracing::trace!("{} {} -> {} ({}ms)", method, path, status, elapsed_ms);
    } else {
        tracing::info!("{} {} -> {} ({}ms)", method, path, status, elapsed_ms);
    }
    response
}
