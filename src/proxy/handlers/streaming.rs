use axum::{body::Body, http::StatusCode, response::Response};
use serde::Serialize;

use crate::proxy::providers::SseByteStream;

pub fn build_sse_response(stream: SseByteStream, model: &str) -> Response {
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Model", model)
        .body(Body::from_stream(stream))
        .unwrap()
}

pub fn build_json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(payload).unwrap()))
        .unwrap()
}
