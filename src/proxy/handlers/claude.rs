// Anthropic-compatible ingress.
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::Value;
use tracing::info;

use super::common::{bearer_from_headers, caller_auth, dispatch, error_response, CallerFormat};
use super::streaming::build_json_response;
use crate::proxy::mappers::claude::{to_middle, ClaudeRequest};
use crate::proxy::state::AppState;
use crate::utils::estimator;

/// Anthropic clients send the key either as `x-api-key` or a bearer.
fn claude_bearer(headers: &HeaderMap) -> Option<String> {
    bearer_from_headers(headers).or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|h| h.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let bearer = claude_bearer(&headers);
    if bearer.is_none() {
        return error_response(
            CallerFormat::Claude,
            StatusCode::UNAUTHORIZED,
            "missing API key",
        );
    }

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                CallerFormat::Claude,
                StatusCode::BAD_REQUEST,
                &format!("invalid request: {}", e),
            )
        }
    };

    let trace_id = format!("req_{}", chrono::Utc::now().timestamp_millis());
    info!(
        "[{}] Claude messages request: {} | {} messages | stream: {}",
        trace_id,
        request.model,
        request.messages.len(),
        request.stream
    );

    let auth = caller_auth(&state, bearer);
    let middle = to_middle(&request);
    dispatch(&state, &auth, middle, CallerFormat::Claude).await
}

/// Token counting uses the same deterministic estimator that backs the
/// streamed `usage` blocks.
pub async fn handle_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let auth = caller_auth(&state, claude_bearer(&headers));
    if !auth.is_config_key {
        return error_response(
            CallerFormat::Claude,
            StatusCode::UNAUTHORIZED,
            "invalid API key",
        );
    }

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                CallerFormat::Claude,
                StatusCode::BAD_REQUEST,
                &format!("invalid request: {}", e),
            )
        }
    };
    let middle = to_middle(&request);
    let input_tokens = estimator::estimate_messages(&middle.messages);
    build_json_response(
        StatusCode::OK,
        &serde_json::json!({"input_tokens": input_tokens}),
    )
}
