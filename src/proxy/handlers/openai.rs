// OpenAI-compatible ingress.
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::Value;
use tracing::info;

use super::common::{bearer_from_headers, caller_auth, dispatch, error_response, CallerFormat};
use super::streaming::build_json_response;
use crate::proxy::mappers::openai::{to_middle, OpenAIRequest};
use crate::proxy::state::AppState;

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let bearer = bearer_from_headers(&headers);
    if bearer.is_none() {
        return error_response(
            CallerFormat::OpenAI,
            StatusCode::UNAUTHORIZED,
            "missing Authorization bearer",
        );
    }

    let request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                CallerFormat::OpenAI,
                StatusCode::BAD_REQUEST,
                &format!("invalid request: {}", e),
            )
        }
    };

    let trace_id = format!("req_{}", chrono::Utc::now().timestamp_millis());
    info!(
        "[{}] OpenAI chat request: {} | {} messages | stream: {}",
        trace_id,
        request.model,
        request.messages.len(),
        request.stream
    );

    let auth = caller_auth(&state, bearer);
    let middle = to_middle(&request);
    dispatch(&state, &auth, middle, CallerFormat::OpenAI).await
}

pub async fn handle_list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let auth = caller_auth(&state, bearer_from_headers(&headers));
    if !auth.is_config_key {
        return error_response(
            CallerFormat::OpenAI,
            StatusCode::UNAUTHORIZED,
            "invalid API key",
        );
    }
    build_json_response(StatusCode::OK, &state.core.registry.catalog())
}
