//! Shared dispatch: caller auth extraction, provider resolution, stream vs
//! aggregate handling, and protocol-shaped error bodies.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use serde_json::json;

use super::streaming::{build_json_response, build_sse_response};
use crate::proxy::mappers::{aggregate, claude, gemini};
use crate::proxy::mappers::middle::MiddleRequest;
use crate::proxy::providers::{CallerAuth, ProviderError};
use crate::proxy::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerFormat {
    OpenAI,
    Claude,
    Gemini,
}

pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn caller_auth(state: &AppState, bearer: Option<String>) -> CallerAuth {
    let is_config_key = bearer
        .as_deref()
        .map(|b| state.config.is_caller_key(b))
        .unwrap_or(false);
    CallerAuth {
        bearer,
        is_config_key,
    }
}

/// Protocol-native error body for the caller's API shape.
pub fn error_response(format: CallerFormat, status: StatusCode, message: &str) -> Response {
    let body = match format {
        CallerFormat::OpenAI => json!({
            "error": {
                "message": message,
                "type": openai_error_type(status),
                "code": status.as_u16(),
            }
        }),
        CallerFormat::Claude => json!({
            "type": "error",
            "error": {
                "type": claude_error_type(status),
                "message": message,
            }
        }),
        CallerFormat::Gemini => json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": gemini_error_status(status),
            }
        }),
    };
    build_json_response(status, &body)
}

fn openai_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        429 => "rate_limit_error",
        503 => "service_unavailable_error",
        _ => "api_error",
    }
}

fn claude_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_error_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

pub fn provider_error_response(format: CallerFormat, error: &ProviderError) -> Response {
    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(format, status, &error.to_string())
}

/// Resolves the model to its adapter and runs the request, shaping the
/// outcome for the caller's protocol.
pub async fn dispatch(state: &AppState, auth: &CallerAuth, request: MiddleRequest, format: CallerFormat) -> Response {
    if request.model.is_empty() {
        return error_response(format, StatusCode::BAD_REQUEST, "missing 'model'");
    }
    if request.messages.is_empty() {
        return error_response(format, StatusCode::BAD_REQUEST, "missing 'messages'");
    }
    let Some(adapter) = state.core.registry.resolve(&request.model) else {
        return error_response(
            format,
            StatusCode::BAD_REQUEST,
            &format!("unknown model '{}'", request.model),
        );
    };

    let wants_stream = request.stream;
    let provider_stream = match adapter.handle(auth, request).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("[Dispatch] Provider '{}' failed: {}", adapter.name(), e);
            return provider_error_response(format, &e);
        }
    };
    let model = provider_stream.model.clone();

    if wants_stream {
        let stream = match format {
            CallerFormat::OpenAI => provider_stream.stream,
            CallerFormat::Gemini => gemini::rewrap_openai_to_gemini_sse(provider_stream.stream),
            CallerFormat::Claude => {
                claude::rewrap_openai_to_claude_sse(provider_stream.stream, model.clone())
            }
        };
        return build_sse_response(stream, &model);
    }

    // Non-streaming callers get the aggregated completion in their shape.
    let aggregated = match aggregate::collect_sse(provider_stream.stream).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("[Dispatch] Aggregation failed: {}", e);
            return error_response(format, StatusCode::INTERNAL_SERVER_ERROR, &e);
        }
    };
    let completion = aggregated.into_completion();
    let body = match format {
        CallerFormat::OpenAI => completion,
        CallerFormat::Claude => claude::completion_to_claude(&completion),
        CallerFormat::Gemini => gemini::completion_to_gemini(&completion),
    };
    build_json_response(StatusCode::OK, &body)
}
