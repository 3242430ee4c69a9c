// Gemini-compatible ingress: /v1beta/models/{model}:{operation}.
use std::collections::HashMap;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde_json::Value;
use tracing::info;

use super::common::{bearer_from_headers, caller_auth, dispatch, error_response, CallerFormat};
use crate::proxy::mappers::gemini::to_middle;
use crate::proxy::state::AppState;

/// The `{model}:{operation}` path segment, e.g.
/// `gemini-pro:streamGenerateContent`.
fn split_model_action(segment: &str) -> Option<(&str, &str)> {
    segment.split_once(':')
}

/// Gemini accepts the key in the query string, two headers, or a bearer.
fn gemini_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    query
        .get("key")
        .cloned()
        .or_else(|| {
            headers
                .get("x-goog-api-key")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim().to_string())
        })
        .or_else(|| bearer_from_headers(headers))
        .filter(|s| !s.is_empty())
}

/// Gemini-shaped model catalog.
pub async fn handle_list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let auth = caller_auth(&state, gemini_key(&headers, &query));
    if !auth.is_config_key {
        return error_response(
            CallerFormat::Gemini,
            StatusCode::UNAUTHORIZED,
            "missing API key",
        );
    }
    let models: Vec<Value> = state
        .core
        .registry
        .model_ids()
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "name": format!("models/{}", id),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    super::streaming::build_json_response(StatusCode::OK, &serde_json::json!({"models": models}))
}

pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action)) = split_model_action(&model_action) else {
        return error_response(
            CallerFormat::Gemini,
            StatusCode::BAD_REQUEST,
            "expected {model}:generateContent or {model}:streamGenerateContent",
        );
    };
    let stream = match action {
        "generateContent" => false,
        // streamGenerateContent always streams, regardless of body flags.
        "streamGenerateContent" => true,
        other => {
            return error_response(
                CallerFormat::Gemini,
                StatusCode::BAD_REQUEST,
                &format!("unsupported operation '{}'", other),
            )
        }
    };

    let key = gemini_key(&headers, &query);
    if key.is_none() {
        return error_response(
            CallerFormat::Gemini,
            StatusCode::UNAUTHORIZED,
            "missing API key",
        );
    }

    let trace_id = format!("req_{}", chrono::Utc::now().timestamp_millis());
    info!(
        "[{}] Gemini request: {}:{} | stream: {}",
        trace_id, model, action, stream
    );

    let auth = caller_auth(&state, key);
    let middle = to_middle(model, &body, stream);
    dispatch(&state, &auth, middle, CallerFormat::Gemini).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_action_segment_splits_on_colon() {
        assert_eq!(
            split_model_action("grok-4:generateContent"),
            Some(("grok-4", "generateContent"))
        );
        assert_eq!(
            split_model_action("deepseek-chat:streamGenerateContent"),
            Some(("deepseek-chat", "streamGenerateContent"))
        );
        assert_eq!(split_model_action("no-colon"), None);
    }

    #[test]
    fn key_sources_are_checked_in_priority_order() {
        let mut query = HashMap::new();
        query.insert("key".to_string(), "qk".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "hk".parse().expect("header"));
        assert_eq!(gemini_key(&headers, &query).as_deref(), Some("qk"));

        let empty_query = HashMap::new();
        assert_eq!(gemini_key(&headers, &empty_query).as_deref(), Some("hk"));

        let mut bearer_only = HeaderMap::new();
        bearer_only.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer bk".parse().expect("header"),
        );
        assert_eq!(gemini_key(&bearer_only, &empty_query).as_deref(), Some("bk"));
        assert_eq!(gemini_key(&HeaderMap::new(), &empty_query), None);
    }
}
