//! Management surface under `/api/v0/management`: admin session login and
//! credential-file CRUD. Everything except `/login` sits behind the admin
//! session middleware.

use axum::{
    extract::{Json, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::common::{error_response, CallerFormat};
use super::streaming::build_json_response;
use crate::proxy::state::AppState;
use crate::proxy::token_store::{grok::GROK_PROJECT, grok::GROK_TOKEN_FILE, TokenTier};
use crate::utils::crypto;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn handle_login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Response {
    let admin = &state.config.admin;
    let ok = !admin.username.is_empty()
        && crypto::constant_time_str_eq(&body.username, &admin.username)
        && crypto::verify_secret(&body.password, &admin.password);
    if !ok {
        tracing::warn!("[Admin] Failed login attempt for '{}'", body.username);
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"success": false, "message": "invalid credentials"})),
        )
            .into_response();
    }

    let sid = state.core.sessions.create();
    let cookie = state.core.sessions.login_cookie(&sid);
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        axum::Json(json!({"success": true, "message": "logged in"})),
    )
        .into_response()
}

pub async fn handle_logout(State(state): State<AppState>, headers: axum::http::HeaderMap) -> Response {
    if let Some(sid) = headers
        .get(header::COOKIE)
        .and_then(|c| c.to_str().ok())
        .and_then(crate::proxy::security::session_id_from_cookie_header)
    {
        state.core.sessions.remove(&sid);
    }
    (
        StatusCode::OK,
        [(header::SET_COOKIE, state.core.sessions.logout_cookie())],
        axum::Json(json!({"success": true, "message": "logged out"})),
    )
        .into_response()
}

pub async fn handle_check() -> Response {
    // The session middleware already vouched for the caller.
    build_json_response(StatusCode::OK, &json!({"authenticated": true}))
}

pub async fn handle_projects_list(State(state): State<AppState>) -> Response {
    build_json_response(
        StatusCode::OK,
        &json!({"projects": state.config.enabled_projects()}),
    )
}

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub project: String,
    pub filename: Option<String>,
}

pub async fn handle_tokens_list(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Response {
    // The grok store is one synthetic file regardless of directory content.
    let tokens = if query.project == GROK_PROJECT {
        vec![GROK_TOKEN_FILE.to_string()]
    } else {
        state.core.tokens.get_token_list(&query.project).await
    };
    build_json_response(StatusCode::OK, &json!({"tokens": tokens}))
}

pub async fn handle_tokens_get(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Response {
    let Some(filename) = query.filename else {
        return error_response(CallerFormat::OpenAI, StatusCode::BAD_REQUEST, "missing 'filename'");
    };
    match state.core.tokens.get_token(&query.project, &filename).await {
        Some(data) => build_json_response(StatusCode::OK, &data),
        None => error_response(CallerFormat::OpenAI, StatusCode::NOT_FOUND, "token file not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenAddRequest {
    pub project: String,
    #[serde(rename = "type", default)]
    pub token_type: String,
    pub data: Value,
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .collect()
}

fn derive_filename(data: &Value) -> String {
    let identifier = data
        .get("email")
        .or_else(|| data.get("mobile"))
        .and_then(|v| v.as_str())
        .map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    format!("{}.json", identifier)
}

pub async fn handle_tokens_add(
    State(state): State<AppState>,
    Json(body): Json<TokenAddRequest>,
) -> Response {
    if body.project == GROK_PROJECT {
        let tier = match body.token_type.as_str() {
            "super" | "ssoSuper" => TokenTier::Super,
            _ => TokenTier::Normal,
        };
        let Some(sso) = body.data.as_str().map(|s| s.to_string()).or_else(|| {
            body.data
                .get("token")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
        }) else {
            return error_response(
                CallerFormat::OpenAI,
                StatusCode::BAD_REQUEST,
                "grok token add requires the sso value in 'data'",
            );
        };
        if let Err(e) = state.core.grok_store.add_token(tier, sso).await {
            return error_response(CallerFormat::OpenAI, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
        return build_json_response(StatusCode::OK, &json!({"success": true}));
    }

    let mut data = body.data.clone();
    if !data.is_object() {
        return error_response(
            CallerFormat::OpenAI,
            StatusCode::BAD_REQUEST,
            "credential 'data' must be an object",
        );
    }
    if !body.token_type.is_empty() {
        data["type"] = json!(body.token_type);
    }
    if data.get("created_at").is_none() {
        data["created_at"] = json!(chrono::Utc::now().timestamp());
    }

    let filename = derive_filename(&data);
    if let Err(e) = state.core.tokens.save_token(&body.project, &filename, &data).await {
        return error_response(
            CallerFormat::OpenAI,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to write credential: {}", e),
        );
    }
    if body.project == crate::proxy::providers::deepseek::PROJECT {
        if let Some(adapter) = &state.core.deepseek {
            adapter.sync_pool().await;
        }
    }
    build_json_response(StatusCode::OK, &json!({"success": true, "filename": filename}))
}

#[derive(Debug, Deserialize)]
pub struct TokenDeleteRequest {
    pub project: String,
    pub filename: Option<String>,
    #[serde(rename = "type", default)]
    pub token_type: String,
    pub token: Option<String>,
}

pub async fn handle_tokens_delete(
    State(state): State<AppState>,
    Json(body): Json<TokenDeleteRequest>,
) -> Response {
    if body.project == GROK_PROJECT {
        let Some(token) = body.token else {
            return error_response(
                CallerFormat::OpenAI,
                StatusCode::BAD_REQUEST,
                "grok token delete requires 'token'",
            );
        };
        let tier = match body.token_type.as_str() {
            "super" | "ssoSuper" => TokenTier::Super,
            _ => TokenTier::Normal,
        };
        return match state.core.grok_store.delete_token(tier, &token).await {
            Ok(true) => build_json_response(StatusCode::OK, &json!({"success": true})),
            Ok(false) => error_response(CallerFormat::OpenAI, StatusCode::NOT_FOUND, "token not found"),
            Err(e) => error_response(
                CallerFormat::OpenAI,
                StatusCode::INTERNAL_SERVER_ERROR,
                &e.to_string(),
            ),
        };
    }

    let Some(filename) = body.filename else {
        return error_response(CallerFormat::OpenAI, StatusCode::BAD_REQUEST, "missing 'filename'");
    };
    match state.core.tokens.delete_token(&body.project, &filename).await {
        Ok(()) => build_json_response(StatusCode::OK, &json!({"success": true})),
        Err(e) => error_response(
            CallerFormat::OpenAI,
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to delete credential: {}", e),
        ),
    }
}

pub async fn handle_cache_stats(State(state): State<AppState>) -> Response {
    build_json_response(StatusCode::OK, &state.core.tokens.stats())
}
