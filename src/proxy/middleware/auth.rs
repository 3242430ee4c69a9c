use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::proxy::security::session_id_from_cookie_header;
use crate::proxy::state::AppState;

/// Gate for everything under `/api/v0/management` except `/login`: a valid
/// admin session cookie must be present.
pub async fn admin_session_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::COOKIE)
        .and_then(|c| c.to_str().ok())
        .and_then(session_id_from_cookie_header)
        .map(|sid| state.core.sessions.validate(&sid))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "admin session required"})),
        )
            .into_response();
    }
    next.run(request).await
}
