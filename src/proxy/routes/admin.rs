use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::proxy::handlers::management;
use crate::proxy::middleware::admin_session_middleware;
use crate::proxy::state::AppState;

/// `/api/v0/management` — login is open, everything else requires the
/// session cookie.
pub fn build_admin_routes(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/logout", post(management::handle_logout))
        .route("/check", get(management::handle_check))
        .route("/projects/list", get(management::handle_projects_list))
        .route("/tokens/list", get(management::handle_tokens_list))
        .route("/tokens/get", get(management::handle_tokens_get))
        .route("/tokens/add", post(management::handle_tokens_add))
        .route("/tokens/delete", post(management::handle_tokens_delete))
        .route("/cache/stats", get(management::handle_cache_stats))
        .layer(from_fn_with_state(state, admin_session_middleware));

    Router::new().nest(
        "/api/v0/management",
        Router::new()
            .route("/login", post(management::handle_login))
            .merge(protected),
    )
}
