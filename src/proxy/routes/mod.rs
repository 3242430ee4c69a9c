mod admin;

use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::proxy::handlers;
use crate::proxy::middleware::request_log_middleware;
use crate::proxy::state::AppState;

pub use admin::build_admin_routes;

async fn health_check_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-goog-api-key"),
        ])
        .allow_origin(Any)
        .max_age(std::time::Duration::from_secs(3600))
}

pub fn build_proxy_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::claude::handle_count_tokens),
        )
        .route("/v1beta/models", get(handlers::gemini::handle_list_models))
        .route(
            "/v1beta/models/:model_action",
            post(handlers::gemini::handle_generate),
        )
        .route("/images/:kind/:name", get(handlers::media::handle_media))
        .merge(build_admin_routes(state.clone()))
        .layer(cors_layer())
        .layer(axum::middleware::from_fn(request_log_middleware))
        .with_state(state)
}
