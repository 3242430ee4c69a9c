//! Serves cached Grok media from `data/temp/{image,video}/`.

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::proxy::media_cache::content_type_for;
use crate::proxy::state::AppState;

/// Flattened names never contain separators; anything that still looks
/// like a traversal is stripped.
fn sanitize(name: &str) -> String {
    name.replace("..", "").replace(['/', '\\'], "")
}

pub async fn handle_media(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let cache = match kind.as_str() {
        "image" => &state.core.image_cache,
        "video" => &state.core.video_cache,
        _ => return (StatusCode::NOT_FOUND, "unknown media kind").into_response(),
    };

    let clean = sanitize(&name);
    if clean.is_empty() {
        return (StatusCode::BAD_REQUEST, "invalid media name").into_response();
    }
    let path = cache.dir().join(&clean);
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(_) => return (StatusCode::NOT_FOUND, "media not cached").into_response(),
    };

    let stream = ReaderStream::new(file);
    Response::builder()
        .header("Content-Type", content_type_for(&clean))
        .header("Cache-Control", "public, max-age=3600")
        .body(Body::from_stream(stream))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_sequences_are_stripped() {
        assert_eq!(sanitize("../../secret"), "secret");
        assert_eq!(sanitize("a/../b"), "ab");
        assert_eq!(sanitize("users-a-img.png"), "users-a-img.png");
    }
}
