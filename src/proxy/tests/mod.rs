//! End-to-end surface tests: a real listener, a stub provider adapter, and
//! plain reqwest callers.

mod deepseek_adapter;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::models::{AppConfig, ProjectConfig};
use crate::proxy::egress::EgressProxy;
use crate::proxy::mappers::middle::MiddleRequest;
use crate::proxy::mappers::openai::{usage_value, ChunkBuilder};
use crate::proxy::media_cache::{MediaCache, MediaKind};
use crate::proxy::pool::CredentialPool;
use crate::proxy::providers::{CallerAuth, ProviderAdapter, ProviderError, ProviderStream};
use crate::proxy::registry::ProviderRegistry;
use crate::proxy::routes::build_proxy_routes;
use crate::proxy::security::AdminSessionStore;
use crate::proxy::state::{AppState, CoreServices};
use crate::proxy::token_store::{GrokTokenStore, TokenFileCache};

/// Stub provider emitting a fixed OpenAI SSE conversation.
struct StubAdapter;

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn models(&self) -> Vec<String> {
        vec!["stub-model".to_string()]
    }

    async fn handle(
        &self,
        auth: &CallerAuth,
        request: MiddleRequest,
    ) -> Result<ProviderStream, ProviderError> {
        if !auth.is_config_key {
            return Err(ProviderError::Unauthorized("key required".into()));
        }
        let builder = ChunkBuilder::new(&request.model);
        let frames: Vec<Result<Bytes, String>> = vec![
            Ok(builder.role_frame()),
            Ok(builder.content_frame("Hel")),
            Ok(builder.content_frame("lo")),
            Ok(builder.finish_frame("stop", Some(usage_value(1, 2)))),
            Ok(ChunkBuilder::done_frame()),
        ];
        Ok(ProviderStream {
            stream: Box::pin(futures::stream::iter(frames)),
            model: request.model,
        })
    }
}

fn temp_accounts_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "viaduct-e2e-{}-{}",
        std::process::id(),
        crate::utils::crypto::random_session_id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp accounts dir");
    dir
}

fn test_state() -> AppState {
    let mut config = AppConfig {
        keys: vec!["k1".to_string()],
        ..AppConfig::default()
    };
    config.admin.username = "admin".to_string();
    config.admin.password = crate::utils::crypto::encrypt_secret("secret");
    config
        .projects
        .insert("deepseek".to_string(), ProjectConfig { enabled: true });

    let tokens = Arc::new(TokenFileCache::new(temp_accounts_dir()));
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(StubAdapter));
    let egress = Arc::new(EgressProxy::new("", "", 60));
    let media_dir = std::env::temp_dir().join(format!(
        "viaduct-e2e-media-{}",
        crate::utils::crypto::random_session_id()
    ));

    AppState {
        core: Arc::new(CoreServices {
            pool: Arc::new(CredentialPool::new()),
            grok_store: Arc::new(GrokTokenStore::new(tokens.clone())),
            tokens,
            registry,
            image_cache: Arc::new(MediaCache::new(
                MediaKind::Image,
                &media_dir,
                16,
                egress.clone(),
            )),
            video_cache: Arc::new(MediaCache::new(
                MediaKind::Video,
                &media_dir,
                16,
                egress.clone(),
            )),
            egress,
            sessions: Arc::new(AdminSessionStore::new()),
            deepseek: None,
        }),
        config: Arc::new(config),
    }
}

async fn start_server(state: AppState) -> String {
    let router = build_proxy_routes(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve test app");
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn openai_nonstream_aggregates_the_stream() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("k1")
        .json(&json!({
            "model": "stub-model",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 1);
    assert_eq!(body["usage"]["completion_tokens"], 2);
    assert_eq!(body["object"], "chat.completion");
}

#[tokio::test]
async fn openai_stream_forwards_sse_with_single_role_frame() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("k1")
        .json(&json!({
            "model": "stub-model",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = resp.text().await.expect("stream body");
    let role_frames = body.matches("\"role\":\"assistant\"").count();
    assert_eq!(role_frames, 1);
    assert!(body.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn missing_bearer_is_unauthorized() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .json(&json!({"model": "stub-model", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn unknown_model_is_bad_request() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("k1")
        .json(&json!({"model": "gpt-4", "messages": [{"role": "user", "content": "x"}]}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn models_catalog_requires_valid_key() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/v1/models", base))
        .bearer_auth("wrong")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/v1/models", base))
        .bearer_auth("k1")
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["data"][0]["id"], "stub-model");
    assert_eq!(body["data"][0]["owned_by"], "stub");
}

#[tokio::test]
async fn gemini_stream_rewraps_openai_frames() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{}/v1beta/models/stub-model:streamGenerateContent?key=k1",
            base
        ))
        .json(&json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.expect("stream body");

    let mut texts = Vec::new();
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(data) else { continue };
        assert_eq!(frame["candidates"][0]["content"]["role"], "model");
        assert_eq!(frame["candidates"][0]["index"], 0);
        assert_eq!(frame["modelVersion"], "stub-model");
        if let Some(text) = frame["candidates"][0]["content"]["parts"][0]["text"].as_str() {
            texts.push(text.to_string());
        }
    }
    assert_eq!(texts.join(""), "Hello");
    assert!(!body.contains("[DONE]"), "Gemini SSE carries no DONE marker");
}

#[tokio::test]
async fn gemini_nonstream_converts_to_candidates() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "{}/v1beta/models/stub-model:generateContent",
            base
        ))
        .header("x-goog-api-key", "k1")
        .json(&json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "Hello");
    assert_eq!(body["candidates"][0]["finishReason"], "STOP");
    assert_eq!(body["usageMetadata"]["promptTokenCount"], 1);
    assert_eq!(body["usageMetadata"]["candidatesTokenCount"], 2);
    assert_eq!(body["modelVersion"], "stub-model");
}

#[tokio::test]
async fn claude_nonstream_converts_to_message() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/messages", base))
        .header("x-api-key", "k1")
        .json(&json!({
            "model": "stub-model",
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "Hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 1);
    assert_eq!(body["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn management_requires_session_and_supports_token_crud() {
    let state = test_state();
    let base = start_server(state).await;
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .expect("client with cookie store");

    // Unauthenticated access is refused.
    let resp = client
        .get(format!("{}/api/v0/management/projects/list", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);

    // Wrong password is refused.
    let resp = client
        .post(format!("{}/api/v0/management/login", base))
        .json(&json!({"username": "admin", "password": "wrong"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);

    // Login sets the session cookie.
    let resp = client
        .post(format!("{}/api/v0/management/login", base))
        .json(&json!({"username": "admin", "password": "secret"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/api/v0/management/check", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    // Credential CRUD round trip.
    let resp = client
        .post(format!("{}/api/v0/management/tokens/add", base))
        .json(&json!({
            "project": "deepseek",
            "type": "password",
            "data": {"email": "user@example.com", "password": "pw"}
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let added: Value = resp.json().await.expect("json");
    let filename = added["filename"].as_str().expect("filename").to_string();

    let resp = client
        .get(format!(
            "{}/api/v0/management/tokens/list?project=deepseek",
            base
        ))
        .send()
        .await
        .expect("request");
    let listed: Value = resp.json().await.expect("json");
    assert!(listed["tokens"]
        .as_array()
        .expect("tokens array")
        .iter()
        .any(|t| t == filename.as_str()));

    let resp = client
        .get(format!(
            "{}/api/v0/management/tokens/get?project=deepseek&filename={}",
            base, filename
        ))
        .send()
        .await
        .expect("request");
    let fetched: Value = resp.json().await.expect("json");
    assert_eq!(fetched["email"], "user@example.com");
    assert_eq!(fetched["type"], "password");

    let resp = client
        .post(format!("{}/api/v0/management/tokens/delete", base))
        .json(&json!({"project": "deepseek", "filename": filename}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    // Grok tokens live in the synthetic token.json.
    let resp = client
        .post(format!("{}/api/v0/management/tokens/add", base))
        .json(&json!({"project": "grok", "type": "super", "data": "sso-value"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{}/api/v0/management/tokens/list?project=grok", base))
        .send()
        .await
        .expect("request");
    let listed: Value = resp.json().await.expect("json");
    assert_eq!(listed["tokens"], json!(["token.json"]));

    let resp = client
        .post(format!("{}/api/v0/management/tokens/delete", base))
        .json(&json!({"project": "grok", "type": "super", "token": "sso-value"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    // Stats endpoint responds once authenticated.
    let resp = client
        .get(format!("{}/api/v0/management/cache/stats", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);

    // Logout invalidates the session.
    let resp = client
        .post(format!("{}/api/v0/management/logout", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{}/api/v0/management/check", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn claude_count_tokens_uses_the_estimator() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/messages/count_tokens", base))
        .header("x-api-key", "k1")
        .json(&json!({
            "model": "stub-model",
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    // ceil(5/4) + 4 per-message overhead.
    assert_eq!(body["input_tokens"], 6);
}

#[tokio::test]
async fn gemini_model_list_is_gemini_shaped() {
    let base = start_server(test_state()).await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/v1beta/models?key=k1", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["models"][0]["name"], "models/stub-model");

    let resp = client
        .get(format!("{}/v1beta/models", base))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn health_endpoint_is_open() {
    let base = start_server(test_state()).await;
    let resp = reqwest::get(format!("{}/health", base)).await.expect("request");
    assert_eq!(resp.status(), 200);
}
