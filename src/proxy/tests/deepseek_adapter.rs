//! DeepSeek adapter integration tests against a mock chat.deepseek.com.
//!
//! The proof-of-work artifact is an opaque binary that is not present in
//! the test environment, so these tests cover the credential, login and
//! session legs plus the failure semantics around the solver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::models::DeepseekConfig;
use crate::proxy::egress::EgressProxy;
use crate::proxy::mappers::middle::{MiddleMessage, MiddleRequest};
use crate::proxy::pool::CredentialPool;
use crate::proxy::providers::deepseek::{DeepseekAdapter, PROJECT};
use crate::proxy::providers::{CallerAuth, ProviderAdapter, ProviderError};
use crate::proxy::token_store::TokenFileCache;

#[derive(Clone)]
struct MockDeepseek {
    login_hits: Arc<AtomicUsize>,
    session_hits: Arc<AtomicUsize>,
    pow_algorithm: &'static str,
}

async fn login_handler(State(mock): State<MockDeepseek>, Json(body): Json<Value>) -> Json<Value> {
    mock.login_hits.fetch_add(1, Ordering::SeqCst);
    assert_eq!(body["os"], "android");
    Json(json!({
        "code": 0,
        "data": {"biz_data": {"user": {"token": "tok-from-login"}}}
    }))
}

async fn session_handler(State(mock): State<MockDeepseek>) -> Json<Value> {
    mock.session_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "code": 0,
        "data": {"biz_data": {"id": "session-1"}}
    }))
}

async fn pow_handler(State(mock): State<MockDeepseek>) -> Json<Value> {
    Json(json!({
        "code": 0,
        "data": {"biz_data": {"challenge": {
            "algorithm": mock.pow_algorithm,
            "challenge": "abc",
            "salt": "s",
            "difficulty": 100,
            "expire_at": 1_700_000_000i64,
            "signature": "sig",
            "target_path": "/api/v0/chat/completion"
        }}}
    }))
}

async fn start_mock_deepseek(mock: MockDeepseek) -> String {
    let app = Router::new()
        .route("/api/v0/users/login", post(login_handler))
        .route("/api/v0/chat_session/create", post(session_handler))
        .route("/api/v0/chat/create_pow_challenge", post(pow_handler))
        .with_state(mock);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock deepseek");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock deepseek");
    });
    format!("http://{}", addr)
}

struct Harness {
    adapter: DeepseekAdapter,
    pool: Arc<CredentialPool>,
    cache: Arc<TokenFileCache>,
}

async fn harness(base_url: &str, credential: Value) -> Harness {
    let dir = std::env::temp_dir().join(format!(
        "viaduct-ds-e2e-{}-{}",
        std::process::id(),
        crate::utils::crypto::random_session_id()
    ));
    std::fs::create_dir_all(dir.join(PROJECT)).expect("create accounts dir");
    let cache = Arc::new(TokenFileCache::new(dir));
    cache
        .save_token(PROJECT, "acct.json", &credential)
        .await
        .expect("seed credential");

    let pool = Arc::new(CredentialPool::new());
    let config = DeepseekConfig {
        base_url: base_url.to_string(),
        pow_wasm_path: "/definitely/not/there.wasm".to_string(),
        ..DeepseekConfig::default()
    };
    let adapter = DeepseekAdapter::new(
        config,
        pool.clone(),
        cache.clone(),
        Arc::new(EgressProxy::new("", "", 60)),
    );
    adapter.sync_pool().await;
    Harness {
        adapter,
        pool,
        cache,
    }
}

fn request_for(model: &str) -> MiddleRequest {
    MiddleRequest {
        model: model.to_string(),
        messages: vec![MiddleMessage::text("user", "hi")],
        stream: true,
        ..MiddleRequest::default()
    }
}

fn config_key_auth() -> CallerAuth {
    CallerAuth {
        bearer: Some("k1".to_string()),
        is_config_key: true,
    }
}

#[tokio::test]
async fn password_login_writes_token_back_to_the_credential_file() {
    let mock = MockDeepseek {
        login_hits: Arc::new(AtomicUsize::new(0)),
        session_hits: Arc::new(AtomicUsize::new(0)),
        pow_algorithm: "DeepSeekHashV1",
    };
    let base = start_mock_deepseek(mock.clone()).await;
    let h = harness(
        &base,
        json!({"type": "password", "email": "a@b.com", "password": "pw"}),
    )
    .await;

    // The request dies at the missing solver artifact, but login and
    // session creation have already happened by then.
    let err = h
        .adapter
        .handle(&config_key_auth(), request_for("deepseek-chat"))
        .await
        .expect_err("pow must fail without the wasm artifact");
    assert!(matches!(err, ProviderError::Pow(_)));
    assert_eq!(mock.login_hits.load(Ordering::SeqCst), 1);
    assert_eq!(mock.session_hits.load(Ordering::SeqCst), 1);

    let stored = h
        .cache
        .get_token(PROJECT, "acct.json")
        .await
        .expect("credential readable");
    assert_eq!(stored["token"], "tok-from-login");
}

#[tokio::test]
async fn pow_failure_releases_without_benching_the_credential() {
    let mock = MockDeepseek {
        login_hits: Arc::new(AtomicUsize::new(0)),
        session_hits: Arc::new(AtomicUsize::new(0)),
        pow_algorithm: "DeepSeekHashV1",
    };
    let base = start_mock_deepseek(mock).await;
    let h = harness(&base, json!({"type": "session", "token": "tok-1"})).await;

    let err = h
        .adapter
        .handle(&config_key_auth(), request_for("deepseek-chat"))
        .await
        .expect_err("pow must fail");
    assert!(matches!(err, ProviderError::Pow(_)));

    // The lease was released and no skip window was set: the credential
    // is immediately acquirable again.
    assert!(!h.pool.is_in_use("acct.json"));
    assert_eq!(h.pool.acquire("deepseek-chat"), Some("acct.json".to_string()));
}

#[tokio::test]
async fn unsupported_pow_algorithm_is_rejected() {
    let mock = MockDeepseek {
        login_hits: Arc::new(AtomicUsize::new(0)),
        session_hits: Arc::new(AtomicUsize::new(0)),
        pow_algorithm: "SomeOtherHashV2",
    };
    let base = start_mock_deepseek(mock).await;
    let h = harness(&base, json!({"type": "session", "token": "tok-1"})).await;

    let err = h
        .adapter
        .handle(&config_key_auth(), request_for("deepseek-reasoner"))
        .await
        .expect_err("algorithm mismatch must fail");
    match err {
        ProviderError::Pow(message) => assert!(message.contains("SomeOtherHashV2")),
        other => panic!("unexpected error: {:?}", other.to_string()),
    }
}

#[tokio::test]
async fn empty_pool_is_a_no_account_error() {
    let mock = MockDeepseek {
        login_hits: Arc::new(AtomicUsize::new(0)),
        session_hits: Arc::new(AtomicUsize::new(0)),
        pow_algorithm: "DeepSeekHashV1",
    };
    let base = start_mock_deepseek(mock).await;
    let dir = std::env::temp_dir().join(format!(
        "viaduct-ds-empty-{}",
        crate::utils::crypto::random_session_id()
    ));
    std::fs::create_dir_all(dir.join(PROJECT)).expect("create accounts dir");
    let adapter = DeepseekAdapter::new(
        DeepseekConfig {
            base_url: base,
            ..DeepseekConfig::default()
        },
        Arc::new(CredentialPool::new()),
        Arc::new(TokenFileCache::new(dir)),
        Arc::new(EgressProxy::new("", "", 60)),
    );
    adapter.sync_pool().await;

    let err = adapter
        .handle(&config_key_auth(), request_for("deepseek-chat"))
        .await
        .expect_err("no credentials available");
    match err {
        ProviderError::NoAccount { status } => assert_eq!(status, 429),
        other => panic!("unexpected error: {:?}", other.to_string()),
    }
}

#[tokio::test]
async fn direct_bearer_skips_the_pool() {
    let mock = MockDeepseek {
        login_hits: Arc::new(AtomicUsize::new(0)),
        session_hits: Arc::new(AtomicUsize::new(0)),
        pow_algorithm: "DeepSeekHashV1",
    };
    let base = start_mock_deepseek(mock.clone()).await;
    // No credential files at all; the caller brings their own token.
    let dir = std::env::temp_dir().join(format!(
        "viaduct-ds-direct-{}",
        crate::utils::crypto::random_session_id()
    ));
    std::fs::create_dir_all(dir.join(PROJECT)).expect("create accounts dir");
    let adapter = DeepseekAdapter::new(
        DeepseekConfig {
            base_url: base,
            pow_wasm_path: "/definitely/not/there.wasm".to_string(),
            ..DeepseekConfig::default()
        },
        Arc::new(CredentialPool::new()),
        Arc::new(TokenFileCache::new(dir)),
        Arc::new(EgressProxy::new("", "", 60)),
    );

    let auth = CallerAuth {
        bearer: Some("raw-deepseek-token".to_string()),
        is_config_key: false,
    };
    let err = adapter
        .handle(&auth, request_for("deepseek-chat"))
        .await
        .expect_err("pow still fails, but the session leg must have run");
    assert!(matches!(err, ProviderError::Pow(_)));
    assert_eq!(mock.session_hits.load(Ordering::SeqCst), 1);
    assert_eq!(mock.login_hits.load(Ordering::SeqCst), 0);
}
