//! DeepSeek provider adapter: credential selection and login, chat session
//! creation, proof-of-work, and the completion SSE transform.

mod pow;
mod prompt;
mod stream;

pub use pow::{pow_response_header, PowChallenge, PowSolver, POW_ALGORITHM};
pub use prompt::build_prompt;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{json, Value};

use crate::models::DeepseekConfig;
use crate::proxy::egress::EgressProxy;
use crate::proxy::mappers::middle::MiddleRequest;
use crate::proxy::pool::{CredentialPool, Lease, DEFAULT_SKIP_MS};
use crate::proxy::providers::{CallerAuth, ProviderAdapter, ProviderError, ProviderStream};
use crate::proxy::token_store::TokenFileCache;

pub const PROJECT: &str = "deepseek";
pub const MODELS: [&str; 4] = [
    "deepseek-chat",
    "deepseek-reasoner",
    "deepseek-chat-search",
    "deepseek-reasoner-search",
];

const SESSION_CREATE_RETRIES: usize = 3;

static MOBILE_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"^1[3-9]\d{9}$").expect("mobile regex"));

/// thinking/search switches derived from the public model id.
fn model_flags(model: &str) -> Option<(bool, bool)> {
    match model {
        "deepseek-chat" => Some((false, false)),
        "deepseek-reasoner" => Some((true, false)),
        "deepseek-chat-search" => Some((false, true)),
        "deepseek-reasoner-search" => Some((true, true)),
        _ => None,
    }
}

fn credential_proxy(credential: &Value) -> Option<&str> {
    credential
        .get("proxy_url")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
}

pub struct DeepseekAdapter {
    config: DeepseekConfig,
    pool: Arc<CredentialPool>,
    cache: Arc<TokenFileCache>,
    egress: Arc<EgressProxy>,
    solver: OnceCell<Arc<PowSolver>>,
}

impl DeepseekAdapter {
    pub fn new(
        config: DeepseekConfig,
        pool: Arc<CredentialPool>,
        cache: Arc<TokenFileCache>,
        egress: Arc<EgressProxy>,
    ) -> Self {
        Self {
            config,
            pool,
            cache,
            egress,
            solver: OnceCell::new(),
        }
    }

    /// Registers every known credential file against all DeepSeek models.
    pub async fn sync_pool(&self) {
        let files = self.cache.get_token_list(PROJECT).await;
        let models: Vec<String> = MODELS.iter().map(|m| m.to_string()).collect();
        self.pool.register(&models, &files, PROJECT);
    }

    fn solver(&self) -> Result<Arc<PowSolver>, ProviderError> {
        self.solver
            .get_or_try_init(|| {
                PowSolver::load(std::path::Path::new(&self.config.pow_wasm_path))
                    .map(Arc::new)
                    .map_err(|e| ProviderError::Pow(e.to_string()))
            })
            .cloned()
    }

    async fn client(&self, credential_proxy: Option<&str>) -> Result<reqwest::Client, ProviderError> {
        self.egress
            .client_for(credential_proxy, Duration::from_secs(600))
            .await
            .map_err(ProviderError::Internal)
    }

    /// Username/password login; writes the returned token back into the
    /// credential file.
    async fn login(&self, filename: &str, credential: &Value) -> Result<String, ProviderError> {
        let password = credential
            .get("password")
            .and_then(|p| p.as_str())
            .ok_or_else(|| {
                ProviderError::Internal(format!("credential {} has no password", filename))
            })?;

        let device_id = credential
            .get("device_id")
            .and_then(|d| d.as_str())
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.config.device_id);
        let mut body = json!({
            "password": password,
            "device_id": device_id,
            "os": "android",
        });
        if let Some(email) = credential.get("email").and_then(|e| e.as_str()) {
            body["email"] = json!(email);
        } else if let Some(mobile) = credential.get("mobile").and_then(|m| m.as_str()) {
            if !MOBILE_RE.is_match(mobile) {
                return Err(ProviderError::Internal(format!(
                    "credential {} has an invalid mobile number",
                    filename
                )));
            }
            body["mobile"] = json!(mobile);
        } else {
            return Err(ProviderError::Internal(format!(
                "credential {} has neither email nor mobile",
                filename
            )));
        }

        let client = self.client(credential_proxy(credential)).await?;
        let resp = client
            .post(format!("{}/api/v0/users/login", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Internal(format!("login request failed: {}", e)))?;
        let status = resp.status().as_u16();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("login response unreadable: {}", e)))?;
        let token = payload
            .pointer("/data/biz_data/user/token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ProviderError::Upstream {
                status,
                message: format!(
                    "login rejected: {}",
                    payload.get("msg").and_then(|m| m.as_str()).unwrap_or("no token in response")
                ),
            })?
            .to_string();

        let mut updated = credential.clone();
        updated["token"] = json!(token);
        self.cache
            .save_token(PROJECT, filename, &updated)
            .await
            .map_err(|e| ProviderError::Internal(format!("token write-back failed: {}", e)))?;
        tracing::info!("[DeepSeek] Logged in and stored token for {}", filename);
        Ok(token)
    }

    /// Resolves a pooled credential to a usable bearer token plus its
    /// egress proxy override, logging in when the file carries no token.
    async fn token_for(&self, filename: &str) -> Result<(String, Option<String>), ProviderError> {
        let credential = self
            .cache
            .get_token(PROJECT, filename)
            .await
            .ok_or_else(|| {
                ProviderError::Internal(format!("credential file {} disappeared", filename))
            })?;
        let proxy = credential_proxy(&credential).map(|p| p.to_string());
        if let Some(token) = credential.get("token").and_then(|t| t.as_str()) {
            if !token.is_empty() {
                return Ok((token.to_string(), proxy));
            }
        }
        if credential.get("type").and_then(|t| t.as_str()) == Some("password") {
            return Ok((self.login(filename, &credential).await?, proxy));
        }
        Err(ProviderError::Internal(format!(
            "credential {} has no token and no password login",
            filename
        )))
    }

    async fn create_session(&self, token: &str, proxy: Option<&str>) -> Result<String, ProviderError> {
        let client = self.client(proxy).await?;
        let url = format!("{}/api/v0/chat_session/create", self.config.base_url);
        let mut last_message = String::new();

        for attempt in 0..SESSION_CREATE_RETRIES {
            let resp = client
                .post(&url)
                .bearer_auth(token)
                .json(&json!({"agent": "chat"}))
                .send()
                .await
                .map_err(|e| ProviderError::Internal(format!("session create failed: {}", e)))?;
            let status = resp.status().as_u16();
            let payload: Value = resp.json().await.unwrap_or_default();
            let code = payload.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
            if code == 0 {
                if let Some(id) = payload.pointer("/data/biz_data/id").and_then(|v| v.as_str()) {
                    return Ok(id.to_string());
                }
            }
            last_message = format!(
                "session create attempt {}/{} failed (status {}, code {})",
                attempt + 1,
                SESSION_CREATE_RETRIES,
                status,
                code
            );
            tracing::warn!("[DeepSeek] {}", last_message);
        }
        Err(ProviderError::Upstream {
            status: 500,
            message: last_message,
        })
    }

    async fn solve_pow(&self, token: &str, proxy: Option<&str>) -> Result<String, ProviderError> {
        let client = self.client(proxy).await?;
        let resp = client
            .post(format!(
                "{}/api/v0/chat/create_pow_challenge",
                self.config.base_url
            ))
            .bearer_auth(token)
            .json(&json!({"target_path": "/api/v0/chat/completion"}))
            .send()
            .await
            .map_err(|e| ProviderError::Internal(format!("pow challenge failed: {}", e)))?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("pow response unreadable: {}", e)))?;
        let challenge_value = payload
            .pointer("/data/biz_data/challenge")
            .cloned()
            .unwrap_or(payload);
        let challenge: PowChallenge = serde_json::from_value(challenge_value)
            .map_err(|e| ProviderError::Pow(format!("malformed pow challenge: {}", e)))?;

        if challenge.algorithm != POW_ALGORITHM {
            return Err(ProviderError::Pow(format!(
                "unsupported pow algorithm '{}'",
                challenge.algorithm
            )));
        }

        let solver = self.solver()?;
        let prefix = challenge.prefix();
        let challenge_text = challenge.challenge.clone();
        let difficulty = challenge.difficulty;
        // CPU-bound but short; keep it off the reactor threads.
        let answer = tokio::task::spawn_blocking(move || {
            solver.solve(&challenge_text, &prefix, difficulty)
        })
        .await
        .map_err(|e| ProviderError::Pow(format!("pow task panicked: {}", e)))?
        .map_err(|e| ProviderError::Pow(e.to_string()))?
        .ok_or_else(|| ProviderError::Pow("solver returned no answer".to_string()))?;

        Ok(pow_response_header(&challenge, answer))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_completion(
        &self,
        token: &str,
        proxy: Option<&str>,
        pow_header: &str,
        session_id: &str,
        prompt: &str,
        thinking: bool,
        search: bool,
        model: &str,
        lease: Option<Lease>,
    ) -> Result<ProviderStream, ProviderError> {
        let client = self.client(proxy).await?;
        let resp = client
            .post(format!("{}/api/v0/chat/completion", self.config.base_url))
            .bearer_auth(token)
            .header("x-ds-pow-response", pow_header)
            .json(&json!({
                "chat_session_id": session_id,
                "parent_message_id": null,
                "prompt": prompt,
                "ref_file_ids": [],
                "thinking_enabled": thinking,
                "search_enabled": search,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::Internal(format!("completion request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            // Bench the credential briefly; the lease itself releases on drop.
            if let Some(lease) = &lease {
                lease.skip(DEFAULT_SKIP_MS);
            }
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                message: format!("completion rejected: {}", message),
            });
        }

        let options = stream::StreamOptions {
            model: model.to_string(),
            prompt: prompt.to_string(),
            thinking_enabled: thinking,
            search_enabled: search,
        };
        Ok(ProviderStream {
            stream: stream::transform(Box::pin(resp.bytes_stream()), options, lease),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for DeepseekAdapter {
    fn name(&self) -> &'static str {
        PROJECT
    }

    fn models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    async fn handle(
        &self,
        auth: &CallerAuth,
        request: MiddleRequest,
    ) -> Result<ProviderStream, ProviderError> {
        let (thinking, search) = model_flags(&request.model)
            .ok_or_else(|| ProviderError::BadRequest(format!("unknown model {}", request.model)))?;
        if request.messages.is_empty() {
            return Err(ProviderError::BadRequest("messages must not be empty".into()));
        }
        let prompt = build_prompt(&request.messages);

        // A bearer that is not one of our configured keys is used directly
        // as a DeepSeek token; configured keys go through the pool.
        if !auth.is_config_key {
            let token = auth
                .bearer
                .clone()
                .ok_or_else(|| ProviderError::Unauthorized("missing bearer token".into()))?;
            let session_id = self.create_session(&token, None).await?;
            let pow = self.solve_pow(&token, None).await?;
            return self
                .run_completion(
                    &token, None, &pow, &session_id, &prompt, thinking, search, &request.model,
                    None,
                )
                .await;
        }

        let mut tried: HashSet<String> = HashSet::new();
        loop {
            let Some(credential_id) = self.pool.acquire_excluding(&request.model, &tried) else {
                return Err(ProviderError::NoAccount { status: 429 });
            };
            let lease = Lease::new(self.pool.clone(), &request.model, credential_id.clone());
            tried.insert(credential_id.clone());

            let (token, proxy) = match self.token_for(&credential_id).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!("[DeepSeek] Credential {} unusable: {}", credential_id, e);
                    lease.skip(DEFAULT_SKIP_MS);
                    // Lease drops here, releasing the slot before the next pick.
                    continue;
                }
            };

            let session_id = match self.create_session(&token, proxy.as_deref()).await {
                Ok(id) => id,
                Err(e) => {
                    lease.skip(DEFAULT_SKIP_MS);
                    return Err(e);
                }
            };
            // PoW failures do not mark the credential bad.
            let pow = self.solve_pow(&token, proxy.as_deref()).await?;
            return self
                .run_completion(
                    &token,
                    proxy.as_deref(),
                    &pow,
                    &session_id,
                    &prompt,
                    thinking,
                    search,
                    &request.model,
                    Some(lease),
                )
                .await;
        }
    }
}
