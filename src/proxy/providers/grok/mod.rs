//! Grok provider adapter: quota-ranked SSO token selection, fingerprinted
//! requests with proxy rotation on blocks, media handling, and the NDJSON
//! stream transform.

mod models;
mod ranking;
mod refresh;
mod statsig;
mod stream;

pub use models::{model_ids, GrokModel, HEAVY_RATE_LIMIT_MODEL, NORMAL_RATE_LIMIT_MODEL};
pub use ranking::rank_candidates;
pub use refresh::GrokRefresher;
pub use statsig::{build_headers, cookie_for, dynamic_statsig_id};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::GrokConfig;
use crate::proxy::egress::EgressProxy;
use crate::proxy::mappers::middle::{MiddleMessage, MiddleRequest};
use crate::proxy::media_cache::MediaCache;
use crate::proxy::providers::{CallerAuth, ProviderAdapter, ProviderError, ProviderStream};
use crate::proxy::token_store::GrokTokenStore;
use crate::utils::estimator;

const OUTER_RETRIES: usize = 3;
const BLOCK_RETRIES: usize = 5;

/// Shared low-level grok.com operations; used by the adapter, the stream
/// completion hook, and the background refresher.
pub struct GrokClient {
    pub config: GrokConfig,
    pub store: Arc<GrokTokenStore>,
    pub egress: Arc<EgressProxy>,
}

impl GrokClient {
    pub fn new(config: GrokConfig, store: Arc<GrokTokenStore>, egress: Arc<EgressProxy>) -> Self {
        Self {
            config,
            store,
            egress,
        }
    }

    /// POSTs a JSON payload with the shared retry policy: the configured
    /// retryable statuses get linear backoff, and every 403 rotates the
    /// egress proxy before retrying.
    async fn post(
        &self,
        path: &str,
        sso: &str,
        body: &Value,
        upload: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.config.base_url, path);
        let payload = body.to_string();

        for attempt in 0..OUTER_RETRIES {
            let mut block_retries = 0usize;
            let resp = loop {
                let client = self
                    .egress
                    .client_for(None, Duration::from_secs(600))
                    .await
                    .map_err(ProviderError::Internal)?;
                let resp = client
                    .post(&url)
                    .headers(build_headers(&self.config, sso, upload))
                    .body(payload.clone())
                    .send()
                    .await
                    .map_err(|e| ProviderError::Internal(format!("grok request failed: {}", e)))?;

                if resp.status().as_u16() == 403 && block_retries < BLOCK_RETRIES {
                    block_retries += 1;
                    tracing::warn!(
                        "[Grok] 403 block on {}, rotating proxy (attempt {}/{})",
                        path,
                        block_retries,
                        BLOCK_RETRIES
                    );
                    self.egress.force_refresh().await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                break resp;
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            let status = status.as_u16();
            if self.config.retry_status_codes.contains(&status) && attempt + 1 < OUTER_RETRIES {
                let backoff = Duration::from_millis(((attempt + 1) as u64) * 100);
                tracing::warn!(
                    "[Grok] {} returned {}, retrying in {:?} ({}/{})",
                    path,
                    status,
                    backoff,
                    attempt + 1,
                    OUTER_RETRIES
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            let message = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream { status, message });
        }
        unreachable!("retry loop always returns");
    }

    /// Polls `/rest/rate-limits` and writes the observed quota back to the
    /// token store. Non-heavy reads `remainingTokens`, heavy reads
    /// `remainingQueries`.
    pub async fn poll_rate_limit(&self, sso: &str, rate_limit_model: &str, heavy: bool) {
        let body = json!({"requestKind": "DEFAULT", "modelName": rate_limit_model});
        match self.post("/rest/rate-limits", sso, &body, false).await {
            Ok(resp) => {
                let Ok(payload) = resp.json::<Value>().await else {
                    return;
                };
                let field = if heavy { "remainingQueries" } else { "remainingTokens" };
                if let Some(remaining) = payload.get(field).and_then(|v| v.as_i64()) {
                    if let Err(e) = self.store.update_limits(sso, heavy, remaining).await {
                        tracing::warn!("[Grok] Quota write-back failed: {}", e);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("[Grok] Rate-limit poll failed for {}: {}", rate_limit_model, e);
            }
        }
    }

    async fn upload_file(
        &self,
        sso: &str,
        file_name: &str,
        mime_type: &str,
        content_base64: &str,
    ) -> Result<(String, String), ProviderError> {
        let body = json!({
            "fileName": file_name,
            "fileMimeType": mime_type,
            "content": content_base64,
        });
        let resp = self
            .post("/rest/app-chat/upload-file", sso, &body, true)
            .await?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("upload response unreadable: {}", e)))?;
        let id = payload
            .get("fileMetadataId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::Internal("upload returned no fileMetadataId".into()))?;
        let uri = payload
            .get("fileUri")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok((id.to_string(), uri.to_string()))
    }

    async fn create_post(
        &self,
        sso: &str,
        file_id: &str,
        file_uri: &str,
    ) -> Result<String, ProviderError> {
        let body = json!({"fileId": file_id, "fileUri": file_uri});
        let resp = self
            .post("/rest/app-chat/create-post", sso, &body, false)
            .await?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("create-post response unreadable: {}", e)))?;
        if payload.get("success").and_then(|v| v.as_bool()) != Some(true) {
            return Err(ProviderError::Internal("create-post reported failure".into()));
        }
        Ok(payload
            .get("postId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Fixed conversation options; only `temporary`, model binding and the
/// attachment lists vary per request.
fn text_payload(
    config: &GrokConfig,
    model: &GrokModel,
    message: &str,
    file_attachments: Vec<String>,
    image_attachments: Vec<String>,
) -> Value {
    json!({
        "temporary": config.temporary,
        "modelName": model.grok_model,
        "message": message,
        "fileAttachments": file_attachments,
        "imageAttachments": image_attachments,
        "disableSearch": false,
        "enableImageGeneration": true,
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "enableImageStreaming": true,
        "imageGenerationCount": 2,
        "forceConcise": false,
        "toolOverrides": {},
        "enableSideBySide": true,
        "sendFinalMetadata": true,
        "isReasoning": false,
        "webpageUrls": [],
        "disableTextFollowUps": true,
        "responseMetadata": {"requestModelDetails": {"modelId": model.grok_model}},
        "disableMemory": false,
        "forceSideBySide": false,
        "modelMode": model.model_mode,
        "isAsyncChat": false,
    })
}

fn video_payload(file_id: &str, reference_url: &str, user_text: &str) -> Value {
    json!({
        "temporary": true,
        "modelName": "grok-3",
        "message": format!("{}  {} --mode=custom", reference_url, user_text),
        "fileAttachments": [file_id],
        "toolOverrides": {"videoGen": true},
    })
}

/// Role-prefixed flattening of the normalized conversation.
fn format_messages(messages: &[MiddleMessage]) -> String {
    messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn last_user_text(messages: &[MiddleMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.content.is_empty())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn inline_images(messages: &[MiddleMessage]) -> Vec<(String, String)> {
    let mut images = Vec::new();
    for msg in messages {
        let Some(calls) = &msg.tool_calls else { continue };
        for call in calls {
            if let Some(inline) = call.as_inline_data() {
                images.push((inline.mime_type.clone(), inline.data.clone()));
            }
        }
    }
    images
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

pub struct GrokAdapter {
    client: Arc<GrokClient>,
    image_cache: Arc<MediaCache>,
    video_cache: Arc<MediaCache>,
}

impl GrokAdapter {
    pub fn new(
        client: Arc<GrokClient>,
        image_cache: Arc<MediaCache>,
        video_cache: Arc<MediaCache>,
    ) -> Self {
        Self {
            client,
            image_cache,
            video_cache,
        }
    }

    fn completion_hook(&self, sso: String, rate_limit_model: &'static str, heavy: bool) -> stream::CompletionHook {
        let client = self.client.clone();
        Box::new(move || {
            tokio::spawn(async move {
                if let Err(e) = client.store.record_success(&sso).await {
                    tracing::warn!("[Grok] Success accounting failed: {}", e);
                }
                client.poll_rate_limit(&sso, rate_limit_model, heavy).await;
            });
        })
    }

    async fn attempt(
        &self,
        model: &'static GrokModel,
        sso: &str,
        request: &MiddleRequest,
        images: &[(String, String)],
    ) -> Result<reqwest::Response, ProviderError> {
        let payload = if model.media && !images.is_empty() {
            // Image-to-video: upload the reference image, anchor it with a
            // post, then drive the videoGen tool.
            let (mime, data) = &images[0];
            let file_name = format!("reference.{}", extension_for(mime));
            let (file_id, file_uri) = self
                .client
                .upload_file(sso, &file_name, mime, data)
                .await?;
            self.client.create_post(sso, &file_id, &file_uri).await?;
            video_payload(&file_id, &file_uri, &last_user_text(&request.messages))
        } else {
            let mut image_attachments = Vec::new();
            for (idx, (mime, data)) in images.iter().enumerate() {
                let file_name = format!("attachment-{}.{}", idx, extension_for(mime));
                let (file_id, _) = self
                    .client
                    .upload_file(sso, &file_name, mime, data)
                    .await?;
                image_attachments.push(file_id);
            }
            text_payload(
                &self.client.config,
                model,
                &format_messages(&request.messages),
                Vec::new(),
                image_attachments,
            )
        };

        self.client
            .post("/rest/app-chat/conversations/new", sso, &payload, false)
            .await
    }
}

#[async_trait]
impl ProviderAdapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn models(&self) -> Vec<String> {
        model_ids()
    }

    async fn handle(
        &self,
        auth: &CallerAuth,
        request: MiddleRequest,
    ) -> Result<ProviderStream, ProviderError> {
        if !auth.is_config_key {
            return Err(ProviderError::Unauthorized(
                "grok models require a configured API key".into(),
            ));
        }
        let model = models::find(&request.model)
            .ok_or_else(|| ProviderError::BadRequest(format!("unknown model {}", request.model)))?;
        if request.messages.is_empty() {
            return Err(ProviderError::BadRequest("messages must not be empty".into()));
        }

        let heavy = models::is_heavy(&request.model);
        let file = self.client.store.load().await;
        let candidates = rank_candidates(&file, heavy);
        if candidates.is_empty() {
            return Err(ProviderError::NoAccount { status: 503 });
        }

        let images = inline_images(&request.messages);
        let prompt_tokens = estimator::estimate_messages(&request.messages);
        let mut last_error: Option<ProviderError> = None;

        for candidate in candidates {
            let sso = candidate.sso.clone();
            match self.attempt(model, &sso, &request, &images).await {
                Ok(resp) => {
                    let rate_limit_model: &'static str = model.rate_limit_model;
                    let ctx = stream::GrokStreamContext {
                        model: request.model.clone(),
                        prompt_tokens,
                        filtered_tags: self
                            .client
                            .config
                            .filtered_tags
                            .split(',')
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect(),
                        show_thinking: self.client.config.show_thinking,
                        image_as_base64: self.client.config.image_mode == "base64",
                        image_cache: self.image_cache.clone(),
                        video_cache: self.video_cache.clone(),
                        cookie: cookie_for(&sso),
                        media_headers: build_headers(&self.client.config, &sso, false),
                        on_complete: Some(self.completion_hook(sso, rate_limit_model, heavy)),
                    };
                    return Ok(ProviderStream {
                        stream: stream::transform(Box::pin(resp.bytes_stream()), ctx),
                        model: request.model.clone(),
                    });
                }
                Err(ProviderError::Upstream { status, message }) => {
                    tracing::warn!(
                        "[Grok] Token failed with {} on {}: {}",
                        status,
                        request.model,
                        message
                    );
                    if let Err(e) = self.client.store.record_failure(&sso, status, &message).await {
                        tracing::warn!("[Grok] Failure accounting failed: {}", e);
                    }
                    last_error = Some(ProviderError::Upstream { status, message });
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error.unwrap_or(ProviderError::NoAccount { status: 503 }))
    }
}
