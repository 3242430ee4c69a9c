//! Transforms the Grok conversation NDJSON into OpenAI chunk frames.
//!
//! Text models stream `result.response.token` fragments; image generation
//! ends with `modelResponse.generatedImageUrls`; video generation ends with
//! `streamingVideoGenerationResponse.videoUrl`. Generated media flows
//! through the local media cache (or inline base64, per config).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::proxy::mappers::openai::{usage_value, ChunkBuilder};
use crate::proxy::media_cache::MediaCache;
use crate::proxy::providers::SseByteStream;
use crate::utils::estimator;

const KEEP_ALIVE_SECS: u64 = 5;

/// Invoked exactly once when a stream completes normally; used for success
/// accounting and the follow-up rate-limit poll.
pub type CompletionHook = Box<dyn FnOnce() + Send>;

pub struct GrokStreamContext {
    pub model: String,
    pub prompt_tokens: u32,
    pub filtered_tags: Vec<String>,
    pub show_thinking: bool,
    pub image_as_base64: bool,
    pub image_cache: Arc<MediaCache>,
    pub video_cache: Arc<MediaCache>,
    pub cookie: String,
    pub media_headers: HeaderMap,
    pub on_complete: Option<CompletionHook>,
}

fn strip_assets_base(url: &str) -> String {
    url.trim_start_matches(crate::constants::GROK_ASSETS_BASE_URL)
        .trim_start_matches('/')
        .to_string()
}

fn contains_filtered_tag(fragment: &str, tags: &[String]) -> bool {
    tags.iter().any(|tag| !tag.is_empty() && fragment.contains(tag.as_str()))
}

pub fn transform(
    mut upstream: std::pin::Pin<Box<dyn futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    mut ctx: GrokStreamContext,
) -> SseByteStream {
    let stream = async_stream::stream! {
        let builder = ChunkBuilder::new(&ctx.model);
        let mut buffer = BytesMut::new();
        let mut role_sent = false;
        let mut accumulated = String::new();
        let mut finished = false;

        let mut keep_alive = tokio::time::interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS));
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.reset();

        'outer: loop {
            tokio::select! {
                item = upstream.next() => {
                    let Some(item) = item else { break 'outer };
                    let bytes = match item {
                        Ok(b) => b,
                        Err(e) => {
                            tracing::warn!("[Grok] Conversation stream error: {}", e);
                            break 'outer;
                        }
                    };
                    keep_alive.reset();
                    buffer.extend_from_slice(&bytes);

                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line_str) = std::str::from_utf8(&line_raw) else { continue };
                        let line = line_str.trim();
                        if line.is_empty() { continue; }
                        let Ok(event) = serde_json::from_str::<Value>(line) else { continue };
                        let Some(response) = event.pointer("/result/response") else { continue };

                        // Video generation: one terminal URL.
                        if let Some(video_url) = response
                            .pointer("/streamingVideoGenerationResponse/videoUrl")
                            .and_then(|v| v.as_str())
                        {
                            let asset = strip_assets_base(video_url);
                            let html = match ctx
                                .video_cache
                                .get(&asset, &ctx.cookie, ctx.media_headers.clone())
                                .await
                            {
                                Ok(_) => format!(
                                    "<video src=\"{}\" controls width=500 height=300></video>",
                                    ctx.video_cache.public_url(&asset)
                                ),
                                Err(e) => {
                                    tracing::warn!("[Grok] Video download failed: {}", e);
                                    format!(
                                        "<video src=\"{}/{}\" controls width=500 height=300></video>",
                                        crate::constants::GROK_ASSETS_BASE_URL, asset
                                    )
                                }
                            };
                            if !role_sent {
                                role_sent = true;
                                yield Ok(builder.role_frame());
                            }
                            accumulated.push_str(&html);
                            yield Ok(builder.content_frame(&html));
                            finished = true;
                            break 'outer;
                        }

                        // Image generation: terminal URL list.
                        if let Some(urls) = response
                            .pointer("/modelResponse/generatedImageUrls")
                            .and_then(|v| v.as_array())
                        {
                            if !role_sent {
                                role_sent = true;
                                yield Ok(builder.role_frame());
                            }
                            for url in urls.iter().filter_map(|u| u.as_str()) {
                                let asset = strip_assets_base(url);
                                let rendered = if ctx.image_as_base64 {
                                    match ctx
                                        .image_cache
                                        .get_as_base64(&asset, &ctx.cookie, ctx.media_headers.clone())
                                        .await
                                    {
                                        Ok(data_url) => format!("![Generated Image]({})", data_url),
                                        Err(e) => {
                                            tracing::warn!("[Grok] Image download failed: {}", e);
                                            continue;
                                        }
                                    }
                                } else {
                                    match ctx
                                        .image_cache
                                        .get(&asset, &ctx.cookie, ctx.media_headers.clone())
                                        .await
                                    {
                                        Ok(_) => format!(
                                            "![Generated Image]({})",
                                            ctx.image_cache.public_url(&asset)
                                        ),
                                        Err(e) => {
                                            tracing::warn!("[Grok] Image download failed: {}", e);
                                            continue;
                                        }
                                    }
                                };
                                accumulated.push_str(&rendered);
                                yield Ok(builder.content_frame(&rendered));
                            }
                            finished = true;
                            break 'outer;
                        }

                        // Token fragments. Array-valued tokens are ignored.
                        let Some(token) = response.get("token") else { continue };
                        let Some(fragment) = token.as_str() else { continue };
                        if fragment.is_empty() { continue; }
                        if contains_filtered_tag(fragment, &ctx.filtered_tags) { continue; }

                        let is_thinking = response
                            .get("isThinking")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        if is_thinking && !ctx.show_thinking { continue; }

                        if !role_sent {
                            role_sent = true;
                            yield Ok(builder.role_frame());
                        }
                        accumulated.push_str(fragment);
                        if is_thinking {
                            yield Ok(builder.reasoning_frame(fragment));
                        } else {
                            yield Ok(builder.content_frame(fragment));
                        }

                        if response
                            .pointer("/modelResponse/message")
                            .is_some()
                        {
                            finished = true;
                            break 'outer;
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    yield Ok::<Bytes, String>(ChunkBuilder::keep_alive_frame());
                }
            }
        }

        // Upstream closing without an explicit terminal marker still ends
        // the response normally.
        if role_sent || finished {
            let usage = usage_value(ctx.prompt_tokens, estimator::estimate_text(&accumulated));
            yield Ok(builder.finish_frame("stop", Some(usage)));
            yield Ok(ChunkBuilder::done_frame());
            if let Some(hook) = ctx.on_complete.take() {
                hook();
            }
        }
    };
    Box::pin(stream)
}
