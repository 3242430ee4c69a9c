//! Transforms the DeepSeek completion SSE into OpenAI chunk frames.
//!
//! Upstream emits `data: {"p": <path>, "v": <value>}` lines. Thinking and
//! content paths become deltas; an array value containing a FINISHED status
//! closes the stream with a usage block and `data: [DONE]`.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;

use crate::proxy::mappers::openai::{usage_value, ChunkBuilder};
use crate::proxy::pool::Lease;
use crate::proxy::providers::SseByteStream;
use crate::utils::estimator;

const KEEP_ALIVE_SECS: u64 = 5;

pub struct StreamOptions {
    pub model: String,
    pub prompt: String,
    pub thinking_enabled: bool,
    pub search_enabled: bool,
}

enum Parsed {
    Content(String),
    Reasoning(String),
    Finished,
    Ignore,
}

fn parse_event(data: &str) -> Parsed {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return Parsed::Ignore;
    };

    // A v-array carrying {"p":"status","v":"FINISHED"} terminates the
    // response regardless of path.
    if let Some(items) = event.get("v").and_then(|v| v.as_array()) {
        let finished = items.iter().any(|item| {
            item.get("p").and_then(|p| p.as_str()) == Some("status")
                && item.get("v").and_then(|v| v.as_str()) == Some("FINISHED")
        });
        if finished {
            return Parsed::Finished;
        }
        return Parsed::Ignore;
    }

    let path = event.get("p").and_then(|p| p.as_str());
    let value = event.get("v").and_then(|v| v.as_str());
    match (path, value) {
        (Some("response/thinking_content"), Some(text)) => Parsed::Reasoning(text.to_string()),
        (Some("response/content"), Some(text)) | (None, Some(text)) => {
            Parsed::Content(text.to_string())
        }
        (Some("response/search_status"), _) => Parsed::Ignore,
        _ => Parsed::Ignore,
    }
}

/// Wraps the upstream byte stream. The credential lease (when pooled) is
/// owned by the returned stream: client disconnects drop it and the pool
/// slot frees immediately.
pub fn transform(
    mut upstream: std::pin::Pin<Box<dyn futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    options: StreamOptions,
    lease: Option<Lease>,
) -> SseByteStream {
    let stream = async_stream::stream! {
        let _lease = lease;
        let builder = ChunkBuilder::new(&options.model);
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
                            tracing::warn!("[DeepSeek] Completion stream error: {}", e);
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
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        let data = data.trim();
                        if data == "[DONE]" {
                            break 'outer;
                        }

                        match parse_event(data) {
                            Parsed::Content(text) => {
                                if text.is_empty() { continue; }
                                if options.search_enabled && text.starts_with("[citation:") {
                                    continue;
                                }
                                if !role_sent {
                                    role_sent = true;
                                    yield Ok(builder.role_frame());
                                }
                                accumulated.push_str(&text);
                                yield Ok(builder.content_frame(&text));
                            }
                            Parsed::Reasoning(text) => {
                                if !options.thinking_enabled || text.is_empty() { continue; }
                                if !role_sent {
                                    role_sent = true;
                                    yield Ok(builder.role_frame());
                                }
                                accumulated.push_str(&text);
                                yield Ok(builder.reasoning_frame(&text));
                            }
                            Parsed::Finished => {
                                finished = true;
                                break 'outer;
                            }
                            Parsed::Ignore => {}
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    yield Ok::<Bytes, String>(ChunkBuilder::keep_alive_frame());
                }
            }
        }

        if finished {
            if let Some(lease) = _lease.as_ref() {
                lease.clear_skip();
            }
            if !role_sent {
                yield Ok(builder.role_frame());
            }
            let usage = usage_value(
                estimator::estimate_text(&options.prompt),
                estimator::estimate_text(&accumulated),
            );
            yield Ok(builder.finish_frame("stop", Some(usage)));
            yield Ok(ChunkBuilder::done_frame());
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn run_transform(
        frames: Vec<&'static str>,
        thinking: bool,
        search: bool,
        prompt: &str,
    ) -> Vec<Value> {
        let upstream = stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<Bytes, reqwest::Error>(Bytes::from_static(f.as_bytes())))
                .collect::<Vec<_>>(),
        );
        let options = StreamOptions {
            model: "deepseek-chat".to_string(),
            prompt: prompt.to_string(),
            thinking_enabled: thinking,
            search_enabled: search,
        };
        let out = transform(Box::pin(upstream), options, None);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let frames: Vec<_> = out.collect::<Vec<_>>().await;
            frames
                .into_iter()
                .map(|r| r.expect("frame"))
                .filter_map(|bytes| {
                    let text = String::from_utf8(bytes.to_vec()).ok()?;
                    let data = text.strip_prefix("data: ")?.trim().to_string();
                    if data == "[DONE]" {
                        return Some(Value::String("[DONE]".to_string()));
                    }
                    serde_json::from_str(&data).ok()
                })
                .collect()
        })
    }

    #[test]
    fn scenario_hello_finished() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/content\",\"v\":\"Hello\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            false,
            "hi",
        );
        // role, content, finish, [DONE]
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[2]["usage"]["prompt_tokens"], 1);
        assert_eq!(chunks[2]["usage"]["completion_tokens"], 2);
        assert_eq!(chunks[3], Value::String("[DONE]".to_string()));
    }

    #[test]
    fn role_frame_is_emitted_exactly_once() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/content\",\"v\":\"a\"}\n\n",
                "data: {\"p\":\"response/content\",\"v\":\"b\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            false,
            "x",
        );
        let role_frames = chunks
            .iter()
            .filter(|c| c["choices"][0]["delta"]["role"] == "assistant")
            .count();
        assert_eq!(role_frames, 1);
    }

    #[test]
    fn thinking_content_is_dropped_when_disabled() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/thinking_content\",\"v\":\"mull\"}\n\n",
                "data: {\"p\":\"response/content\",\"v\":\"out\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            false,
            "x",
        );
        assert!(chunks
            .iter()
            .all(|c| c["choices"][0]["delta"].get("reasoning_content").is_none()));
    }

    #[test]
    fn thinking_content_streams_as_reasoning_when_enabled() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/thinking_content\",\"v\":\"mull\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            true,
            false,
            "x",
        );
        assert!(chunks
            .iter()
            .any(|c| c["choices"][0]["delta"]["reasoning_content"] == "mull"));
    }

    #[test]
    fn citations_are_dropped_in_search_mode() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/content\",\"v\":\"[citation:3]\"}\n\n",
                "data: {\"p\":\"response/content\",\"v\":\"real\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            true,
            "x",
        );
        assert!(chunks
            .iter()
            .all(|c| c["choices"][0]["delta"]["content"] != "[citation:3]"));
        assert!(chunks
            .iter()
            .any(|c| c["choices"][0]["delta"]["content"] == "real"));
    }

    #[test]
    fn search_status_events_are_ignored() {
        let chunks = run_transform(
            vec![
                "data: {\"p\":\"response/search_status\",\"v\":\"searching\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            true,
            "x",
        );
        // Only role + finish + DONE; no content frames.
        assert!(chunks
            .iter()
            .all(|c| c["choices"][0]["delta"].get("content").map(|v| v == "") != Some(false)));
    }

    #[test]
    fn pathless_value_counts_as_content() {
        let chunks = run_transform(
            vec![
                "data: {\"v\":\"plain\"}\n\n",
                "data: {\"v\":[{\"p\":\"status\",\"v\":\"FINISHED\"}]}\n\n",
            ],
            false,
            false,
            "x",
        );
        assert!(chunks
            .iter()
            .any(|c| c["choices"][0]["delta"]["content"] == "plain"));
    }
}
