//! Anthropic messages protocol: request normalization, non-stream response
//! conversion, and the OpenAI-SSE to Anthropic-SSE rewrap.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::middle::{MiddleMessage, MiddleRequest, MiddleToolCall};
use crate::proxy::providers::SseByteStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ClaudeMessage>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: Value,
}

/// System prompt: either a plain string or an array of text blocks joined
/// with `\n`.
fn flatten_system(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| {
                    if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                        b.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

pub fn to_middle(req: &ClaudeRequest) -> MiddleRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system.as_ref().and_then(flatten_system) {
        messages.push(MiddleMessage::text("system", system));
    }

    for msg in &req.messages {
        match &msg.content {
            Value::String(s) => messages.push(MiddleMessage::text(&msg.role, s.clone())),
            Value::Array(blocks) => {
                let mut text_parts: Vec<String> = Vec::new();
                let mut tool_calls: Vec<MiddleToolCall> = Vec::new();
                let mut has_tool_use = false;

                for block in blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("image") => {
                            // Base64 image sources travel as inline data.
                            let Some(source) = block.get("source") else { continue };
                            if source.get("type").and_then(|t| t.as_str()) != Some("base64") {
                                continue;
                            }
                            let mime = source
                                .get("media_type")
                                .and_then(|m| m.as_str())
                                .unwrap_or("image/jpeg");
                            let data = source.get("data").and_then(|d| d.as_str()).unwrap_or("");
                            if !data.is_empty() {
                                tool_calls.push(MiddleToolCall::inline_data(mime, data));
                            }
                        }
                        Some("tool_use") => {
                            let id = block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("tool_use")
                                .to_string();
                            let name = block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown")
                                .to_string();
                            let args = block
                                .get("input")
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "{}".to_string());
                            tool_calls.push(MiddleToolCall::function(id, name, args));
                            has_tool_use = true;
                        }
                        Some("tool_result") => {
                            // Tool results become their own tool-role
                            // message keyed by the originating call id.
                            let content = block.get("content").cloned().unwrap_or(Value::Null);
                            let text = tool_result_text(&content);
                            let mut tool_msg = MiddleMessage::text("tool", text.clone());
                            tool_msg.tool_call_id = block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string());
                            if serde_json::from_str::<Value>(&text).is_ok() {
                                tool_msg.tool_calls = Some(vec![MiddleToolCall::function(
                                    tool_msg
                                        .tool_call_id
                                        .clone()
                                        .unwrap_or_else(|| "function_result".to_string()),
                                    "toolResult",
                                    text,
                                )]);
                            }
                            messages.push(tool_msg);
                        }
                        _ => {}
                    }
                }

                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    let mut m = MiddleMessage::text(&msg.role, text_parts.join("\n"));
                    if has_tool_use {
                        m.role = "assistant".to_string();
                    }
                    if !tool_calls.is_empty() {
                        m.tool_calls = Some(tool_calls);
                    }
                    messages.push(m);
                }
            }
            _ => {}
        }
    }

    MiddleRequest {
        model: req.model.clone(),
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        n: None,
        stream: req.stream,
        presence_penalty: None,
        frequency_penalty: None,
        tools: req.tools.clone(),
        tool_choice: req.tool_choice.clone(),
        seed: None,
        reasoning_effort: None,
    }
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn map_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Converts an aggregated OpenAI completion into the Anthropic
/// non-streaming message shape.
pub fn completion_to_claude(completion: &Value) -> Value {
    let message = &completion["choices"][0]["message"];
    let text = message["content"].as_str().unwrap_or_default();
    let finish = completion["choices"][0]["finish_reason"]
        .as_str()
        .unwrap_or("stop");
    let usage = completion.get("usage");

    json!({
        "id": completion.get("id").and_then(|v| v.as_str()).unwrap_or("msg_viaduct"),
        "type": "message",
        "role": "assistant",
        "model": completion.get("model").and_then(|v| v.as_str()).unwrap_or_default(),
        "content": [{"type": "text", "text": text}],
        "stop_reason": map_stop_reason(finish),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            "output_tokens": usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
        },
    })
}

fn event_frame(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
}

/// Rewraps an OpenAI SSE stream as Anthropic SSE. Reasoning deltas become a
/// `thinking` block (index 0) and content a `text` block (index 1 when a
/// thinking block was opened, 0 otherwise).
pub fn rewrap_openai_to_claude_sse(mut upstream: SseByteStream, model: String) -> SseByteStream {
    let stream = async_stream::stream! {
        let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        let mut buffer = BytesMut::new();
        let mut started = false;
        let mut thinking_index: Option<u32> = None;
        let mut text_index: Option<u32> = None;
        let mut next_index: u32 = 0;
        let mut output_tokens: u64 = 0;
        let mut stop_reason = "end_turn".to_string();

        while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("[Claude-SSE] Upstream stream error: {}", e);
                    break;
                }
            };
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                let Ok(line_str) = std::str::from_utf8(&line_raw) else { continue };
                let line = line_str.trim();
                if line.is_empty() { continue; }
                if line.starts_with(':') {
                    // Keep-alive passes through as an SSE comment.
                    yield Ok(Bytes::from(format!("{}\n\n", line)));
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let data = data.trim();
                if data == "[DONE]" { continue; }
                let Ok(chunk) = serde_json::from_str::<Value>(data) else { continue };

                if !started {
                    started = true;
                    yield Ok::<Bytes, String>(event_frame("message_start", &json!({
                        "type": "message_start",
                        "message": {
                            "id": message_id,
                            "type": "message",
                            "role": "assistant",
                            "model": model,
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {"input_tokens": 0, "output_tokens": 0},
                        },
                    })));
                }

                if let Some(usage) = chunk.get("usage") {
                    if let Some(ct) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                        output_tokens = ct;
                    }
                }

                let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else { continue };
                if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    stop_reason = map_stop_reason(fr).to_string();
                }
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        let index = match thinking_index {
                            Some(i) => i,
                            None => {
                                let i = next_index;
                                next_index += 1;
                                thinking_index = Some(i);
                                yield Ok(event_frame("content_block_start", &json!({
                                    "type": "content_block_start",
                                    "index": i,
                                    "content_block": {"type": "thinking", "thinking": ""},
                                })));
                                i
                            }
                        };
                        yield Ok(event_frame("content_block_delta", &json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "thinking_delta", "thinking": text},
                        })));
                    }
                }

                if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        let index = match text_index {
                            Some(i) => i,
                            None => {
                                if let Some(i) = thinking_index.take() {
                                    yield Ok(event_frame("content_block_stop", &json!({
                                        "type": "content_block_stop",
                                        "index": i,
                                    })));
                                }
                                let i = next_index;
                                next_index += 1;
                                text_index = Some(i);
                                yield Ok(event_frame("content_block_start", &json!({
                                    "type": "content_block_start",
                                    "index": i,
                                    "content_block": {"type": "text", "text": ""},
                                })));
                                i
                            }
                        };
                        yield Ok(event_frame("content_block_delta", &json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": {"type": "text_delta", "text": text},
                        })));
                    }
                }
            }
        }

        if let Some(i) = thinking_index {
            yield Ok(event_frame("content_block_stop", &json!({
                "type": "content_block_stop", "index": i,
            })));
        }
        if let Some(i) = text_index {
            yield Ok(event_frame("content_block_stop", &json!({
                "type": "content_block_stop", "index": i,
            })));
        }
        yield Ok(event_frame("message_delta", &json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": {"output_tokens": output_tokens},
        })));
        yield Ok(event_frame("message_stop", &json!({"type": "message_stop"})));
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_string_and_blocks_both_flatten() {
        assert_eq!(flatten_system(&json!("be brief")).as_deref(), Some("be brief"));
        assert_eq!(
            flatten_system(&json!([
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"}
            ]))
            .as_deref(),
            Some("one\ntwo")
        );
    }

    #[test]
    fn tool_use_becomes_assistant_tool_call() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "deepseek-chat",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "rust"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "{\"hits\":3}"}
                ]}
            ]
        }))
        .expect("parse");

        let middle = to_middle(&req);
        assert_eq!(middle.messages.len(), 3);
        let assistant = &middle.messages[1];
        assert_eq!(assistant.role, "assistant");
        let calls = assistant.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls.len(), 1);

        let tool = &middle.messages[2];
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("tu_1"));
        // JSON-parsable result gets the synthetic toolResult call attached.
        assert!(tool.tool_calls.is_some());
    }

    #[test]
    fn base64_image_blocks_become_inline_data_on_user_messages() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "grok-imagine-0.9",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "animate"},
                    {"type": "image", "source": {
                        "type": "base64", "media_type": "image/png", "data": "aGk="
                    }}
                ]}
            ]
        }))
        .expect("parse");
        let middle = to_middle(&req);
        let m = &middle.messages[0];
        assert_eq!(m.role, "user", "image attachments must not hijack the role");
        let calls = m.tool_calls.as_ref().expect("inline call");
        let inline = calls[0].as_inline_data().expect("inline data");
        assert_eq!(inline.mime_type, "image/png");
    }

    #[test]
    fn non_json_tool_result_stays_plain_text() {
        let req: ClaudeRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_2", "content": "plain words"}
                ]}
            ]
        }))
        .expect("parse");
        let middle = to_middle(&req);
        assert_eq!(middle.messages[0].content, "plain words");
        assert!(middle.messages[0].tool_calls.is_none());
    }

    #[test]
    fn completion_converts_to_message_shape() {
        let completion = json!({
            "id": "chatcmpl-1",
            "model": "deepseek-chat",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8},
        });
        let out = completion_to_claude(&completion);
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "Hello");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 3);
        assert_eq!(out["usage"]["output_tokens"], 5);
        assert!(out["stop_sequence"].is_null());
    }

    #[tokio::test]
    async fn rewrap_emits_anthropic_event_sequence() {
        let frames: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"completion_tokens\":1}}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let upstream: SseByteStream = Box::pin(futures::stream::iter(frames));
        let mut out = rewrap_openai_to_claude_sse(upstream, "deepseek-chat".into());

        let mut collected = String::new();
        while let Some(item) = out.next().await {
            collected.push_str(&String::from_utf8_lossy(&item.expect("frame")));
        }
        assert!(collected.contains("event: message_start"));
        assert!(collected.contains("event: content_block_start"));
        assert!(collected.contains("\"text\":\"hi\""));
        assert!(collected.contains("event: message_delta"));
        assert!(collected.contains("\"stop_reason\":\"end_turn\""));
        assert!(collected.contains("event: message_stop"));
        let start = collected.find("message_start").expect("start present");
        let stop = collected.find("message_stop").expect("stop present");
        assert!(start < stop);
    }
}
