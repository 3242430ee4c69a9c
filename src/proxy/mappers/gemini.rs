//! Gemini generateContent protocol: request normalization, non-stream
//! response conversion, and the OpenAI-SSE to Gemini-SSE rewrap.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::{json, Value};

use super::middle::{MiddleMessage, MiddleRequest, MiddleToolCall};
use crate::proxy::providers::SseByteStream;

fn part_text(part: &Value) -> Option<&str> {
    part.get("text").and_then(|t| t.as_str())
}

/// Maps `toolConfig.functionCallingConfig` onto the OpenAI-style
/// `tool_choice` the intermediate form carries.
fn map_tool_choice(tool_config: &Value) -> Option<Value> {
    let fcc = tool_config.get("functionCallingConfig")?;
    let mode = fcc.get("mode").and_then(|m| m.as_str())?;
    match mode {
        "NONE" => Some(json!("none")),
        "AUTO" => Some(json!("auto")),
        "ANY" => {
            let allowed = fcc
                .get("allowedFunctionNames")
                .and_then(|a| a.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                });
            match allowed.as_deref() {
                Some([single]) => Some(json!({
                    "type": "function",
                    "function": {"name": single},
                })),
                _ => Some(json!("required")),
            }
        }
        _ => None,
    }
}

pub fn to_middle(model: &str, body: &Value, stream: bool) -> MiddleRequest {
    let mut messages = Vec::new();

    if let Some(parts) = body
        .get("systemInstruction")
        .and_then(|si| si.get("parts"))
        .and_then(|p| p.as_array())
    {
        let text: Vec<&str> = parts.iter().filter_map(part_text).collect();
        if !text.is_empty() {
            messages.push(MiddleMessage::text("system", text.join("\n")));
        }
    }

    if let Some(contents) = body.get("contents").and_then(|c| c.as_array()) {
        for content in contents {
            let role = match content.get("role").and_then(|r| r.as_str()) {
                Some("model") => "assistant",
                _ => "user",
            };
            let Some(parts) = content.get("parts").and_then(|p| p.as_array()) else {
                continue;
            };
            // Every Part is its own intermediate message.
            for part in parts {
                if let Some(text) = part_text(part) {
                    messages.push(MiddleMessage::text(role, text));
                } else if let Some(inline) = part.get("inlineData") {
                    let mime = inline
                        .get("mimeType")
                        .and_then(|m| m.as_str())
                        .unwrap_or("application/octet-stream");
                    let data = inline.get("data").and_then(|d| d.as_str()).unwrap_or("");
                    let mut m = MiddleMessage::text("assistant", "");
                    m.tool_calls = Some(vec![MiddleToolCall::inline_data(mime, data)]);
                    messages.push(m);
                } else if let Some(fc) = part.get("functionCall") {
                    let name = fc.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
                    let args = fc
                        .get("args")
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    let id = fc
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("call_{}", name));
                    let mut m = MiddleMessage::text("assistant", "");
                    m.tool_calls = Some(vec![MiddleToolCall::function(id, name, args)]);
                    messages.push(m);
                } else if let Some(fr) = part.get("functionResponse") {
                    let name = fr.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
                    let response = fr
                        .get("response")
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    let mut m = MiddleMessage::text("tool", response);
                    m.name = Some(name.to_string());
                    m.tool_call_id = fr
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    messages.push(m);
                }
            }
        }
    }

    let gen = body.get("generationConfig");
    let get_f64 = |key: &str| gen.and_then(|g| g.get(key)).and_then(|v| v.as_f64());
    let get_u64 = |key: &str| gen.and_then(|g| g.get(key)).and_then(|v| v.as_u64());

    MiddleRequest {
        model: model.to_string(),
        messages,
        temperature: get_f64("temperature"),
        top_p: get_f64("topP"),
        top_k: get_u64("topK").map(|v| v as u32),
        n: get_u64("candidateCount").map(|v| v as u32),
        stream,
        presence_penalty: get_f64("presencePenalty"),
        frequency_penalty: get_f64("frequencyPenalty"),
        tools: body.get("tools").and_then(|t| t.as_array()).cloned(),
        tool_choice: body.get("toolConfig").and_then(map_tool_choice),
        seed: gen.and_then(|g| g.get("seed")).and_then(|v| v.as_i64()),
        reasoning_effort: None,
    }
}

fn map_finish_reason(finish: &str) -> &'static str {
    match finish {
        "length" => "MAX_TOKENS",
        _ => "STOP",
    }
}

/// Converts an aggregated OpenAI completion into the Gemini non-streaming
/// response shape.
pub fn completion_to_gemini(completion: &Value) -> Value {
    let message = &completion["choices"][0]["message"];
    let text = message["content"].as_str().unwrap_or_default();
    let finish = completion["choices"][0]["finish_reason"]
        .as_str()
        .unwrap_or("stop");
    let usage = completion.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let candidates = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": map_finish_reason(finish),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": prompt,
            "candidatesTokenCount": candidates,
            "totalTokenCount": prompt + candidates,
        },
        "modelVersion": completion.get("model").and_then(|v| v.as_str()).unwrap_or_default(),
    })
}

fn openai_chunk_to_gemini_frame(chunk: &Value) -> Option<Bytes> {
    let model = chunk
        .get("model")
        .and_then(|v| v.as_str())
        .or_else(|| chunk["choices"][0].get("model").and_then(|v| v.as_str()))
        .unwrap_or_default();
    let choice = chunk.get("choices").and_then(|c| c.get(0))?;

    let mut parts = Vec::new();
    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                parts.push(json!({"text": text, "thought": true}));
            }
        }
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                parts.push(json!({"text": text}));
            }
        }
    }
    let finish = choice.get("finish_reason").and_then(|v| v.as_str());
    if parts.is_empty() && finish.is_none() {
        return None;
    }

    let mut candidate = json!({
        "content": {"role": "model", "parts": parts},
        "index": 0,
    });
    if let Some(fr) = finish {
        candidate["finishReason"] = json!(map_finish_reason(fr));
    }
    let mut frame = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    if let Some(usage) = chunk.get("usage") {
        if !usage.is_null() {
            let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            frame["usageMetadata"] = json!({
                "promptTokenCount": prompt,
                "candidatesTokenCount": completion,
                "totalTokenCount": prompt + completion,
            });
        }
    }
    Some(Bytes::from(format!("data: {}\n\n", frame)))
}

/// Rewraps an OpenAI SSE stream as Gemini SSE frames, preserving chunk
/// boundaries one-to-one for data frames.
pub fn rewrap_openai_to_gemini_sse(mut upstream: SseByteStream) -> SseByteStream {
    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("[Gemini-SSE] Upstream stream error: {}", e);
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
                    yield Ok(Bytes::from(format!("{}\n\n", line)));
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let data = data.trim();
                if data == "[DONE]" { continue; }
                let Ok(chunk) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(frame) = openai_chunk_to_gemini_frame(&chunk) {
                    yield Ok::<Bytes, String>(frame);
                }
            }
        }
    };
    Box::pin(stream)
}
