//! OpenAI chat-completions protocol: inbound request normalization and the
//! chunk builders every adapter uses to emit OpenAI SSE.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::middle::{MiddleMessage, MiddleRequest, MiddleToolCall};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OpenAIMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub n: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub seed: Option<i64>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAIContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    String(String),
    Array(Vec<OpenAIContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAIContentBlock {
    #[serde(rename = "text", alias = "input_text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: Value },
    #[serde(other)]
    Other,
}

impl OpenAIContent {
    /// Text-only parts concatenated with `\n`; non-text parts are dropped.
    pub fn flatten(&self) -> String {
        match self {
            OpenAIContent::String(s) => s.clone(),
            OpenAIContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    OpenAIContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Inline image payloads arrive as `data:<mime>;base64,<data>` URLs inside
/// `image_url` parts; remote URLs are left to the text channel.
fn data_url_to_inline(url: &str) -> Option<MiddleToolCall> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() || data.is_empty() {
        return None;
    }
    Some(MiddleToolCall::inline_data(mime, data))
}

fn inline_blocks(content: &OpenAIContent) -> Vec<MiddleToolCall> {
    match content {
        OpenAIContent::String(_) => Vec::new(),
        OpenAIContent::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                OpenAIContentBlock::ImageUrl { image_url } => image_url
                    .get("url")
                    .and_then(|u| u.as_str())
                    .and_then(data_url_to_inline),
                _ => None,
            })
            .collect(),
    }
}

fn parse_tool_call(raw: &Value) -> Option<MiddleToolCall> {
    let id = raw.get("id")?.as_str()?.to_string();
    let function = raw.get("function")?;
    Some(MiddleToolCall::function(
        id,
        function.get("name")?.as_str()?.to_string(),
        function
            .get("arguments")
            .and_then(|a| a.as_str())
            .unwrap_or("{}")
            .to_string(),
    ))
}

pub fn to_middle(req: &OpenAIRequest) -> MiddleRequest {
    let messages = req
        .messages
        .iter()
        .map(|m| {
            let mut tool_calls: Vec<MiddleToolCall> = m
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
                .unwrap_or_default();
            if let Some(content) = &m.content {
                tool_calls.extend(inline_blocks(content));
            }
            MiddleMessage {
                role: m.role.clone(),
                content: m.content.as_ref().map(|c| c.flatten()).unwrap_or_default(),
                name: m.name.clone(),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: m.tool_call_id.clone(),
                reasoning_content: m.reasoning_content.clone(),
            }
        })
        .collect();

    MiddleRequest {
        model: req.model.clone(),
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        n: req.n,
        stream: req.stream,
        presence_penalty: req.presence_penalty,
        frequency_penalty: req.frequency_penalty,
        tools: req.tools.clone(),
        tool_choice: req.tool_choice.clone(),
        seed: req.seed,
        reasoning_effort: req.reasoning_effort.clone(),
    }
}

/// Emits the OpenAI SSE frames for one completion. Every adapter funnels
/// its upstream output through one of these so the wire shape stays
/// identical regardless of provider.
pub struct ChunkBuilder {
    id: String,
    model: String,
    created: i64,
}

impl ChunkBuilder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn frame(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Bytes {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        Bytes::from(format!("data: {}\n\n", chunk))
    }

    /// First frame of the stream: carries the assistant role exactly once.
    pub fn role_frame(&self) -> Bytes {
        self.frame(json!({"role": "assistant", "content": ""}), None, None)
    }

    pub fn content_frame(&self, text: &str) -> Bytes {
        self.frame(json!({"content": text}), None, None)
    }

    pub fn reasoning_frame(&self, text: &str) -> Bytes {
        self.frame(json!({"reasoning_content": text}), None, None)
    }

    pub fn finish_frame(&self, finish_reason: &str, usage: Option<Value>) -> Bytes {
        self.frame(json!({}), Some(finish_reason), usage)
    }

    pub fn done_frame() -> Bytes {
        Bytes::from_static(b"data: [DONE]\n\n")
    }

    pub fn keep_alive_frame() -> Bytes {
        Bytes::from_static(b": keep-alive\n\n")
    }
}

pub fn usage_value(prompt_tokens: u32, completion_tokens: u32) -> Value {
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimodal_text_parts_join_with_newline() {
        let content = OpenAIContent::Array(vec![
            OpenAIContentBlock::Text { text: "first".into() },
            OpenAIContentBlock::ImageUrl { image_url: json!({"url":"http://x/y.png"}) },
            OpenAIContentBlock::Text { text: "second".into() },
        ]);
        assert_eq!(content.flatten(), "first\nsecond");
    }

    #[test]
    fn to_middle_preserves_tool_calls() {
        let req: OpenAIRequest = serde_json::from_value(json!({
            "model": "deepseek-chat",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "lookup", "arguments": "{\"q\":1}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup"}}],
            "tool_choice": "auto",
            "stream": true
        }))
        .expect("parse request");

        let middle = to_middle(&req);
        assert_eq!(middle.model, "deepseek-chat");
        assert!(middle.stream);
        assert_eq!(middle.messages.len(), 3);
        let calls = middle.messages[1].tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(middle.messages[2].tool_call_id.as_deref(), Some("call_1"));
        assert!(middle.tools.is_some());
        assert_eq!(middle.tool_choice, Some(json!("auto")));
    }

    #[test]
    fn data_url_images_become_inline_data() {
        let req: OpenAIRequest = serde_json::from_value(json!({
            "model": "grok-imagine-0.9",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "animate this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}},
                    {"type": "image_url", "image_url": {"url": "https://example.com/remote.png"}}
                ]
            }]
        }))
        .expect("parse request");
        let middle = to_middle(&req);
        let calls = middle.messages[0].tool_calls.as_ref().expect("inline call");
        // Only the data URL becomes an attachment; the remote URL stays text-side.
        assert_eq!(calls.len(), 1);
        let inline = calls[0].as_inline_data().expect("inline data");
        assert_eq!(inline.mime_type, "image/png");
        assert_eq!(inline.data, "aGk=");
        assert_eq!(middle.messages[0].content, "animate this");
    }

    #[test]
    fn chunk_builder_frames_are_well_formed_sse() {
        let builder = ChunkBuilder::new("deepseek-chat");

        let role = String::from_utf8(builder.role_frame().to_vec()).expect("utf8");
        assert!(role.starts_with("data: "));
        assert!(role.ends_with("\n\n"));
        let parsed: Value =
            serde_json::from_str(role.trim_start_matches("data: ").trim()).expect("json");
        assert_eq!(parsed["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(parsed["object"], "chat.completion.chunk");

        let finish = String::from_utf8(
            builder
                .finish_frame("stop", Some(usage_value(1, 2)))
                .to_vec(),
        )
        .expect("utf8");
        let parsed: Value =
            serde_json::from_str(finish.trim_start_matches("data: ").trim()).expect("json");
        assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
        assert_eq!(parsed["usage"]["total_tokens"], 3);

        assert_eq!(&ChunkBuilder::done_frame()[..], b"data: [DONE]\n\n");
        assert!(ChunkBuilder::keep_alive_frame().starts_with(b": "));
    }
}
