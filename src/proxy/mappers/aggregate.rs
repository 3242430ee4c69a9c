//! Folds an OpenAI SSE stream into a single non-streaming completion.
//!
//! Aggregation keeps the ordered concatenation of `delta.content` and
//! `delta.reasoning_content`, plus the last observed `finish_reason`,
//! `usage`, `id` and `model` on the stream.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

#[derive(Debug, Default, Clone)]
pub struct Aggregated {
    pub id: String,
    pub model: String,
    pub content: String,
    pub reasoning_content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Value>,
}

impl Aggregated {
    fn absorb_data(&mut self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if let Some(id) = chunk.get("id").and_then(|v| v.as_str()) {
            self.id = id.to_string();
        }
        if let Some(model) = chunk.get("model").and_then(|v| v.as_str()) {
            self.model = model.to_string();
        }
        if let Some(usage) = chunk.get("usage") {
            if !usage.is_null() {
                self.usage = Some(usage.clone());
            }
        }
        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(fr.to_string());
        }
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                self.content.push_str(text);
            }
            if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                self.reasoning_content.push_str(text);
            }
        }
    }

    /// Final OpenAI `chat.completion` object.
    pub fn into_completion(self) -> Value {
        let mut message = json!({
            "role": "assistant",
            "content": self.content,
        });
        if !self.reasoning_content.is_empty() {
            message["reasoning_content"] = json!(self.reasoning_content);
        }
        let mut out = json!({
            "id": self.id,
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
        });
        if let Some(usage) = self.usage {
            out["usage"] = usage;
        }
        out
    }
}

/// Feeds raw SSE bytes line by line into the aggregate. Comment frames and
/// `[DONE]` are skipped.
pub struct SseAggregator {
    state: Aggregated,
    buffer: String,
}

impl SseAggregator {
    pub fn new() -> Self {
        Self {
            state: Aggregated::default(),
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data: ") {
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                self.state.absorb_data(data);
            }
        }
    }

    pub fn finish(self) -> Aggregated {
        self.state
    }
}

impl Default for SseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn collect_sse<S, E>(mut stream: S) -> Result<Aggregated, String>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut aggregator = SseAggregator::new();
    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| format!("Stream error during aggregation: {}", e))?;
        aggregator.push(&bytes);
    }
    Ok(aggregator.finish())
}
