//! Intermediate request form shared by every ingress protocol and every
//! provider adapter. OpenAI, Anthropic and Gemini bodies are normalized
//! into this shape on the way in; adapters only ever see it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiddleRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<MiddleMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddleMessage {
    /// One of `system`, `user`, `assistant`, `tool`.
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<MiddleToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl MiddleMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiddleToolCall {
    Function {
        id: String,
        #[serde(rename = "type")]
        call_type: String,
        function: MiddleFunctionCall,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: MiddleInlineData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddleFunctionCall {
    pub name: String,
    /// Arguments kept as the raw JSON string the caller sent.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddleInlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

impl MiddleToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::Function {
            id: id.into(),
            call_type: "function".to_string(),
            function: MiddleFunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::InlineData {
            inline_data: MiddleInlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn as_inline_data(&self) -> Option<&MiddleInlineData> {
        match self {
            Self::InlineData { inline_data } => Some(inline_data),
            _ => None,
        }
    }
}
