use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    InputFile { file_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl InputMessage {
    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    FileSearch { vector_store_ids: Vec<String> },
}

/// One `/responses` call. The idempotency token never enters the JSON body;
/// the transport sends it as a header so retried requests stay safe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub instructions: String,
    pub input: Vec<InputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip)]
    pub idempotency_key: String,
}

impl ResponsesRequest {
    pub fn to_body(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: String,
    pub status: Option<String>,
    pub usage: Option<Usage>,
    pub raw: Value,
}

impl ResponseEnvelope {
    pub fn from_value(raw: Value) -> Self {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = raw
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok());
        Self {
            id,
            status,
            usage,
            raw,
        }
    }

    pub fn output_text(&self) -> String {
        extract_output_text(&self.raw)
    }
}

/// Pull the assistant text out of a Responses payload. Prefers the flattened
/// `output_text`, then walks `output[].content[]` for text parts, then falls
/// back to top-level string fields, and finally to the raw JSON so a contract
/// violation is still visible downstream.
pub fn extract_output_text(raw: &Value) -> String {
    if let Some(text) = raw.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(output) = raw.get("output").and_then(Value::as_array) {
        let mut texts = Vec::new();
        for item in output {
            let Some(content) = item.get("content").and_then(Value::as_array) else {
                continue;
            };
            for part in content {
                let kind = part.get("type").and_then(Value::as_str).unwrap_or("");
                if kind == "output_text" || kind == "text" {
                    if let Some(text) = part
                        .get("text")
                        .and_then(Value::as_str)
                        .or_else(|| part.get("content").and_then(Value::as_str))
                    {
                        texts.push(text.to_string());
                    }
                }
            }
        }
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    for key in ["text", "content", "message"] {
        if let Some(text) = raw.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    raw.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchInfo {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl BatchInfo {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "completed" | "failed" | "cancelled" | "expired"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorStoreFileStatus {
    pub id: String,
    pub status: String,
    pub last_error: Option<String>,
}
