use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The normalized OpenAI-shaped text request. One struct covers the chat,
/// completions, embeddings, moderations and edits surfaces; which payload
/// field must be present depends on the relay mode and is enforced by the
/// validator, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GeneralRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    /// Completions payload; string or array of strings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<JsonValue>,
    /// Embeddings / moderations payload; string or array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    /// Edits payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl GeneralRequest {
    /// Largest of `max_tokens` / `max_completion_tokens`, used as the
    /// completion upper bound for pre-consume estimation.
    pub fn max_output_tokens(&self) -> i64 {
        self.max_tokens
            .unwrap_or(0)
            .max(self.max_completion_tokens.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Flatten the content to plain text: string content verbatim, multi-part
    /// content as the concatenation of its text parts.
    pub fn string_content(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let MediaContent::Text { text } = part {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    /// View the content as an ordered list of media parts.
    pub fn parse_content(&self) -> Vec<MediaContent> {
        match &self.content {
            MessageContent::Text(text) => vec![MediaContent::Text { text: text.clone() }],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MediaContent>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaContent {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImageUrl {
    /// Either a remote http(s) URL or a `data:...;base64,` payload.
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ImageUrl {
    pub fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// Emptiness test for the free-form `prompt` / `input` payloads: JSON null,
/// the empty string and the empty array all count as absent.
pub fn json_value_is_empty(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(text)) => text.is_empty(),
        Some(JsonValue::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}
