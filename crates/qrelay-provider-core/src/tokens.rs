use std::error::Error;
use std::fmt;

use serde_json::Value as JsonValue;
use tiktoken_rs::{get_bpe_from_model, o200k_base};

use qrelay_protocol::openai::Message;

/// Model used when synthesizing usage for providers that never report it.
pub const FALLBACK_COUNT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone)]
pub struct TokenError(pub String);

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token counting failed: {}", self.0)
    }
}

impl Error for TokenError {}

/// Deterministic token counts for a model + payload.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, model: &str, text: &str) -> Result<i64, TokenError>;
}

/// tiktoken-backed counter; unknown models fall back to the o200k encoding.
#[derive(Debug, Default)]
pub struct TiktokenCounter;

impl TiktokenCounter {
    pub fn new() -> Self {
        Self
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, model: &str, text: &str) -> Result<i64, TokenError> {
        let bpe = get_bpe_from_model(model)
            .or_else(|_| o200k_base())
            .map_err(|err| TokenError(err.to_string()))?;
        Ok(bpe.encode_ordinary(text).len() as i64)
    }
}

/// Prompt-token count for a chat request: roles and flattened content,
/// one line each, in message order.
pub fn count_chat_tokens(
    counter: &dyn TokenCounter,
    model: &str,
    messages: &[Message],
) -> Result<i64, TokenError> {
    let mut text = String::new();
    for message in messages {
        text.push_str(&message.role);
        text.push('\n');
        text.push_str(&message.string_content());
        text.push('\n');
    }
    counter.count_text(model, &text)
}

/// Prompt-token count for the free-form `prompt` / `input` payloads:
/// a string is counted directly, an array element-wise, anything else by its
/// JSON rendering.
pub fn count_value_tokens(
    counter: &dyn TokenCounter,
    model: &str,
    value: &JsonValue,
) -> Result<i64, TokenError> {
    match value {
        JsonValue::String(text) => counter.count_text(model, text),
        JsonValue::Array(items) => {
            let mut total = 0;
            for item in items {
                total += count_value_tokens(counter, model, item)?;
            }
            Ok(total)
        }
        other => counter.count_text(model, &other.to_string()),
    }
}
