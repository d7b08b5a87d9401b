use serde::{Deserialize, Serialize};

/// OpenAI error payload. `code` carries the machine-readable error kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OpenAIError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub code: String,
}

/// The error envelope written to the client: `{"error": {...}}` with the
/// HTTP status carried out of band.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: OpenAIError,
}
