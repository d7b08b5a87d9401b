use std::error::Error;
use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use qrelay_protocol::openai::{ErrorResponse, OpenAIError};

pub type RelayResult<T> = Result<T, RelayError>;

const LOCAL_ERROR_TYPE: &str = "relay_error";
const UPSTREAM_ERROR_TYPE: &str = "upstream_error";

/// A typed error envelope: the OpenAI error body plus the HTTP status it is
/// delivered with. `is_local` separates errors raised inside the relay from
/// errors propagated from the provider; only the latter are subject to
/// per-channel status-code remapping.
#[derive(Debug, Clone)]
pub struct RelayError {
    pub status: StatusCode,
    pub error: OpenAIError,
    pub is_local: bool,
}

impl RelayError {
    pub fn local(code: &str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: OpenAIError {
                message: message.into(),
                r#type: LOCAL_ERROR_TYPE.to_string(),
                code: code.to_string(),
            },
            is_local: true,
        }
    }

    pub fn upstream(code: &str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: OpenAIError {
                message: message.into(),
                r#type: UPSTREAM_ERROR_TYPE.to_string(),
                code: code.to_string(),
            },
            is_local: false,
        }
    }

    /// Map a non-200 provider response to a relay error. When the body is an
    /// OpenAI error envelope it is passed through; otherwise the raw text is
    /// wrapped so the caller still sees what the provider said.
    pub fn from_upstream_response(status: StatusCode, body: &[u8]) -> Self {
        if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
            if !parsed.error.message.is_empty() || !parsed.error.code.is_empty() {
                return Self {
                    status,
                    error: parsed.error,
                    is_local: false,
                };
            }
        }
        Self::upstream(
            "upstream_error",
            status,
            String::from_utf8_lossy(body).to_string(),
        )
    }

    /// Apply a per-channel status remap (`{"429":"500"}`-style JSON object).
    /// Local errors keep their status.
    pub fn remap_status(&mut self, mapping: Option<&str>) {
        if self.is_local {
            return;
        }
        let Some(mapping) = mapping else { return };
        let Ok(map) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(mapping)
        else {
            return;
        };
        let key = self.status.as_u16().to_string();
        let mapped = match map.get(&key) {
            Some(serde_json::Value::Number(number)) => number.as_u64(),
            Some(serde_json::Value::String(text)) => text.parse::<u64>().ok(),
            _ => None,
        };
        if let Some(code) = mapped
            && let Ok(status) = StatusCode::from_u16(code as u16)
        {
            self.status = status;
        }
    }

    /// The JSON body written to the client.
    pub fn to_body(&self) -> Bytes {
        let envelope = ErrorResponse {
            error: self.error.clone(),
        };
        match serde_json::to_vec(&envelope) {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(b"{\"error\":{\"message\":\"internal error\"}}"),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.error.code,
            self.status.as_u16(),
            self.error.message
        )
    }
}

impl Error for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_envelope_passthrough() {
        let body = br#"{"error":{"message":"rate limited","type":"requests","code":"rate_limit_exceeded"}}"#;
        let err = RelayError::from_upstream_response(StatusCode::TOO_MANY_REQUESTS, body);
        assert_eq!(err.error.code, "rate_limit_exceeded");
        assert_eq!(err.error.message, "rate limited");
        assert!(!err.is_local);
    }

    #[test]
    fn upstream_raw_body_wrapped() {
        let err = RelayError::from_upstream_response(StatusCode::BAD_GATEWAY, b"boom");
        assert_eq!(err.error.message, "boom");
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn status_remap_applies_to_upstream_only() {
        let mut err = RelayError::from_upstream_response(StatusCode::TOO_MANY_REQUESTS, b"x");
        err.remap_status(Some(r#"{"429":"500"}"#));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);

        let mut local =
            RelayError::local("invalid_text_request", StatusCode::BAD_REQUEST, "bad");
        local.remap_status(Some(r#"{"400":"418"}"#));
        assert_eq!(local.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn status_remap_tolerates_garbage() {
        let mut err = RelayError::from_upstream_response(StatusCode::TOO_MANY_REQUESTS, b"x");
        err.remap_status(Some("not json"));
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }
}
