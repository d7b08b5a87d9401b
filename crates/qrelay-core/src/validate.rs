use bytes::Bytes;
use http::StatusCode;

use qrelay_protocol::openai::GeneralRequest;
use qrelay_protocol::openai::request::json_value_is_empty;
use qrelay_provider_core::{RelayError, RelayInfo, RelayMode, RelayResult};

/// Upper bound on `max_tokens` / `max_completion_tokens`; exactly 2^30 is
/// still accepted.
pub const MAX_TOKENS_LIMIT: i64 = 1 << 30;

const DEFAULT_MODERATION_MODEL: &str = "text-moderation-latest";

fn invalid(message: impl Into<String>) -> RelayError {
    RelayError::local("invalid_text_request", StatusCode::BAD_REQUEST, message)
}

/// Parse and validate the inbound body against the per-relay-mode
/// constraints. On success the request's stream flag is propagated to the
/// relay info; the raw bytes stay on the info for pass-through mode.
pub fn validate_text_request(
    body: &Bytes,
    info: &mut RelayInfo,
    path_model: Option<&str>,
) -> RelayResult<GeneralRequest> {
    let mut request: GeneralRequest =
        serde_json::from_slice(body).map_err(|err| invalid(err.to_string()))?;

    if info.relay_mode == RelayMode::Moderations && request.model.is_empty() {
        request.model = DEFAULT_MODERATION_MODEL.to_string();
    }
    if info.relay_mode == RelayMode::Embeddings && request.model.is_empty() {
        request.model = path_model.unwrap_or_default().to_string();
    }

    if request.max_tokens.unwrap_or(0) > MAX_TOKENS_LIMIT
        || request.max_completion_tokens.unwrap_or(0) > MAX_TOKENS_LIMIT
    {
        return Err(invalid("max_tokens is invalid"));
    }
    if request.model.is_empty() {
        return Err(invalid("model is required"));
    }

    match info.relay_mode {
        RelayMode::ChatCompletions => {
            if request.messages.is_empty() {
                return Err(invalid("field messages is required"));
            }
        }
        RelayMode::Completions => {
            if json_value_is_empty(request.prompt.as_ref()) {
                return Err(invalid("field prompt is required"));
            }
        }
        RelayMode::Moderations => {
            if json_value_is_empty(request.input.as_ref()) {
                return Err(invalid("field input is required"));
            }
        }
        RelayMode::Embeddings => {}
        RelayMode::Edits => {
            if request.instruction.as_deref().unwrap_or("").is_empty() {
                return Err(invalid("field instruction is required"));
            }
        }
    }

    info.is_stream = request.stream;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrelay_provider_core::{ApiType, RelayContext};

    fn make_info(relay_mode: RelayMode) -> RelayInfo {
        let ctx = RelayContext {
            request_id: "req".to_string(),
            user_id: 1,
            token_id: 1,
            token_unlimited: false,
            token_name: "t".to_string(),
            token_quota: 0,
            channel_id: 1,
            group: "default".to_string(),
            api_type: ApiType::Workflow,
            base_url: String::new(),
            api_key: String::new(),
            supports_stream_options: false,
            model_mapping: Default::default(),
            prompt_tokens: None,
            param_override: None,
            status_code_mapping: None,
        };
        RelayInfo::new(&ctx, relay_mode, Bytes::new())
    }

    fn validate(mode: RelayMode, body: &str) -> RelayResult<GeneralRequest> {
        let mut info = make_info(mode);
        validate_text_request(&Bytes::from(body.to_string()), &mut info, None)
    }

    #[test]
    fn chat_requires_messages() {
        let err = validate(RelayMode::ChatCompletions, r#"{"model":"m","messages":[]}"#)
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error.code, "invalid_text_request");

        let ok = validate(
            RelayMode::ChatCompletions,
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn max_tokens_boundary() {
        let at_limit = format!(
            r#"{{"model":"m","messages":[{{"role":"user","content":"hi"}}],"max_tokens":{}}}"#,
            1i64 << 30
        );
        assert!(validate(RelayMode::ChatCompletions, &at_limit).is_ok());

        let over_limit = format!(
            r#"{{"model":"m","messages":[{{"role":"user","content":"hi"}}],"max_tokens":{}}}"#,
            (1i64 << 30) + 1
        );
        assert!(validate(RelayMode::ChatCompletions, &over_limit).is_err());
    }

    #[test]
    fn model_is_required() {
        let err = validate(
            RelayMode::ChatCompletions,
            r#"{"messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap_err();
        assert!(err.error.message.contains("model"));
    }

    #[test]
    fn moderations_defaults_model() {
        let request = validate(RelayMode::Moderations, r#"{"input":"check me"}"#).unwrap();
        assert_eq!(request.model, "text-moderation-latest");

        assert!(validate(RelayMode::Moderations, r#"{"input":""}"#).is_err());
    }

    #[test]
    fn embeddings_defaults_model_from_path() {
        let mut info = make_info(RelayMode::Embeddings);
        let request = validate_text_request(
            &Bytes::from_static(br#"{"input":"embed me"}"#),
            &mut info,
            Some("text-embedding-3-small"),
        )
        .unwrap();
        assert_eq!(request.model, "text-embedding-3-small");
    }

    #[test]
    fn completions_requires_prompt_and_edits_requires_instruction() {
        assert!(validate(RelayMode::Completions, r#"{"model":"m"}"#).is_err());
        assert!(validate(RelayMode::Completions, r#"{"model":"m","prompt":"say hi"}"#).is_ok());
        assert!(validate(RelayMode::Edits, r#"{"model":"m"}"#).is_err());
        assert!(validate(RelayMode::Edits, r#"{"model":"m","instruction":"fix"}"#).is_ok());
    }

    #[test]
    fn stream_flag_propagates() {
        let mut info = make_info(RelayMode::ChatCompletions);
        let body =
            Bytes::from_static(br#"{"model":"m","messages":[{"role":"user","content":"hi"}],"stream":true}"#);
        validate_text_request(&body, &mut info, None).unwrap();
        assert!(info.is_stream);
    }
}
