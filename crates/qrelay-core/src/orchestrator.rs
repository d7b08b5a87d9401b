use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use qrelay_protocol::openai::{GeneralRequest, StreamOptions};
use qrelay_provider_core::{
    ClientSink, RelayContext, RelayError, RelayInfo, RelayMode, RelayResult, TokenCounter,
    TokenError, count_chat_tokens, count_value_tokens,
};

use crate::core::CoreState;
use crate::sensitive::SensitiveScanner;
use crate::settlement::{post_consume_quota, pre_consume_quota};
use crate::validate::validate_text_request;

/// The streaming client path holds at most one chunk beyond the one in
/// flight; back-pressure propagates to the upstream read loop.
const CLIENT_CHANNEL_CAPACITY: usize = 1;

pub enum RelayResponse {
    /// Buffered response, fully assembled before returning.
    Json { status: StatusCode, body: Bytes },
    /// SSE response; chunks arrive on the channel as the adapter translates
    /// them, and settlement runs after the last one.
    Stream { body: mpsc::Receiver<Bytes> },
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayResponse::Json { status, body } => f
                .debug_struct("Json")
                .field("status", status)
                .field("body", body)
                .finish(),
            RelayResponse::Stream { .. } => f.debug_struct("Stream").finish_non_exhaustive(),
        }
    }
}

/// Drive one text request end to end: validate, price, pre-consume,
/// dispatch, translate, settle. Any error after the pre-consume debit drops
/// the guard, which refunds the debit asynchronously.
pub async fn relay_text(
    state: Arc<CoreState>,
    ctx: RelayContext,
    relay_mode: RelayMode,
    path_model: Option<String>,
    body: Bytes,
) -> RelayResult<RelayResponse> {
    let mut info = RelayInfo::new(&ctx, relay_mode, body.clone());
    info!(
        event = "relay_started",
        request_id = %info.request_id,
        user_id = info.user_id,
        channel_id = info.channel_id,
        mode = relay_mode.as_str()
    );

    let mut request = validate_text_request(&body, &mut info, path_model.as_deref())?;

    if state.options.check_prompt_sensitive
        && let Err(words) = scan_request(state.scanner.as_ref(), &request, relay_mode)
    {
        warn!(
            event = "sensitive_words_detected",
            request_id = %info.request_id,
            words = %words.join(", ")
        );
        return Err(RelayError::local(
            "sensitive_words_detected",
            StatusCode::BAD_REQUEST,
            "sensitive words detected",
        ));
    }

    info.origin_model_name = request.model.clone();
    info.upstream_model_name = map_model(&request.model, ctx.model_mapping.as_deref())?;
    request.model = info.upstream_model_name.clone();

    info.prompt_tokens = match ctx.prompt_tokens {
        Some(value) => value,
        None => count_prompt_tokens(state.counter.as_ref(), &request, relay_mode).map_err(
            |err| {
                RelayError::local(
                    "count_token_messages_failed",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                )
            },
        )?,
    };

    let price = state
        .pricing
        .resolve(&info, info.prompt_tokens, request.max_output_tokens())
        .map_err(|err| {
            RelayError::local(
                "model_price_error",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;

    // the guard returned here is the deferred refund hook: every early
    // return below drops it and restores the debit
    let pre_consumed = pre_consume_quota(
        &state.ledger,
        &mut info,
        ctx.token_quota,
        price.should_pre_consumed_quota,
    )
    .await?;
    info!(
        event = "pre_consumed",
        request_id = %info.request_id,
        amount = pre_consumed.amount(),
        user_quota = info.user_quota
    );

    let include_usage = request
        .stream_options
        .and_then(|options| options.include_usage)
        .unwrap_or(false);
    if !info.supports_stream_options || !request.stream {
        request.stream_options = None;
    } else if state.options.force_stream_option {
        request.stream_options = Some(StreamOptions {
            include_usage: Some(true),
        });
    }
    if include_usage {
        info.should_include_usage = true;
    }

    let Some(adapter) = state.adapters.get(info.api_type) else {
        return Err(RelayError::local(
            "invalid_api_type",
            StatusCode::BAD_REQUEST,
            format!("invalid api type: {}", info.api_type.as_str()),
        ));
    };
    adapter.init(&mut info);

    let request_body = if state.options.pass_through_request {
        info.raw_body.clone()
    } else {
        let converted = adapter.convert_request(&info, &request).await?;
        let encoded = serde_json::to_vec(&converted).map_err(|err| {
            RelayError::local(
                "json_marshal_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;
        apply_param_override(encoded, info.param_override.as_ref())?
    };

    let response = adapter.do_request(&info, request_body).await?;
    let status = response.status();
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    // the adapter may stream even when the client did not ask
    info.is_stream = info.is_stream || content_type.starts_with("text/event-stream");
    info!(
        event = "upstream_response",
        request_id = %info.request_id,
        status = status.as_u16(),
        content_type = %content_type,
        is_stream = info.is_stream
    );

    if status != StatusCode::OK {
        let body = response.bytes().await.unwrap_or_default();
        let mut err = RelayError::from_upstream_response(status, &body);
        err.remap_status(ctx.status_code_mapping.as_deref());
        return Err(err);
    }

    let (sink, mut rx) = ClientSink::channel(CLIENT_CHANNEL_CAPACITY);
    if info.is_stream {
        let token_name = ctx.token_name.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut info = info;
            match adapter.do_response(&mut info, response, &sink).await {
                Ok(usage) => {
                    let pre = pre_consumed.settle();
                    post_consume_quota(
                        state.ledger.as_ref(),
                        state.consume_log.as_ref(),
                        &state.settlement,
                        &info,
                        &token_name,
                        Some(&usage),
                        pre,
                        &price,
                        "",
                    )
                    .await;
                }
                Err(err) => {
                    // headers are already on the wire; log, close the
                    // stream, let the dropped guard refund
                    error!(
                        event = "do_response_failed",
                        request_id = %info.request_id,
                        error = %err
                    );
                }
            }
        });
        Ok(RelayResponse::Stream { body: rx })
    } else {
        let collector = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            while let Some(chunk) = rx.recv().await {
                buffer.extend_from_slice(&chunk);
            }
            buffer.freeze()
        });
        let usage = match adapter.do_response(&mut info, response, &sink).await {
            Ok(usage) => usage,
            Err(mut err) => {
                err.remap_status(ctx.status_code_mapping.as_deref());
                return Err(err);
            }
        };
        drop(sink);
        let body = collector.await.unwrap_or_default();

        let pre = pre_consumed.settle();
        post_consume_quota(
            state.ledger.as_ref(),
            state.consume_log.as_ref(),
            &state.settlement,
            &info,
            &ctx.token_name,
            Some(&usage),
            pre,
            &price,
            "",
        )
        .await;
        Ok(RelayResponse::Json { status, body })
    }
}

/// Shallow-merge the override map over the top-level keys of the encoded
/// request. Re-applying the same override is a no-op on the output bytes.
pub(crate) fn apply_param_override(
    encoded: Vec<u8>,
    overrides: Option<&Map<String, JsonValue>>,
) -> RelayResult<Bytes> {
    let Some(overrides) = overrides.filter(|map| !map.is_empty()) else {
        return Ok(Bytes::from(encoded));
    };
    let mut body: Map<String, JsonValue> = serde_json::from_slice(&encoded).map_err(|err| {
        RelayError::local(
            "param_override_unmarshal_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
    })?;
    for (key, value) in overrides {
        body.insert(key.clone(), value.clone());
    }
    let merged = serde_json::to_vec(&body).map_err(|err| {
        RelayError::local(
            "param_override_marshal_failed",
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )
    })?;
    Ok(Bytes::from(merged))
}

/// Resolve the upstream model name through the channel's mapping table.
fn map_model(origin: &str, mapping: Option<&str>) -> RelayResult<String> {
    let Some(raw) = mapping else {
        return Ok(origin.to_string());
    };
    let table: std::collections::HashMap<String, String> =
        serde_json::from_str(raw).map_err(|err| {
            RelayError::local(
                "model_mapped_error",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;
    Ok(table
        .get(origin)
        .cloned()
        .unwrap_or_else(|| origin.to_string()))
}

fn scan_request(
    scanner: &dyn SensitiveScanner,
    request: &GeneralRequest,
    relay_mode: RelayMode,
) -> Result<(), Vec<String>> {
    scanner.scan(&payload_text(request, relay_mode))
}

fn count_prompt_tokens(
    counter: &dyn TokenCounter,
    request: &GeneralRequest,
    relay_mode: RelayMode,
) -> Result<i64, TokenError> {
    match relay_mode {
        RelayMode::ChatCompletions => {
            count_chat_tokens(counter, &request.model, &request.messages)
        }
        RelayMode::Completions => count_value_tokens(
            counter,
            &request.model,
            request.prompt.as_ref().unwrap_or(&JsonValue::Null),
        ),
        RelayMode::Embeddings | RelayMode::Moderations => count_value_tokens(
            counter,
            &request.model,
            request.input.as_ref().unwrap_or(&JsonValue::Null),
        ),
        RelayMode::Edits => counter.count_text(
            &request.model,
            request.instruction.as_deref().unwrap_or_default(),
        ),
    }
}

/// The payload text of the active relay mode, used by the sensitive scan.
fn payload_text(request: &GeneralRequest, relay_mode: RelayMode) -> String {
    match relay_mode {
        RelayMode::ChatCompletions => {
            let mut out = String::new();
            for message in &request.messages {
                out.push_str(&message.string_content());
                out.push('\n');
            }
            out
        }
        RelayMode::Completions => value_text(request.prompt.as_ref()),
        RelayMode::Embeddings | RelayMode::Moderations => value_text(request.input.as_ref()),
        RelayMode::Edits => request.instruction.clone().unwrap_or_default(),
    }
}

fn value_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(JsonValue::Array(items)) => {
            let mut out = String::new();
            for item in items {
                out.push_str(&value_text(Some(item)));
                out.push('\n');
            }
            out
        }
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_override_merge_is_idempotent() {
        let mut overrides = Map::new();
        overrides.insert("temperature".to_string(), serde_json::json!(0.2));
        overrides.insert("inputs".to_string(), serde_json::json!({"lang": "en"}));

        let encoded = serde_json::to_vec(&serde_json::json!({
            "query": "USER: \nhi\n",
            "temperature": 1.0,
        }))
        .unwrap();

        let once = apply_param_override(encoded, Some(&overrides)).unwrap();
        let twice = apply_param_override(once.to_vec(), Some(&overrides)).unwrap();
        assert_eq!(once, twice);

        let merged: JsonValue = serde_json::from_slice(&once).unwrap();
        assert_eq!(merged["temperature"], serde_json::json!(0.2));
        assert_eq!(merged["inputs"]["lang"], "en");
        assert_eq!(merged["query"], "USER: \nhi\n");
    }

    #[test]
    fn empty_override_passes_bytes_through() {
        let encoded = b"{\"a\":1}".to_vec();
        let out = apply_param_override(encoded.clone(), None).unwrap();
        assert_eq!(out, Bytes::from(encoded));
    }

    #[test]
    fn override_on_non_object_body_errors() {
        let mut overrides = Map::new();
        overrides.insert("a".to_string(), serde_json::json!(1));
        let err = apply_param_override(b"[1,2]".to_vec(), Some(&overrides)).unwrap_err();
        assert_eq!(err.error.code, "param_override_unmarshal_failed");
    }

    #[test]
    fn model_mapping_renames_only_listed_models() {
        let mapping = r#"{"gpt-4o":"workflow-app"}"#;
        assert_eq!(map_model("gpt-4o", Some(mapping)).unwrap(), "workflow-app");
        assert_eq!(map_model("gpt-4o-mini", Some(mapping)).unwrap(), "gpt-4o-mini");
        assert_eq!(map_model("gpt-4o", None).unwrap(), "gpt-4o");

        let err = map_model("gpt-4o", Some("not json")).unwrap_err();
        assert_eq!(err.error.code, "model_mapped_error");
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn payload_text_follows_relay_mode() {
        let request = GeneralRequest {
            model: "m".to_string(),
            prompt: Some(serde_json::json!(["a", "b"])),
            instruction: Some("fix it".to_string()),
            ..Default::default()
        };
        assert_eq!(payload_text(&request, RelayMode::Completions), "a\nb\n");
        assert_eq!(payload_text(&request, RelayMode::Edits), "fix it");
    }
}
