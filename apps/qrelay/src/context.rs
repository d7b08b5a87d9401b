use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use qrelay_provider_core::{ApiType, RelayContext};

pub const DEMO_USER_ID: i64 = 1;
pub const DEMO_TOKEN_ID: i64 = 1;
const DEMO_CHANNEL_ID: i64 = 1;

/// Standalone channel configuration, read from the environment. In a full
/// deployment this comes from the channel store behind the (out-of-scope)
/// auth middleware.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub bind: String,
    pub base_url: String,
    pub api_key: String,
    pub model_mapping: Option<String>,
    pub user_quota: i64,
    pub token_quota: i64,
    pub workflow_debug: bool,
    pub force_stream_option: bool,
    pub pass_through_request: bool,
    pub sensitive_words: Vec<String>,
}

impl ChannelConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("QRELAY_UPSTREAM_BASE_URL")
            .context("QRELAY_UPSTREAM_BASE_URL is required")?;
        let api_key = std::env::var("QRELAY_UPSTREAM_API_KEY")
            .context("QRELAY_UPSTREAM_API_KEY is required")?;

        let model_mapping = std::env::var("QRELAY_MODEL_MAPPING").ok();
        let sensitive_words = std::env::var("QRELAY_SENSITIVE_WORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|word| word.trim().to_string())
                    .filter(|word| !word.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind: env_or("QRELAY_BIND", "127.0.0.1:3000"),
            base_url,
            api_key,
            model_mapping,
            user_quota: env_parse_or("QRELAY_USER_QUOTA", 10_000_000),
            token_quota: env_parse_or("QRELAY_TOKEN_QUOTA", 10_000_000),
            workflow_debug: env_flag("QRELAY_WORKFLOW_DEBUG"),
            force_stream_option: env_flag("QRELAY_FORCE_STREAM_OPTION"),
            pass_through_request: env_flag("QRELAY_PASS_THROUGH_REQUEST"),
            sensitive_words,
        })
    }
}

/// Build the relay context every handler expects. A production deployment
/// replaces this with the real authentication middleware; the shape of the
/// extension is the contract, not this implementation.
pub async fn inject_relay_context(
    State(channel): State<Arc<ChannelConfig>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let param_override = headers
        .get("x-qrelay-param-override")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| serde_json::from_str(raw).ok());
    let status_code_mapping = headers
        .get("x-qrelay-status-code-mapping")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let ctx = RelayContext {
        request_id,
        user_id: DEMO_USER_ID,
        token_id: DEMO_TOKEN_ID,
        token_unlimited: false,
        token_name: "standalone".to_string(),
        token_quota: channel.token_quota,
        channel_id: DEMO_CHANNEL_ID,
        group: "default".to_string(),
        api_type: ApiType::Workflow,
        base_url: channel.base_url.clone(),
        api_key: channel.api_key.clone(),
        supports_stream_options: false,
        model_mapping: channel.model_mapping.clone(),
        prompt_tokens: None,
        param_override,
        status_code_mapping,
    };
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}
