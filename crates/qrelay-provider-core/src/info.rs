use std::collections::HashMap;

use bytes::Bytes;
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

/// Which OpenAI endpoint family is being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat_completions",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderations => "moderations",
            RelayMode::Edits => "edits",
        }
    }
}

/// Provider family tag; the adapter registry is keyed by this and closed at
/// build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiType {
    Workflow,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Workflow => "workflow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("workflow") {
            Some(ApiType::Workflow)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltInTool {
    WebSearchPreview,
    FileSearch,
}

#[derive(Debug, Clone, Default)]
pub struct BuiltInToolCallInfo {
    pub call_count: i64,
    pub search_context_size: String,
}

/// Built-in tool call counters collected while relaying a responses-API
/// request; settled as fixed per-call prices.
#[derive(Debug, Clone, Default)]
pub struct ResponsesUsageInfo {
    pub built_in_tools: HashMap<BuiltInTool, BuiltInToolCallInfo>,
}

/// Authenticated per-request metadata, produced by the (external) auth
/// middleware and carried as a request extension.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_unlimited: bool,
    pub token_name: String,
    pub token_quota: i64,
    pub channel_id: i64,
    pub group: String,
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
    pub supports_stream_options: bool,
    /// JSON object string of origin model → upstream model renames
    /// configured on the channel, e.g. `{"gpt-4o":"workflow-app"}`.
    pub model_mapping: Option<String>,
    /// Prompt-token count already computed by an earlier middleware, if any.
    pub prompt_tokens: Option<i64>,
    /// Keys shallow-merged over the converted request body.
    pub param_override: Option<Map<String, JsonValue>>,
    /// JSON object string remapping upstream HTTP statuses, e.g. `{"429":"500"}`.
    pub status_code_mapping: Option<String>,
}

/// Mutable per-request relay state. Created at ingress, mutated only by the
/// orchestrator, discarded when the response completes.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_unlimited: bool,
    pub channel_id: i64,
    pub group: String,
    pub relay_mode: RelayMode,
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
    pub origin_model_name: String,
    pub upstream_model_name: String,
    pub prompt_tokens: i64,
    pub is_stream: bool,
    pub supports_stream_options: bool,
    pub should_include_usage: bool,
    pub param_override: Option<Map<String, JsonValue>>,
    pub start_time: OffsetDateTime,
    pub user_quota: i64,
    /// Raw request bytes, retained for pass-through mode.
    pub raw_body: Bytes,
    pub responses_usage: Option<ResponsesUsageInfo>,
}

impl RelayInfo {
    pub fn new(ctx: &RelayContext, relay_mode: RelayMode, raw_body: Bytes) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            token_unlimited: ctx.token_unlimited,
            channel_id: ctx.channel_id,
            group: ctx.group.clone(),
            relay_mode,
            api_type: ctx.api_type,
            base_url: ctx.base_url.clone(),
            api_key: ctx.api_key.clone(),
            origin_model_name: String::new(),
            upstream_model_name: String::new(),
            prompt_tokens: 0,
            is_stream: false,
            supports_stream_options: ctx.supports_stream_options,
            should_include_usage: false,
            param_override: ctx.param_override.clone(),
            start_time: OffsetDateTime::now_utc(),
            user_quota: 0,
            raw_body,
            responses_usage: None,
        }
    }

    pub fn elapsed_seconds(&self) -> i64 {
        (OffsetDateTime::now_utc() - self.start_time).whole_seconds()
    }
}
