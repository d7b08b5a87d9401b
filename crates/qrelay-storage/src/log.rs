use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

/// One settlement record. Emitted for every request that reaches
/// post-consume, including zero-token failures, so silent upstream failures
/// stay observable.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeLogEntry {
    pub request_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub token_name: String,
    /// Model name after generic bucketing (gizmo variants collapse).
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub pre_consumed_quota: i64,
    pub user_quota: i64,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub group: String,
    pub content: String,
    /// Ratio snapshot and tool-call side notes.
    pub other: JsonValue,
}

/// Consumption-log destination. Recording is best-effort and must never
/// fail the request path.
pub trait ConsumeLogSink: Send + Sync {
    fn record(&self, entry: ConsumeLogEntry);
}

/// Emits each entry as one structured tracing event keyed by `request_id`.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl TracingLogSink {
    pub fn new() -> Self {
        Self
    }
}

impl ConsumeLogSink for TracingLogSink {
    fn record(&self, entry: ConsumeLogEntry) {
        info!(
            event = "consume_log",
            request_id = %entry.request_id,
            user_id = entry.user_id,
            channel_id = entry.channel_id,
            token_id = entry.token_id,
            model = %entry.model,
            prompt_tokens = entry.prompt_tokens,
            completion_tokens = entry.completion_tokens,
            quota = entry.quota,
            pre_consumed_quota = entry.pre_consumed_quota,
            use_time_seconds = entry.use_time_seconds,
            is_stream = entry.is_stream,
            group = %entry.group,
            content = %entry.content,
            other = %entry.other,
        );
    }
}

/// Collects entries in memory; used by tests to assert settlement effects.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<ConsumeLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ConsumeLogEntry> {
        self.entries.lock().expect("log lock").clone()
    }
}

impl ConsumeLogSink for MemoryLogSink {
    fn record(&self, entry: ConsumeLogEntry) {
        self.entries.lock().expect("log lock").push(entry);
    }
}
