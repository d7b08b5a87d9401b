use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;

use qrelay_protocol::openai::{GeneralRequest, Usage};

use crate::error::RelayResult;
use crate::info::{ApiType, RelayInfo};
use crate::sink::ClientSink;

/// The translation contract every provider adapter satisfies.
///
/// Adapters own their transport: `do_request` may choose any method, headers
/// and URL, and may run side-channel calls (e.g. file uploads) during
/// `convert_request`. `do_response` must fully consume the upstream body,
/// write every client-facing byte to the sink (including SSE framing when
/// streaming) and return the final usage.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn api_type(&self) -> ApiType;

    /// Bind the per-request context. Called once before any other method.
    fn init(&self, info: &mut RelayInfo);

    /// Translate the normalized OpenAI request into the provider-native
    /// payload. Skipped when pass-through mode sends the raw bytes instead.
    async fn convert_request(
        &self,
        info: &RelayInfo,
        request: &GeneralRequest,
    ) -> RelayResult<JsonValue>;

    /// Transmit the prepared body and return the raw provider response.
    async fn do_request(&self, info: &RelayInfo, body: Bytes) -> RelayResult<wreq::Response>;

    /// Consume the provider response, writing the translated bytes to the
    /// client sink, and return the usage to settle against.
    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: wreq::Response,
        sink: &ClientSink,
    ) -> RelayResult<Usage>;
}

/// Build-time-closed map from API type to adapter instance.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ApiType, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.api_type(), adapter);
    }

    pub fn get(&self, api_type: ApiType) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&api_type).cloned()
    }
}
