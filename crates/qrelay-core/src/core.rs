use std::sync::Arc;

use axum::Router;
use axum::routing::post;

use qrelay_provider_core::{AdapterRegistry, TokenCounter};
use qrelay_storage::{ConsumeLogSink, QuotaLedger};

use crate::handler;
use crate::pricing::PricingResolver;
use crate::sensitive::SensitiveScanner;
use crate::settlement::SettlementConfig;

/// Global relay behavior toggles.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Force `stream_options.include_usage` on streaming requests.
    pub force_stream_option: bool,
    /// Send the raw inbound bytes upstream instead of converting.
    pub pass_through_request: bool,
    pub check_prompt_sensitive: bool,
}

pub struct CoreState {
    pub adapters: AdapterRegistry,
    pub ledger: Arc<dyn QuotaLedger>,
    pub pricing: Arc<dyn PricingResolver>,
    pub counter: Arc<dyn TokenCounter>,
    pub scanner: Arc<dyn SensitiveScanner>,
    pub consume_log: Arc<dyn ConsumeLogSink>,
    pub settlement: SettlementConfig,
    pub options: RelayOptions,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(state: CoreState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(handler::chat_completions))
            .route("/v1/completions", post(handler::completions))
            .route("/v1/embeddings", post(handler::embeddings))
            .route(
                "/v1/engines/{model}/embeddings",
                post(handler::engine_embeddings),
            )
            .route("/v1/moderations", post(handler::moderations))
            .route("/v1/edits", post(handler::edits))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
