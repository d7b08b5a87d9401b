use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use qrelay_core::{Core, CoreState, NoopScanner, RelayOptions, SettlementConfig, StaticPricing};
use qrelay_core::{SensitiveScanner, WordListScanner};
use qrelay_provider_core::{AdapterRegistry, TiktokenCounter, TokenCounter};
use qrelay_provider_impl::register_builtin_adapters;
use qrelay_storage::{MemoryLedger, TracingLogSink};

mod context;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let channel = context::ChannelConfig::from_env()?;

    // standalone mode: an in-memory ledger seeded from the environment
    // stands in for the external store
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(context::DEMO_USER_ID, channel.user_quota);
    ledger.set_token_quota(context::DEMO_TOKEN_ID, channel.token_quota);

    let counter: Arc<dyn TokenCounter> = Arc::new(TiktokenCounter::new());
    let mut adapters = AdapterRegistry::new();
    register_builtin_adapters(&mut adapters, counter.clone(), channel.workflow_debug);

    let scanner: Arc<dyn SensitiveScanner> = if channel.sensitive_words.is_empty() {
        Arc::new(NoopScanner)
    } else {
        Arc::new(WordListScanner::new(channel.sensitive_words.clone()))
    };

    let core = Core::new(CoreState {
        adapters,
        ledger: ledger.clone(),
        pricing: Arc::new(StaticPricing::new(500_000.0)),
        counter,
        scanner,
        consume_log: Arc::new(TracingLogSink::new()),
        settlement: SettlementConfig::default(),
        options: RelayOptions {
            force_stream_option: channel.force_stream_option,
            pass_through_request: channel.pass_through_request,
            check_prompt_sensitive: !channel.sensitive_words.is_empty(),
        },
    });

    let app = core
        .router()
        .layer(axum::middleware::from_fn_with_state(
            Arc::new(channel.clone()),
            context::inject_relay_context,
        ));

    let listener = tokio::net::TcpListener::bind(&channel.bind).await?;
    tracing::info!(event = "listening", bind = %channel.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
