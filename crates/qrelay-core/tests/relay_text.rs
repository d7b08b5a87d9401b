//! End-to-end relay tests against a scripted workflow upstream on loopback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;

use qrelay_core::{
    Core, CoreState, NoopScanner, RelayOptions, RelayResponse, SettlementConfig, StaticPricing,
    relay_text,
};
use qrelay_provider_core::{
    AdapterRegistry, ApiType, RelayContext, RelayMode, TokenCounter, TokenError,
};
use qrelay_provider_impl::register_builtin_adapters;
use qrelay_storage::{MemoryLedger, MemoryLogSink, QuotaLedger};

struct WordCounter;

impl TokenCounter for WordCounter {
    fn count_text(&self, _model: &str, text: &str) -> Result<i64, TokenError> {
        Ok(text.split_whitespace().count() as i64)
    }
}

#[derive(Clone, Default)]
struct UpstreamScript {
    status: u16,
    content_type: &'static str,
    body: &'static str,
    seen_bodies: Arc<Mutex<Vec<String>>>,
}

async fn upstream_handler(State(script): State<UpstreamScript>, body: Bytes) -> Response {
    script
        .seen_bodies
        .lock()
        .unwrap()
        .push(String::from_utf8_lossy(&body).to_string());
    let mut response = Response::new(Body::from(script.body));
    *response.status_mut() = StatusCode::from_u16(script.status).unwrap();
    response.headers_mut().insert(
        CONTENT_TYPE,
        http::HeaderValue::from_static(script.content_type),
    );
    response
}

async fn spawn_upstream(script: UpstreamScript) -> String {
    let router = Router::new()
        .route("/v1/chat-messages", post(upstream_handler))
        .with_state(script);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn make_state(ledger: Arc<MemoryLedger>, log: Arc<MemoryLogSink>) -> Arc<CoreState> {
    let counter: Arc<dyn TokenCounter> = Arc::new(WordCounter);
    let mut adapters = AdapterRegistry::new();
    register_builtin_adapters(&mut adapters, counter.clone(), false);
    let ledger: Arc<dyn QuotaLedger> = ledger;
    Core::new(CoreState {
        adapters,
        ledger,
        pricing: Arc::new(StaticPricing::new(500_000.0)),
        counter,
        scanner: Arc::new(NoopScanner),
        consume_log: log,
        settlement: SettlementConfig::default(),
        options: RelayOptions::default(),
    })
    .state()
}

fn make_ctx(base_url: String) -> RelayContext {
    RelayContext {
        request_id: "req-e2e".to_string(),
        user_id: 1,
        token_id: 2,
        token_unlimited: false,
        token_name: "default".to_string(),
        token_quota: 1_000,
        channel_id: 3,
        group: "default".to_string(),
        api_type: ApiType::Workflow,
        base_url,
        api_key: "sk-test".to_string(),
        supports_stream_options: false,
        model_mapping: Default::default(),
        prompt_tokens: None,
        param_override: None,
        status_code_mapping: None,
    }
}

fn chat_body(stream: bool) -> Bytes {
    Bytes::from(format!(
        r#"{{"model":"workflow-app","messages":[{{"role":"user","content":"hi"}}],"stream":{stream},"max_tokens":100}}"#
    ))
}

async fn collect_stream(response: RelayResponse) -> Vec<String> {
    let RelayResponse::Stream { mut body } = response else {
        panic!("expected a streaming response");
    };
    let mut frames = Vec::new();
    while let Some(chunk) = body.recv().await {
        frames.push(String::from_utf8(chunk.to_vec()).unwrap());
    }
    frames
}

const S1_SSE: &str = "data: {\"event\":\"message\",\"answer\":\"Hello\"}\n\n\
data: {\"event\":\"message\",\"answer\":\" world\"}\n\n\
data: {\"event\":\"message_end\",\"metadata\":{\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}}\n\n";

#[tokio::test]
async fn streaming_chat_delivers_deltas_and_settles_reported_usage() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(1, 1_000);
    ledger.set_token_quota(2, 1_000);
    let log = Arc::new(MemoryLogSink::new());

    let base_url = spawn_upstream(UpstreamScript {
        status: 200,
        content_type: "text/event-stream",
        body: S1_SSE,
        ..Default::default()
    })
    .await;

    let state = make_state(ledger.clone(), log.clone());
    let response = relay_text(
        state,
        make_ctx(base_url),
        RelayMode::ChatCompletions,
        None,
        chat_body(true),
    )
    .await
    .unwrap();

    let frames = collect_stream(response).await;
    assert_eq!(frames.len(), 3);
    assert!(frames[0].starts_with("data: "));
    assert!(frames[0].contains("\"content\":\"Hello\""));
    assert!(frames[1].contains("\"content\":\" world\""));
    assert_eq!(frames[2], "data: [DONE]\n\n");

    // settlement runs after the stream; charge is the reported 7 tokens
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ledger.user_quota(1), 1_000 - 7);
    assert_eq!(ledger.token_quota(2), 1_000 - 7);
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].quota, 7);
    assert_eq!(entries[0].prompt_tokens, 5);
    assert!(entries[0].is_stream);
}

const S2_SSE: &str = "data: {\"event\":\"message\",\"answer\":\"Hello\"}\n\n\
data: {\"event\":\"message\",\"answer\":\" world\"}\n\n";

#[tokio::test]
async fn missing_terminal_event_synthesizes_usage() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(1, 1_000);
    ledger.set_token_quota(2, 1_000);
    let log = Arc::new(MemoryLogSink::new());

    let base_url = spawn_upstream(UpstreamScript {
        status: 200,
        content_type: "text/event-stream",
        body: S2_SSE,
        ..Default::default()
    })
    .await;

    let state = make_state(ledger.clone(), log.clone());
    let response = relay_text(
        state,
        make_ctx(base_url),
        RelayMode::ChatCompletions,
        None,
        chat_body(true),
    )
    .await
    .unwrap();
    let frames = collect_stream(response).await;
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    // prompt from relay info ("user" + "hi" = 2 words), completion counted
    // over "Hello world"
    assert_eq!(entries[0].prompt_tokens, 2);
    assert_eq!(entries[0].completion_tokens, 2);
    assert_eq!(entries[0].quota, 4);
    assert_eq!(ledger.user_quota(1), 1_000 - 4);
}

const BLOCKING_JSON: &str = r#"{"conversation_id":"conv-1","message_id":"msg-1","answer":"hi there","metadata":{"usage":{"prompt_tokens":5,"completion_tokens":3,"total_tokens":8}}}"#;

#[tokio::test]
async fn blocking_chat_returns_openai_envelope() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(1, 1_000);
    ledger.set_token_quota(2, 1_000);
    let log = Arc::new(MemoryLogSink::new());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let base_url = spawn_upstream(UpstreamScript {
        status: 200,
        content_type: "application/json",
        body: BLOCKING_JSON,
        seen_bodies: seen.clone(),
    })
    .await;

    let state = make_state(ledger.clone(), log.clone());
    let response = relay_text(
        state,
        make_ctx(base_url),
        RelayMode::ChatCompletions,
        None,
        chat_body(false),
    )
    .await
    .unwrap();

    let RelayResponse::Json { status, body } = response else {
        panic!("expected a buffered response");
    };
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["id"], "conv-1");
    assert_eq!(parsed["choices"][0]["message"]["content"], "hi there");
    assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
    assert_eq!(parsed["usage"]["total_tokens"], 8);

    // a non-streaming caller produces a blocking-mode upstream request
    let sent = seen.lock().unwrap();
    let upstream_request: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(upstream_request["response_mode"], "blocking");
    assert_eq!(upstream_request["query"], "USER: \nhi\n");

    // buffered settlement runs inline
    assert_eq!(ledger.user_quota(1), 1_000 - 8);
    assert_eq!(log.entries()[0].quota, 8);
}

const RATE_LIMIT_BODY: &str =
    r#"{"error":{"message":"slow down","type":"requests","code":"rate_limit_exceeded"}}"#;

#[tokio::test]
async fn upstream_error_is_mapped_and_pre_consume_refunded() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(1, 1_000);
    ledger.set_token_quota(2, 1_000);
    let log = Arc::new(MemoryLogSink::new());

    let base_url = spawn_upstream(UpstreamScript {
        status: 429,
        content_type: "application/json",
        body: RATE_LIMIT_BODY,
        ..Default::default()
    })
    .await;

    let state = make_state(ledger.clone(), log.clone());
    let mut ctx = make_ctx(base_url);
    ctx.status_code_mapping = Some(r#"{"429":"503"}"#.to_string());
    let err = relay_text(
        state,
        ctx,
        RelayMode::ChatCompletions,
        None,
        chat_body(true),
    )
    .await
    .unwrap_err();

    assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.error.code, "rate_limit_exceeded");
    assert_eq!(err.error.message, "slow down");

    // the 102-unit pre-consume (2 prompt words + 100 max_tokens) comes back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ledger.user_quota(1), 1_000);
    assert_eq!(ledger.token_quota(2), 1_000);
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn sse_content_type_upgrades_a_non_streaming_request() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.set_user_quota(1, 1_000);
    ledger.set_token_quota(2, 1_000);
    let log = Arc::new(MemoryLogSink::new());

    // upstream answers a blocking request with an event stream anyway
    let base_url = spawn_upstream(UpstreamScript {
        status: 200,
        content_type: "text/event-stream",
        body: S1_SSE,
        ..Default::default()
    })
    .await;

    let state = make_state(ledger.clone(), log.clone());
    let response = relay_text(
        state,
        make_ctx(base_url),
        RelayMode::ChatCompletions,
        None,
        chat_body(false),
    )
    .await
    .unwrap();

    let frames = collect_stream(response).await;
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
}
