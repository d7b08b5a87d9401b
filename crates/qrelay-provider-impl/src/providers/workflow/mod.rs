use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use qrelay_protocol::openai::{
    ChatCompletionChunk, ChatCompletionObjectType, ChunkChoice, ChunkDelta, GeneralRequest,
    ImageUrl, MediaContent, ResponseMessage, TextResponse, TextResponseChoice, Usage,
};
use qrelay_protocol::sse::SseParser;
use qrelay_protocol::workflow::{
    ChatMessageRequest, ChatMessageResponse, FileUploadResponse, ResponseMode, TransferMethod,
    WorkflowFile, WorkflowStreamEvent,
};
use qrelay_provider_core::{
    Adapter, ApiType, ClientSink, FALLBACK_COUNT_MODEL, RelayError, RelayInfo, RelayResult,
    TokenCounter,
};

use crate::client::{impatient_client, shared_client};

const PROVIDER_TAG: &str = "workflow";
const DEFAULT_REMOTE_IMAGE_MIME: &str = "image/jpeg";
const DEFAULT_UPLOAD_MIME: &str = "image/png";

/// The provider streams its reasoning phase wrapped in this exact HTML
/// block; it is rewritten to `<think>`/`</think>` so clients get one uniform
/// reasoning-boundary convention.
const THINKING_OPEN_SENTINEL: &str = "<details style=\"color:gray;background-color: #f8f8f8;padding: 8px;border-radius: 4px;\" open> <summary> Thinking... </summary>\n";
const THINKING_CLOSE_SENTINEL: &str = "</details>";

/// Adapter for a workflow-style provider: multi-turn chat folds into a
/// single `query` + `files`, replies arrive as named SSE events.
pub struct WorkflowAdapter {
    counter: Arc<dyn TokenCounter>,
    /// When set, workflow/node step events surface as reasoning deltas.
    debug: bool,
}

impl WorkflowAdapter {
    pub fn new(counter: Arc<dyn TokenCounter>, debug: bool) -> Self {
        Self { counter, debug }
    }

    async fn upload_file(
        &self,
        info: &RelayInfo,
        user: &str,
        image: &ImageUrl,
    ) -> Option<WorkflowFile> {
        // strip any "data:image/png;base64," style prefix
        let payload = match image.url.find(',') {
            Some(idx) => &image.url[idx + 1..],
            None => image.url.as_str(),
        };
        let decoded = match BASE64_STANDARD.decode(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "decode",
                    error = %err
                );
                return None;
            }
        };

        let mime = image
            .mime_type
            .as_deref()
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_UPLOAD_MIME);
        let ext = mime.split_once('/').map(|(_, sub)| sub).unwrap_or("png");

        let part = match wreq::multipart::Part::bytes(decoded)
            .file_name(format!("image.{ext}"))
            .mime_str(mime)
        {
            Ok(part) => part,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "form",
                    error = %err
                );
                return None;
            }
        };
        let form = wreq::multipart::Form::new()
            .text("user", user.to_string())
            .part("file", part);

        let url = format!("{}/v1/files/upload", info.base_url.trim_end_matches('/'));
        let client = match impatient_client() {
            Ok(client) => client,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "client",
                    error = %err
                );
                return None;
            }
        };
        let response = match client
            .request(wreq::Method::POST, &url)
            .header(AUTHORIZATION, format!("Bearer {}", info.api_key))
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "send",
                    error = %err
                );
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                event = "workflow_file_upload_failed",
                request_id = %info.request_id,
                stage = "status",
                status = response.status().as_u16()
            );
            return None;
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "read",
                    error = %err
                );
                return None;
            }
        };
        let uploaded: FileUploadResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    event = "workflow_file_upload_failed",
                    request_id = %info.request_id,
                    stage = "parse",
                    error = %err
                );
                return None;
            }
        };

        Some(WorkflowFile {
            r#type: "image".to_string(),
            transfer_method: TransferMethod::LocalFile,
            url: None,
            upload_file_id: Some(uploaded.id),
        })
    }

    async fn stream_handler(
        &self,
        info: &RelayInfo,
        response: wreq::Response,
        sink: &ClientSink,
    ) -> RelayResult<Usage> {
        let created = epoch_seconds();
        let mut parser = SseParser::new();
        let mut state = StreamScanState::default();
        let mut body = response.bytes_stream();

        'scan: while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(
                        event = "workflow_stream_read_failed",
                        request_id = %info.request_id,
                        error = %err
                    );
                    break;
                }
            };
            for event in parser.push_bytes(&chunk) {
                if self.scan_event(&event.data, created, &mut state, sink).await {
                    break 'scan;
                }
            }
        }
        if !state.terminal {
            for event in parser.finish() {
                if self.scan_event(&event.data, created, &mut state, sink).await {
                    break;
                }
            }
        }
        sink.send_done().await;

        Ok(self.finalize_usage(info, state))
    }

    /// Turn the scan state into the usage to settle against: the
    /// `message_end` usage when one arrived, otherwise a synthesis over the
    /// forwarded text; reasoning deltas are billable either way.
    fn finalize_usage(&self, info: &RelayInfo, state: StreamScanState) -> Usage {
        let mut usage = state.usage.unwrap_or_default();
        if usage.total_tokens == 0 {
            usage.prompt_tokens = info.prompt_tokens;
            usage.completion_tokens = self
                .counter
                .count_text(FALLBACK_COUNT_MODEL, &state.response_text)
                .unwrap_or(0);
            usage.completion_tokens += state.node_tokens;
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        } else {
            usage.completion_tokens += state.node_tokens;
        }
        usage
    }

    /// Process one SSE data payload; returns true when the scan is over.
    async fn scan_event(
        &self,
        data: &str,
        created: i64,
        state: &mut StreamScanState,
        sink: &ClientSink,
    ) -> bool {
        let event = match serde_json::from_str::<WorkflowStreamEvent>(data) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = "workflow_stream_decode_failed", error = %err);
                return false;
            }
        };
        match translate_stream_event(event, self.debug, created) {
            Translated::Content(chunk, text) => {
                state.response_text.push_str(&text);
                sink.send_event(&chunk).await;
                false
            }
            Translated::Reasoning(chunk) => {
                state.node_tokens += 1;
                sink.send_event(&chunk).await;
                false
            }
            Translated::Finished(usage) => {
                state.usage = Some(usage);
                state.terminal = true;
                true
            }
            Translated::Aborted => {
                state.terminal = true;
                true
            }
            Translated::Skip => false,
        }
    }

    async fn blocking_handler(
        &self,
        response: wreq::Response,
        sink: &ClientSink,
    ) -> RelayResult<Usage> {
        let body = response.bytes().await.map_err(|err| {
            RelayError::upstream(
                "read_response_body_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;
        let parsed: ChatMessageResponse = serde_json::from_slice(&body).map_err(|err| {
            RelayError::upstream(
                "unmarshal_response_body_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;

        let usage = parsed.metadata.usage.clone();
        let full = TextResponse {
            id: parsed.conversation_id,
            object: ChatCompletionObjectType::ChatCompletion,
            created: epoch_seconds(),
            model: None,
            choices: vec![TextResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: parsed.answer,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: usage.clone(),
        };
        let encoded = serde_json::to_vec(&full).map_err(|err| {
            RelayError::upstream(
                "marshal_response_body_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })?;
        sink.send_bytes(Bytes::from(encoded)).await;
        Ok(usage)
    }
}

#[async_trait]
impl Adapter for WorkflowAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Workflow
    }

    fn init(&self, _info: &mut RelayInfo) {}

    async fn convert_request(
        &self,
        info: &RelayInfo,
        request: &GeneralRequest,
    ) -> RelayResult<JsonValue> {
        let user = stable_user_id(info);
        let inputs = override_inputs(info).unwrap_or_default();

        let mut query = String::new();
        let mut files = Vec::new();
        for message in &request.messages {
            match message.role.as_str() {
                "system" => {
                    query.push_str("SYSTEM: \n");
                    query.push_str(&message.string_content());
                    query.push('\n');
                }
                "assistant" => {
                    query.push_str("ASSISTANT: \n");
                    query.push_str(&message.string_content());
                    query.push('\n');
                }
                _ => {
                    for part in message.parse_content() {
                        match part {
                            MediaContent::Text { text } => {
                                query.push_str("USER: \n");
                                query.push_str(&text);
                                query.push('\n');
                            }
                            MediaContent::ImageUrl { image_url } => {
                                if image_url.is_remote() {
                                    let mime = image_url
                                        .mime_type
                                        .clone()
                                        .filter(|value| !value.is_empty())
                                        .unwrap_or_else(|| {
                                            DEFAULT_REMOTE_IMAGE_MIME.to_string()
                                        });
                                    files.push(WorkflowFile {
                                        r#type: mime,
                                        transfer_method: TransferMethod::RemoteUrl,
                                        url: Some(image_url.url.clone()),
                                        upload_file_id: None,
                                    });
                                } else if let Some(file) =
                                    self.upload_file(info, &user, &image_url).await
                                {
                                    files.push(file);
                                }
                            }
                        }
                    }
                }
            }
        }

        let converted = ChatMessageRequest {
            inputs,
            query,
            response_mode: if info.is_stream {
                ResponseMode::Streaming
            } else {
                ResponseMode::Blocking
            },
            user,
            auto_generate_name: true,
            files,
        };
        serde_json::to_value(&converted).map_err(|err| {
            RelayError::local(
                "convert_request_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            )
        })
    }

    async fn do_request(&self, info: &RelayInfo, body: Bytes) -> RelayResult<wreq::Response> {
        let url = format!("{}/v1/chat-messages", info.base_url.trim_end_matches('/'));
        let client = shared_client()?;
        client
            .request(wreq::Method::POST, &url)
            .header(AUTHORIZATION, format!("Bearer {}", info.api_key))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| {
                RelayError::local(
                    "do_request_failed",
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.to_string(),
                )
            })
    }

    async fn do_response(
        &self,
        info: &mut RelayInfo,
        response: wreq::Response,
        sink: &ClientSink,
    ) -> RelayResult<Usage> {
        if info.is_stream {
            self.stream_handler(info, response, sink).await
        } else {
            self.blocking_handler(response, sink).await
        }
    }
}

#[derive(Debug, Default)]
struct StreamScanState {
    response_text: String,
    node_tokens: i64,
    usage: Option<Usage>,
    terminal: bool,
}

enum Translated {
    /// A content delta; the forwarded text is accumulated for usage
    /// synthesis.
    Content(ChatCompletionChunk, String),
    /// A reasoning delta from a workflow/node step event.
    Reasoning(ChatCompletionChunk),
    /// `message_end` delivered the authoritative usage.
    Finished(Usage),
    /// Upstream reported an error mid-stream; fall back to synthesis.
    Aborted,
    Skip,
}

fn translate_stream_event(event: WorkflowStreamEvent, debug: bool, created: i64) -> Translated {
    match event {
        WorkflowStreamEvent::Message { answer } | WorkflowStreamEvent::AgentMessage { answer } => {
            let answer = rewrite_thinking_sentinels(answer);
            let chunk = content_chunk(created, answer.clone());
            Translated::Content(chunk, answer)
        }
        WorkflowStreamEvent::WorkflowStarted { data } => {
            step_delta(debug, created, format!("Workflow: {}", data.workflow_id))
        }
        WorkflowStreamEvent::WorkflowFinished { data } => step_delta(
            debug,
            created,
            format!("Workflow: {} {}", data.workflow_id, data.status),
        ),
        WorkflowStreamEvent::NodeStarted { data } => {
            step_delta(debug, created, format!("Node: {}", data.node_type))
        }
        WorkflowStreamEvent::NodeFinished { data } => step_delta(
            debug,
            created,
            format!("Node: {} {}", data.node_type, data.status),
        ),
        WorkflowStreamEvent::MessageEnd { metadata } => Translated::Finished(metadata.usage),
        WorkflowStreamEvent::Error { .. } => Translated::Aborted,
        WorkflowStreamEvent::Unknown => Translated::Skip,
    }
}

fn rewrite_thinking_sentinels(answer: String) -> String {
    if answer == THINKING_OPEN_SENTINEL {
        "<think>".to_string()
    } else if answer == THINKING_CLOSE_SENTINEL {
        "</think>".to_string()
    } else {
        answer
    }
}

fn content_chunk(created: i64, content: String) -> ChatCompletionChunk {
    let mut chunk = ChatCompletionChunk::new(created, PROVIDER_TAG);
    chunk.choices.push(ChunkChoice {
        index: 0,
        delta: ChunkDelta {
            role: None,
            content: Some(content),
            reasoning_content: None,
        },
        finish_reason: None,
    });
    chunk
}

fn step_delta(debug: bool, created: i64, text: String) -> Translated {
    if !debug {
        return Translated::Skip;
    }
    let mut chunk = ChatCompletionChunk::new(created, PROVIDER_TAG);
    chunk.choices.push(ChunkChoice {
        index: 0,
        delta: ChunkDelta {
            role: None,
            content: None,
            reasoning_content: Some(format!("{text}\n")),
        },
        finish_reason: None,
    });
    Translated::Reasoning(chunk)
}

fn stable_user_id(info: &RelayInfo) -> String {
    format!("qrelay-user-{}", info.user_id)
}

fn override_inputs(info: &RelayInfo) -> Option<Map<String, JsonValue>> {
    let value = info.param_override.as_ref()?.get("inputs")?;
    match value {
        JsonValue::Object(map) => Some(map.clone()),
        _ => None,
    }
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
