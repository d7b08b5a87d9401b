//! Wire types for the workflow-style provider.
//!
//! The provider is not OpenAI-compatible: a chat conversation is folded into
//! a single `query` plus attached `files`, and the streamed reply is a
//! sequence of named SSE events rather than chat-completion chunks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::openai::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

/// `POST {base_url}/v1/chat-messages` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChatMessageRequest {
    pub inputs: Map<String, JsonValue>,
    pub query: String,
    pub response_mode: ResponseMode,
    pub user: String,
    pub auto_generate_name: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<WorkflowFile>,
}

/// How an image reaches the provider: pre-uploaded file id or remote URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    LocalFile,
    RemoteUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowFile {
    pub r#type: String,
    pub transfer_method: TransferMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_file_id: Option<String>,
}

/// `POST {base_url}/v1/files/upload` response.
#[derive(Debug, Clone, Deserialize)]
pub struct FileUploadResponse {
    pub id: String,
}

/// One upstream SSE event, tagged by its `event` field. Events the relay
/// does not understand decode as `Unknown` and are skipped.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowStreamEvent {
    Message {
        #[serde(default)]
        answer: String,
    },
    AgentMessage {
        #[serde(default)]
        answer: String,
    },
    WorkflowStarted {
        #[serde(default)]
        data: WorkflowEventData,
    },
    WorkflowFinished {
        #[serde(default)]
        data: WorkflowEventData,
    },
    NodeStarted {
        #[serde(default)]
        data: NodeEventData,
    },
    NodeFinished {
        #[serde(default)]
        data: NodeEventData,
    },
    MessageEnd {
        #[serde(default)]
        metadata: ChatMessageMetadata,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowEventData {
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeEventData {
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessageMetadata {
    #[serde(default)]
    pub usage: Usage,
}

/// Blocking-mode response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessageResponse {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub metadata: ChatMessageMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_decoding() {
        let event: WorkflowStreamEvent =
            serde_json::from_str(r#"{"event":"message","answer":"hi"}"#).unwrap();
        assert!(matches!(event, WorkflowStreamEvent::Message { answer } if answer == "hi"));

        let event: WorkflowStreamEvent = serde_json::from_str(
            r#"{"event":"node_finished","data":{"node_type":"llm","status":"succeeded"}}"#,
        )
        .unwrap();
        match event {
            WorkflowStreamEvent::NodeFinished { data } => {
                assert_eq!(data.node_type, "llm");
                assert_eq!(data.status, "succeeded");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: WorkflowStreamEvent = serde_json::from_str(
            r#"{"event":"message_end","metadata":{"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}}"#,
        )
        .unwrap();
        match event {
            WorkflowStreamEvent::MessageEnd { metadata } => {
                assert_eq!(metadata.usage.total_tokens, 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let event: WorkflowStreamEvent =
            serde_json::from_str(r#"{"event":"tts_message","audio":"AAAA"}"#).unwrap();
        assert!(matches!(event, WorkflowStreamEvent::Unknown));
    }

    #[test]
    fn chat_message_request_wire_shape() {
        let req = ChatMessageRequest {
            inputs: Map::new(),
            query: "USER: \nhello\n".to_string(),
            response_mode: ResponseMode::Streaming,
            user: "relay-user-7".to_string(),
            auto_generate_name: true,
            files: vec![WorkflowFile {
                r#type: "image/jpeg".to_string(),
                transfer_method: TransferMethod::RemoteUrl,
                url: Some("https://x/cat.jpg".to_string()),
                upload_file_id: None,
            }],
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["response_mode"], "streaming");
        assert_eq!(value["files"][0]["transfer_method"], "remote_url");
        assert!(value["files"][0].get("upload_file_id").is_none());
    }
}
