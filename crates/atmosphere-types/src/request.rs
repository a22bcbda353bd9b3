use crate::peer::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Complete,
    Error,
}

/// Either a single free-text prompt or a chat-style message list; a request
/// carries exactly one of the two, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    Prompt { prompt: String },
    Messages { messages: Vec<serde_json::Value> },
}

/// A document in `_requests`, inserted by the requester and tombstoned by the
/// requester once a matching response has been observed (or on timeout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDoc {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub body: RequestBody,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub target_peer: Option<PeerId>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub capability_id: Option<String>,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
    pub source: PeerId,
}

/// A document in `_responses`, inserted by the responder and correlated by
/// `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDoc {
    pub request_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Mirrors `RequestDoc`/`ResponseDoc` for `_tool_requests`/`_tool_responses`,
/// adding the `app`/`tool`/`params` fields a tool invocation needs and that a
/// chat completion does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequestDoc {
    pub request_id: Uuid,
    pub app: String,
    pub tool: String,
    pub params: serde_json::Value,
    #[serde(default)]
    pub target_peer: Option<PeerId>,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
    pub source: PeerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponseDoc {
    pub request_id: Uuid,
    pub result: serde_json::Value,
    pub status: ResponseStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}
