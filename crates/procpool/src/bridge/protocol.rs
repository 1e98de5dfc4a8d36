//! Wire protocol types for master-worker communication.
//!
//! One message type travels in both directions, tagged by `type`:
//! - `ping` / `pong`: liveness check and reply
//! - `message`: fire-and-forget note
//! - `request` / `response`: correlated by a per-worker `requestId`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IpcError, Result};

/// Identifier of a registered worker.
///
/// Either supplied by the caller at registration or derived from the worker's
/// OS process id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_pid(pid: u32) -> Self {
        Self(pid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-worker request sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Ping,

    Pong,

    /// Fire-and-forget payload, never acknowledged.
    #[serde(rename = "message")]
    Note {
        #[serde(default)]
        content: Value,
    },

    Request {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        content: Value,
    },

    /// Terminal reply to a request. For `status: error`, `content` is the
    /// error description.
    Response {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        status: ResponseStatus,
        #[serde(default)]
        content: Value,
    },
}

impl Message {
    pub fn ping() -> Self {
        Self::Ping
    }

    pub fn pong() -> Self {
        Self::Pong
    }

    pub fn note(content: Value) -> Self {
        Self::Note { content }
    }

    pub fn request(content: Value, request_id: Option<RequestId>) -> Result<Self> {
        let request_id = request_id.ok_or_else(|| {
            IpcError::invalid_argument("request id missing when building a request")
        })?;
        Ok(Self::Request {
            request_id,
            content,
        })
    }

    pub fn response(request: &Message, content: Value) -> Result<Self> {
        Ok(Self::Response {
            request_id: Self::answered_id(request)?,
            status: ResponseStatus::Ok,
            content,
        })
    }

    pub fn error_response(request: &Message, explanation: impl Into<String>) -> Result<Self> {
        Ok(Self::Response {
            request_id: Self::answered_id(request)?,
            status: ResponseStatus::Error,
            content: Value::String(explanation.into()),
        })
    }

    fn answered_id(request: &Message) -> Result<RequestId> {
        match request {
            Self::Request { request_id, .. } => Ok(*request_id),
            other => Err(IpcError::invalid_argument(format!(
                "cannot respond to a {} message",
                other.kind()
            ))),
        }
    }

    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Note { .. } => "message",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
        }
    }
}
