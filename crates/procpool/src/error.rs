use thiserror::Error;

use crate::bridge::protocol::{RequestId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid process identifier: {0}")]
    UnknownWorker(WorkerId),

    #[error("process identifier missing when sending request")]
    MissingWorkerId,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request {request_id} to worker {worker_id} timed out")]
    RequestTimeout {
        worker_id: WorkerId,
        request_id: RequestId,
    },

    #[error("ping to worker {0} timed out")]
    PingTimeout(WorkerId),

    /// The worker's request handler failed; carries the description it sent back.
    #[error("{0}")]
    Handler(String),

    /// The worker's channel ended while the request was outstanding.
    #[error("worker {0} exited before responding")]
    WorkerGone(WorkerId),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("master event loop is not running")]
    Closed,
}

impl IpcError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
