//! Transport boundary
//!
//! A transport session is a duplex channel to one server process. It carries
//! synchronous request/reply exchanges and pushes server-originated worker
//! events into the channel handed to it at open time. The connection manager
//! owns the session; nothing else holds one across a reconnect.

pub mod websocket;

#[cfg(test)]
pub(crate) mod fixture;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{RequestId, SessionIdentity, Term, WorkerId};
use crate::worker::Priority;

pub use websocket::{WebSocketFactory, WebSocketTransport};

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The session is gone; reconnecting may help
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The server evaluated the request and reported a failure
    #[error("server error: {0}")]
    Server(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Protocol(format!("MessagePack encode error: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Protocol(format!("MessagePack decode error: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => Self::Closed(err.to_string()),
            Error::Io(_) | Error::Url(_) | Error::Http(_) => {
                Self::Unreachable(format!("WebSocket connect failed: {err}"))
            }
            other => Self::Protocol(format!("WebSocket error: {other}")),
        }
    }
}

/// Client → server request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// Evaluate a command and reply with its value
    Eval { command: Term },
    /// Start an asynchronous task. The reply is only an acknowledgement;
    /// progress arrives as [`ServerEvent`]s tagged with `request_id`.
    Submit {
        request_id: RequestId,
        command: Term,
        priority: Priority,
        timeout_ms: u64,
        incremental: bool,
    },
    /// Ask the task to wind down through its normal termination path
    Cancel {
        request_id: RequestId,
        worker_id: Option<WorkerId>,
    },
    /// Kill the task without further messaging
    Abort {
        request_id: RequestId,
        worker_id: Option<WorkerId>,
    },
}

impl Request {
    pub fn eval(command: Term) -> Self {
        Self::Eval { command }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Eval { .. } => "eval",
            Self::Submit { .. } => "submit",
            Self::Cancel { .. } => "cancel",
            Self::Abort { .. } => "abort",
        }
    }
}

/// How the server says a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStatus {
    Completed,
    Aborted,
    Errored,
    TimedOut,
}

/// Server-originated task event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Started {
        request_id: RequestId,
        worker_id: WorkerId,
    },
    DataAvailable {
        request_id: RequestId,
        payload: Term,
    },
    Terminated {
        request_id: RequestId,
        status: TerminationStatus,
        payload: Option<Term>,
        error: Option<String>,
    },
}

impl ServerEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Started { request_id, .. }
            | Self::DataAvailable { request_id, .. }
            | Self::Terminated { request_id, .. } => *request_id,
        }
    }
}

/// Where a session pushes server events. Dropping every sender ends the
/// connection's dispatch loop.
pub type EventSender = mpsc::Sender<ServerEvent>;

/// One live duplex session
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Send a request and wait for its reply
    async fn send(&self, request: Request) -> Result<Term, TransportError>;

    /// Cheap liveness check; false once the session is known to be broken
    fn is_valid(&self) -> bool;

    /// Tear the session down and drop its event sender
    async fn close(&self);
}

/// Opens sessions to a server
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        identity: &SessionIdentity,
        events: EventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}
