//! Reasoner client - sessions, workers and continuable queries against a
//! remote symbolic-reasoning server
//!
//! ## Layers
//!
//! - [`transport`]: duplex sessions carrying commands, replies and worker
//!   events (WebSocket + MessagePack in production)
//! - [`connection`]: one leased session per server with reconnect,
//!   single retry and image-change detection
//! - [`worker`]: asynchronous, cancelable, deadline-bound commands
//! - [`inference`]: queries that run, suspend and continue, plus the
//!   result-set cursor over their answers
//! - [`client`] / [`registry`]: the caller-facing context objects

pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod inference;
pub mod logging;
pub mod registry;
pub mod transport;
pub mod types;
pub mod worker;

mod listeners;
mod sync;

pub use client::ReasonerClient;
pub use config::{ClientConfig, ConnectionArgs};
pub use connection::{ConnectionManager, InvalidationListener, LeaseManager};
pub use inference::{
    AnswerId, BindingSet, InferenceAnswer, InferenceMode, InferenceStatus, Query, QueryListener,
    QueryProperties, ResultSet, ResultSortOrder, SuspendReason,
};
pub use registry::ClientRegistry;
pub use transport::{Request, ServerEvent, TerminationStatus, TransportError, TransportFactory, TransportSession};
pub use types::{ClientError, ImageFingerprint, InferenceId, RequestId, Result, SessionIdentity, Term, Variable, WorkerId};
pub use worker::{Priority, Worker, WorkerEvent, WorkerEventKind, WorkerListener, WorkerOptions, WorkerStatus};
