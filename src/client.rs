//! Client facade
//!
//! `ReasonerClient` is the explicit context object callers thread through
//! their code: it owns the connection to one server and hands out workers
//! and queries bound to it.

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, InvalidationListener};
use crate::inference::{Query, QueryProperties};
use crate::transport::{Request, TransportFactory, WebSocketFactory};
use crate::types::{ImageFingerprint, Result, SessionIdentity, Term};
use crate::worker::{Worker, WorkerOptions};

#[derive(Debug)]
pub struct ReasonerClient {
    connection: Arc<ConnectionManager>,
}

impl ReasonerClient {
    /// Connect through any transport
    pub async fn connect(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let connection = ConnectionManager::connect(config, factory).await?;
        Ok(Self { connection })
    }

    /// Connect over WebSocket to `ws://host:base_port`
    pub async fn connect_websocket(config: ClientConfig) -> Result<Self> {
        let factory = Arc::new(WebSocketFactory::new(config.request_timeout()));
        Self::connect(config, factory).await
    }

    pub fn identity(&self) -> &SessionIdentity {
        self.connection.identity()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Evaluate one command synchronously
    pub async fn converse(&self, command: Term) -> Result<Term> {
        self.connection
            .converse_with_retry(Request::eval(command))
            .await
    }

    /// A worker for `command`, not yet started
    pub fn worker(&self, command: Term, options: WorkerOptions) -> Worker {
        Worker::new(Arc::clone(&self.connection), command, options)
    }

    /// A query, not yet started. Call [`Query::close`] when done with it.
    pub fn query(&self, sentence: Term, context: Term, properties: QueryProperties) -> Query {
        Query::new(Arc::clone(&self.connection), sentence, context, properties)
    }

    /// Register for server image changes across reconnects
    pub fn on_image_change(&self, listener: Arc<dyn InvalidationListener>) {
        self.connection.add_invalidation_listener(listener);
    }

    pub fn fingerprint(&self) -> Option<ImageFingerprint> {
        self.connection.fingerprint()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}
