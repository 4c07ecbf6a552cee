//! WebSocket transport
//!
//! One WebSocket per session, MessagePack envelopes in binary frames.
//! Replies are correlated by envelope id; task events are forwarded to the
//! connection's dispatcher. Reconnection is not handled here: a broken socket
//! just marks the session invalid and the connection manager replaces it.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::{EventSender, Request, ServerEvent, TransportError, TransportFactory, TransportSession};
use crate::types::{SessionIdentity, Term};

type Pending = Arc<DashMap<u64, oneshot::Sender<Result<Term, TransportError>>>>;

#[derive(Debug, Serialize, Deserialize)]
struct ClientEnvelope {
    id: u64,
    request: Request,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ServerEnvelope {
    Reply { id: u64, result: Term },
    Failure { id: u64, message: String },
    Event { event: ServerEvent },
}

/// Opens [`WebSocketTransport`] sessions
pub struct WebSocketFactory {
    request_timeout: Duration,
}

impl WebSocketFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl TransportFactory for WebSocketFactory {
    async fn open(
        &self,
        identity: &SessionIdentity,
        events: EventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let transport =
            WebSocketTransport::connect(&identity.url(), events, self.request_timeout).await?;
        Ok(Arc::new(transport))
    }
}

/// WebSocket session to a reasoning server
pub struct WebSocketTransport {
    url: String,
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
    valid: Arc<AtomicBool>,
    request_timeout: Duration,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connect and start the socket I/O task
    pub async fn connect(
        url: &str,
        events: EventSender,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!("Connecting to reasoning server at {}", url);

        let (ws, _) = connect_async(url).await?;

        let (outgoing, outgoing_rx) = mpsc::channel::<Vec<u8>>(1000);
        let pending: Pending = Arc::new(DashMap::new());
        let valid = Arc::new(AtomicBool::new(true));

        let io_task = tokio::spawn(io_loop(
            url.to_string(),
            ws,
            outgoing_rx,
            events,
            Arc::clone(&pending),
            Arc::clone(&valid),
        ));

        info!("Connected to reasoning server at {}", url);

        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            valid,
            request_timeout,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportSession for WebSocketTransport {
    async fn send(&self, request: Request) -> Result<Term, TransportError> {
        if !self.is_valid() {
            return Err(TransportError::Closed(format!("session to {} is closed", self.url)));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let frame = rmp_serde::to_vec_named(&ClientEnvelope { id, request })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);

        if self.outgoing.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(TransportError::Closed("socket writer stopped".into()));
        }
        debug!(id, kind, "Request sent");

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed("reply channel dropped".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.valid.store(false, Ordering::Release);
        if let Some(task) = self.io_task.lock().await.take() {
            task.abort();
        }
        fail_pending(&self.pending, "session closed by client");
        debug!("Closed session to {}", self.url);
    }
}

/// Pump frames between the request channel and the socket until either side ends
async fn io_loop(
    url: String,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: EventSender,
    pending: Pending,
    valid: Arc<AtomicBool>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    error!("Failed to send to reasoning server: {}", e);
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if !route_frame(&data, &pending, &events).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Reasoning server closed connection: {:?}", frame);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("Reasoning server WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    valid.store(false, Ordering::Release);
    fail_pending(&pending, "connection lost");
    warn!("Session to {} ended", url);
    // `events` drops here, which ends the connection's dispatcher.
}

/// Returns false when the event consumer is gone
async fn route_frame(data: &[u8], pending: &Pending, events: &EventSender) -> bool {
    let envelope = match decode_frame(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping undecodable frame ({} bytes): {}", data.len(), e);
            return true;
        }
    };

    match envelope {
        ServerEnvelope::Reply { id, result } => match pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(result));
            }
            None => warn!(id, "Reply with no pending request"),
        },
        ServerEnvelope::Failure { id, message } => match pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(TransportError::Server(message)));
            }
            None => warn!(id, "Failure with no pending request: {}", message),
        },
        ServerEnvelope::Event { event } => {
            if events.send(event).await.is_err() {
                debug!("Event dispatcher gone, stopping reader");
                return false;
            }
        }
    }
    true
}

fn decode_frame(data: &[u8]) -> Result<ServerEnvelope, TransportError> {
    Ok(rmp_serde::from_slice(data)?)
}

fn fail_pending(pending: &Pending, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Closed(reason.to_string())));
        }
    }
}
