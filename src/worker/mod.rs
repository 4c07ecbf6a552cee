//! Asynchronous units of server work
//!
//! A [`Worker`] wraps one command submitted for asynchronous evaluation. The
//! server acknowledges the submission, then streams `started`,
//! `data-available` and `terminated` events which the connection's dispatch
//! task routes back here. Listeners see those events in order, and never see
//! anything after the single terminated notification.
//!
//! Local deadlines and aborts race the server's own events. Both sides go
//! through the same delivery lock and the same once-only terminal
//! transition, so whichever wins is the only outcome listeners observe.

mod listener;
mod status;

pub use listener::{listener_fn, FnListener, WorkerEvent, WorkerEventKind, WorkerListener};
pub use status::{Priority, WorkerOptions, WorkerStatus};

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::dispatcher::EventSink;
use crate::connection::ConnectionManager;
use crate::listeners::{invoke_guarded, ListenerList};
use crate::sync::lock;
use crate::transport::{Request, ServerEvent, TerminationStatus};
use crate::types::{ClientError, RequestId, Result, Term, WorkerId};

/// Handle to one submitted command. Clones share the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    request_id: RequestId,
    command: Term,
    options: WorkerOptions,
    connection: Arc<ConnectionManager>,
    state: Mutex<WorkerState>,
    listeners: ListenerList<dyn WorkerListener>,
    /// Published after the terminated listeners have run
    status_tx: watch::Sender<WorkerStatus>,
    /// Serialises event delivery against local abort and timeout
    delivery: Mutex<()>,
    delivering_on: Mutex<Option<ThreadId>>,
}

#[derive(Default)]
struct WorkerState {
    status: WorkerStatus,
    worker_id: Option<WorkerId>,
    result: Option<Term>,
    failure: Option<ClientError>,
    abort_sent: bool,
}

struct DeliveryGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *lock(self.owner) = None;
    }
}

impl Worker {
    pub fn new(connection: Arc<ConnectionManager>, command: Term, options: WorkerOptions) -> Self {
        let (status_tx, _) = watch::channel(WorkerStatus::NotStarted);
        Self {
            inner: Arc::new(WorkerInner {
                request_id: connection.next_request_id(),
                command,
                options,
                connection,
                state: Mutex::new(WorkerState::default()),
                listeners: ListenerList::new(),
                status_tx,
                delivery: Mutex::new(()),
                delivering_on: Mutex::new(None),
            }),
        }
    }

    /// Client-side correlation id
    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    /// Server-side task id, once the server has started the task
    pub fn id(&self) -> Option<WorkerId> {
        lock(&self.inner.state).worker_id
    }

    pub fn command(&self) -> &Term {
        &self.inner.command
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.inner.options
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    /// Final payload of a completed worker
    pub fn result(&self) -> Option<Term> {
        lock(&self.inner.state).result.clone()
    }

    /// Why the worker did not complete
    pub fn failure(&self) -> Option<ClientError> {
        lock(&self.inner.state).failure.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkerListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn WorkerListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Submit the command. Returns once the server has acknowledged it (or
    /// the worker has already finished, e.g. by timing out first).
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if state.status != WorkerStatus::NotStarted {
                return Err(ClientError::InvalidState(format!(
                    "worker {} cannot start while {}",
                    inner.request_id, state.status
                )));
            }
            state.status = WorkerStatus::Working;
        }
        inner.status_tx.send_replace(WorkerStatus::Working);

        inner
            .connection
            .routes()
            .register(inner.request_id, Arc::clone(inner) as Arc<dyn EventSink>);
        inner.spawn_watchdog();

        let request = Request::Submit {
            request_id: inner.request_id,
            command: inner.command.clone(),
            priority: inner.options.priority,
            timeout_ms: inner.options.timeout.as_millis() as u64,
            incremental: inner.options.incremental,
        };
        debug!(request_id = %inner.request_id, "Submitting worker");

        tokio::select! {
            outcome = inner
                .connection
                .converse_tracked(request, inner.options.ignore_invalid_lease) => match outcome {
                Ok((_, generation)) => {
                    if !inner.connection.routes().bind(inner.request_id, generation) {
                        inner.fail(ClientError::Connection(
                            "connection lost before the submission was acknowledged".to_string(),
                        ));
                    }
                    Ok(())
                }
                Err(e) => {
                    inner.fail(e.clone());
                    Err(e)
                }
            },
            _ = inner.wait_done() => Ok(()),
        }
    }

    /// Ask the server to wind the task down. The worker still terminates
    /// through the server's normal terminated event.
    pub async fn cancel(&self) -> Result<()> {
        let worker_id = {
            let state = lock(&self.inner.state);
            if !state.status.is_working() {
                return Ok(());
            }
            state.worker_id
        };
        info!(request_id = %self.inner.request_id, "Cancelling worker");
        self.inner
            .connection
            .converse(
                Request::Cancel {
                    request_id: self.inner.request_id,
                    worker_id,
                },
                self.inner.options.ignore_invalid_lease,
            )
            .await?;
        Ok(())
    }

    /// Hard stop. Terminates locally with `Aborted` right away, then tells the
    /// server. Later server events for this worker are ignored.
    pub async fn abort(&self) {
        let stopped = self.inner.halt(
            WorkerStatus::Aborted,
            ClientError::Aborted(format!("worker {} aborted by client", self.inner.request_id)),
        );
        if stopped {
            info!(request_id = %self.inner.request_id, "Worker aborted");
            self.inner.send_abort().await;
        }
    }

    /// Wait for a terminal status without starting the worker
    pub async fn wait_until_done(&self) -> WorkerStatus {
        if self.status() == WorkerStatus::NotStarted {
            return WorkerStatus::NotStarted;
        }
        self.inner.wait_done().await
    }

    /// Wait for the worker to finish and return its final payload
    pub async fn await_completion(&self) -> Result<Term> {
        if self.status() == WorkerStatus::NotStarted {
            return Err(ClientError::InvalidState(format!(
                "worker {} has not been started",
                self.inner.request_id
            )));
        }
        let status = self.inner.wait_done().await;

        let state = lock(&self.inner.state);
        match status {
            WorkerStatus::Completed => Ok(state.result.clone().unwrap_or(Term::Nil)),
            _ => Err(state.failure.clone().unwrap_or_else(|| {
                ClientError::Aborted(format!("worker {} ended {}", self.inner.request_id, status))
            })),
        }
    }

    /// Start if needed, then wait for the result
    pub async fn get_work(&self) -> Result<Term> {
        if self.status() == WorkerStatus::NotStarted {
            self.start().await?;
        }
        self.await_completion().await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("request_id", &self.inner.request_id)
            .field("worker_id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl WorkerInner {
    fn status(&self) -> WorkerStatus {
        lock(&self.state).status
    }

    /// Take the delivery lock unless this thread already holds it (a listener
    /// calling back into its own worker)
    fn enter_delivery(&self) -> Option<DeliveryGuard<'_>> {
        let me = thread::current().id();
        if *lock(&self.delivering_on) == Some(me) {
            return None;
        }
        let guard = lock(&self.delivery);
        *lock(&self.delivering_on) = Some(me);
        Some(DeliveryGuard {
            _lock: guard,
            owner: &self.delivering_on,
        })
    }

    async fn wait_done(&self) -> WorkerStatus {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|s| s.is_done()).await;
        self.status()
    }

    /// Move to a terminal status once; later calls are no-ops
    fn conclude(
        &self,
        status: WorkerStatus,
        result: Option<Term>,
        failure: Option<ClientError>,
    ) -> bool {
        let event = {
            let mut state = lock(&self.state);
            if state.status.is_done() {
                return false;
            }
            state.status = status;
            state.result = result.clone();
            state.failure = failure.clone();
            WorkerEvent {
                request_id: self.request_id,
                worker_id: state.worker_id,
                kind: WorkerEventKind::Terminated {
                    status,
                    result,
                    error: failure,
                },
            }
        };
        self.connection.routes().remove(self.request_id);
        debug!(request_id = %self.request_id, %status, "Worker terminated");

        self.fire(&event);
        self.status_tx.send_replace(status);
        true
    }

    fn fail(&self, error: ClientError) -> bool {
        let _delivery = self.enter_delivery();
        self.conclude(WorkerStatus::Errored, None, Some(error))
    }

    /// Local terminal transition for abort and timeout
    fn halt(&self, status: WorkerStatus, error: ClientError) -> bool {
        let _delivery = self.enter_delivery();
        if !self.status().is_working() {
            return false;
        }
        self.conclude(status, None, Some(error))
    }

    fn fire(&self, event: &WorkerEvent) {
        for listener in self.listeners.snapshot() {
            match &event.kind {
                WorkerEventKind::Started => {
                    if self.status().is_done() {
                        break;
                    }
                    invoke_guarded("started", || listener.notify_started(event));
                }
                WorkerEventKind::DataAvailable(_) => {
                    if self.status().is_done() {
                        break;
                    }
                    invoke_guarded("data-available", || listener.notify_data_available(event));
                }
                WorkerEventKind::Terminated { .. } => {
                    invoke_guarded("terminated", || listener.notify_terminated(event));
                }
            }
        }
    }

    /// Tell the server to kill the task, at most once per worker
    async fn send_abort(&self) {
        let worker_id = {
            let mut state = lock(&self.state);
            if state.abort_sent {
                return;
            }
            state.abort_sent = true;
            state.worker_id
        };
        let request = Request::Abort {
            request_id: self.request_id,
            worker_id,
        };
        let limit = self.connection.config().request_timeout();
        match tokio::time::timeout(limit, self.connection.converse(request, true)).await {
            Ok(Ok(_)) => debug!(request_id = %self.request_id, "Abort delivered"),
            Ok(Err(e)) => warn!(request_id = %self.request_id, "Failed to deliver abort: {}", e),
            Err(_) => warn!(request_id = %self.request_id, "Abort not acknowledged within {:?}", limit),
        }
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let limit = self.options.timeout;
        if limit.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut status_rx = self.status_tx.subscribe();

        tokio::spawn(async move {
            let finished = tokio::time::timeout(limit, status_rx.wait_for(|s| s.is_done()))
                .await
                .is_ok();
            if finished {
                return;
            }
            let Some(inner) = weak.upgrade() else { return };
            let error = ClientError::Timeout(format!(
                "worker {} exceeded its {:?} deadline",
                inner.request_id, limit
            ));
            if inner.halt(WorkerStatus::TimedOut, error) {
                warn!(request_id = %inner.request_id, ?limit, "Worker timed out");
                inner.send_abort().await;
            }
        });
    }
}

impl EventSink for WorkerInner {
    fn deliver(&self, event: ServerEvent) {
        let _delivery = self.enter_delivery();

        match event {
            ServerEvent::Started { worker_id, .. } => {
                let event = {
                    let mut state = lock(&self.state);
                    if !state.status.is_working() {
                        return;
                    }
                    state.worker_id = Some(worker_id);
                    WorkerEvent {
                        request_id: self.request_id,
                        worker_id: Some(worker_id),
                        kind: WorkerEventKind::Started,
                    }
                };
                debug!(request_id = %self.request_id, %worker_id, "Worker started");
                self.fire(&event);
            }
            ServerEvent::DataAvailable { payload, .. } => {
                let event = {
                    let state = lock(&self.state);
                    if !state.status.is_working() {
                        debug!(request_id = %self.request_id, "Dropping data for finished worker");
                        return;
                    }
                    WorkerEvent {
                        request_id: self.request_id,
                        worker_id: state.worker_id,
                        kind: WorkerEventKind::DataAvailable(payload),
                    }
                };
                self.fire(&event);
            }
            ServerEvent::Terminated {
                status,
                payload,
                error,
                ..
            } => {
                let (status, failure) = match status {
                    TerminationStatus::Completed => (WorkerStatus::Completed, None),
                    TerminationStatus::Aborted => (
                        WorkerStatus::Aborted,
                        Some(ClientError::Aborted(
                            error.unwrap_or_else(|| "aborted by server".to_string()),
                        )),
                    ),
                    TerminationStatus::Errored => (
                        WorkerStatus::Errored,
                        Some(ClientError::Server(
                            error.unwrap_or_else(|| "unspecified server error".to_string()),
                        )),
                    ),
                    TerminationStatus::TimedOut => (
                        WorkerStatus::TimedOut,
                        Some(ClientError::Timeout(
                            error.unwrap_or_else(|| "server-side deadline elapsed".to_string()),
                        )),
                    ),
                };
                self.conclude(status, payload, failure);
            }
        }
    }

    fn connection_lost(&self, reason: &str) {
        if self.fail(ClientError::Connection(reason.to_string())) {
            warn!(request_id = %self.request_id, "Worker lost its connection");
        }
    }
}
