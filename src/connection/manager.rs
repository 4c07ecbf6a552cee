//! Connection manager
//!
//! Owns the single live transport session to one reasoning server. Callers
//! never hold a session across calls: every conversation goes through
//! [`ConnectionManager::converse`], which checks the lease, reconnects a
//! dead session, and retries a request exactly once if the session dies
//! underneath it.
//!
//! Each session is a numbered generation. Reconnecting opens a new
//! generation with its own dispatch task; the old task drains, tells the
//! workers bound to it that the connection is gone, and exits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatcher::{dispatch_loop, DispatchTable};
use super::lease::LeaseManager;
use crate::commands;
use crate::config::ClientConfig;
use crate::listeners::{invoke_guarded, ListenerList};
use crate::sync::lock;
use crate::transport::{Request, TransportError, TransportFactory, TransportSession};
use crate::types::{ClientError, ImageFingerprint, RequestId, Result, SessionIdentity, Term};

/// Told when the server image behind a reconnect differs from the one seen
/// before. Anything cached from the old image should be dropped.
pub trait InvalidationListener: Send + Sync {
    fn image_changed(&self, previous: &ImageFingerprint, current: &ImageFingerprint);
}

impl<F> InvalidationListener for F
where
    F: Fn(&ImageFingerprint, &ImageFingerprint) + Send + Sync,
{
    fn image_changed(&self, previous: &ImageFingerprint, current: &ImageFingerprint) {
        self(previous, current)
    }
}

type Session = Arc<dyn TransportSession>;

struct SessionSlot {
    session: Option<Session>,
    /// Generation of `session`, or of the last attempt to open one
    generation: u64,
}

pub struct ConnectionManager {
    identity: SessionIdentity,
    config: ClientConfig,
    client_id: Uuid,
    factory: Arc<dyn TransportFactory>,
    /// Held across reconnects so concurrent callers wait for one attempt
    slot: AsyncMutex<SessionSlot>,
    fingerprint: Mutex<Option<ImageFingerprint>>,
    invalidation: ListenerList<dyn InvalidationListener>,
    routes: Arc<DispatchTable>,
    lease: LeaseManager,
    next_request_id: AtomicU64,
    reconnects: AtomicU64,
    closed: AtomicBool,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Open the first session, read the image fingerprint and take a lease
    /// if one is configured
    pub async fn connect(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let manager = Arc::new(Self {
            identity: config.identity(),
            client_id: Uuid::new_v4(),
            factory,
            slot: AsyncMutex::new(SessionSlot {
                session: None,
                generation: 0,
            }),
            fingerprint: Mutex::new(None),
            invalidation: ListenerList::new(),
            routes: Arc::new(DispatchTable::new()),
            lease: LeaseManager::new(config.lease_duration()),
            next_request_id: AtomicU64::new(1),
            reconnects: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            renewal: Mutex::new(None),
            config,
        });

        {
            let mut slot = manager.slot.lock().await;
            slot.generation = 1;
            let (session, fingerprint) = manager.open_session(1).await?;
            slot.session = Some(session);
            info!(
                server = %manager.identity,
                image = %fingerprint,
                client_id = %manager.client_id,
                "Connected to reasoning server"
            );
            *lock(&manager.fingerprint) = Some(fingerprint);
        }

        if manager.lease.is_enabled() {
            manager.spawn_lease_renewal();
        }

        Ok(manager)
    }

    /// Open one session generation and run the handshake on it
    async fn open_session(&self, generation: u64) -> Result<(Session, ImageFingerprint)> {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);

        let session = self
            .factory
            .open(&self.identity, events_tx)
            .await
            .map_err(|e| {
                ClientError::Connection(format!("failed to connect to {}: {}", self.identity, e))
            })?;

        self.routes.mark_live(generation);
        tokio::spawn(dispatch_loop(generation, events_rx, Arc::clone(&self.routes)));

        match self.handshake(&session).await {
            Ok(fingerprint) => Ok((session, fingerprint)),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, session: &Session) -> Result<ImageFingerprint> {
        let reply = session
            .send(Request::eval(commands::image_id()))
            .await
            .map_err(|e| ClientError::Connection(format!("image id request failed: {e}")))?;
        let fingerprint = ImageFingerprint::from_term(&reply)?;

        if self.lease.is_enabled() {
            let reply = session.send(self.lease_request()).await?;
            self.record_lease_reply(&reply)?;
        }
        Ok(fingerprint)
    }

    fn lease_request(&self) -> Request {
        Request::eval(commands::acquire_lease(
            self.lease.duration().as_millis() as u64,
            self.client_id,
        ))
    }

    fn record_lease_reply(&self, reply: &Term) -> Result<()> {
        let granted_ms = reply.as_int().ok_or_else(|| {
            ClientError::Protocol(format!("lease reply is not a duration: {reply}"))
        })?;
        self.lease
            .record_grant(Duration::from_millis(granted_ms.max(0) as u64));
        Ok(())
    }

    /// Renew the lease now
    pub async fn renew_lease(&self) -> Result<()> {
        let reply = self.converse(self.lease_request(), true).await?;
        self.record_lease_reply(&reply)
    }

    fn spawn_lease_renewal(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.lease.renewal_interval();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else { break };
                if manager.is_closed() {
                    break;
                }
                match manager.renew_lease().await {
                    Ok(()) => debug!(server = %manager.identity, "Lease renewed"),
                    Err(e) => warn!(server = %manager.identity, "Lease renewal failed: {}", e),
                }
            }
        });
        *lock(&self.renewal) = Some(handle);
    }

    /// The live session, reconnecting first if it has died
    pub async fn get_connection(&self) -> Result<Arc<dyn TransportSession>> {
        self.current().await.map(|(session, _)| session)
    }

    async fn current(&self) -> Result<(Session, u64)> {
        self.ensure_open()?;
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.as_ref().filter(|s| s.is_valid()) {
            return Ok((Arc::clone(session), slot.generation));
        }
        self.reconnect(&mut slot).await
    }

    /// Replace the session that failed on `failed_generation`, unless another
    /// caller already has
    async fn reconnect_after(&self, failed_generation: u64) -> Result<(Session, u64)> {
        self.ensure_open()?;
        let mut slot = self.slot.lock().await;
        if slot.generation != failed_generation {
            if let Some(session) = slot.session.as_ref().filter(|s| s.is_valid()) {
                return Ok((Arc::clone(session), slot.generation));
            }
        }
        self.reconnect(&mut slot).await
    }

    async fn reconnect(&self, slot: &mut SessionSlot) -> Result<(Session, u64)> {
        if let Some(stale) = slot.session.take() {
            stale.close().await;
        }

        // Never reuse a generation number, even after a failed attempt
        slot.generation += 1;
        let generation = slot.generation;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        warn!(server = %self.identity, generation, "Reconnecting to reasoning server");

        let (session, fingerprint) = self.open_session(generation).await.map_err(|e| {
            error!(server = %self.identity, "Reconnect failed: {}", e);
            e
        })?;
        slot.session = Some(Arc::clone(&session));
        info!(server = %self.identity, generation, image = %fingerprint, "Reconnected");

        self.note_fingerprint(fingerprint);
        Ok((session, generation))
    }

    fn note_fingerprint(&self, current: ImageFingerprint) {
        let previous = lock(&self.fingerprint).replace(current.clone());
        let Some(previous) = previous else { return };
        if previous == current {
            return;
        }

        warn!(
            server = %self.identity,
            %previous,
            %current,
            "Server image changed across reconnect"
        );
        for listener in self.invalidation.snapshot() {
            invoke_guarded("image-changed", || {
                listener.image_changed(&previous, &current);
                Ok(())
            });
        }
    }

    /// Send a request, reconnecting and retrying once if the connection drops
    pub async fn converse_with_retry(&self, request: Request) -> Result<Term> {
        self.converse(request, false).await
    }

    /// Like [`converse_with_retry`](Self::converse_with_retry); with
    /// `ignore_invalid_lease` the lease check is skipped, which is how the
    /// lease itself gets renewed and how aborts still reach the server.
    pub async fn converse(&self, request: Request, ignore_invalid_lease: bool) -> Result<Term> {
        self.converse_tracked(request, ignore_invalid_lease)
            .await
            .map(|(reply, _)| reply)
    }

    /// Converse and report which session generation produced the reply
    pub(crate) async fn converse_tracked(
        &self,
        request: Request,
        ignore_invalid_lease: bool,
    ) -> Result<(Term, u64)> {
        if !ignore_invalid_lease && !self.lease.is_valid() {
            return Err(ClientError::LeaseExpired(format!(
                "lease with {} is not valid",
                self.identity
            )));
        }

        let (session, generation) = self.current().await?;
        match session.send(request.clone()).await {
            Ok(reply) => Ok((reply, generation)),
            Err(TransportError::Closed(reason)) => {
                warn!(
                    server = %self.identity,
                    kind = request.kind(),
                    %reason,
                    "Connection dropped mid-request, retrying once"
                );
                let (session, generation) = self.reconnect_after(generation).await?;
                let reply = session.send(request).await.map_err(|e| {
                    error!(server = %self.identity, "Retry failed: {}", e);
                    ClientError::from(e)
                })?;
                Ok((reply, generation))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn add_invalidation_listener(&self, listener: Arc<dyn InvalidationListener>) {
        self.invalidation.add(listener);
    }

    pub fn remove_invalidation_listener(&self, listener: &Arc<dyn InvalidationListener>) -> bool {
        self.invalidation.remove(listener)
    }

    /// Fingerprint of the image behind the current session
    pub fn fingerprint(&self) -> Option<ImageFingerprint> {
        lock(&self.fingerprint).clone()
    }

    /// Reconnect attempts since the first session was opened
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    /// Allocate a request id for a new worker
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Workers currently waiting on server events
    pub fn in_flight_workers(&self) -> usize {
        self.routes.in_flight()
    }

    pub(crate) fn routes(&self) -> &DispatchTable {
        &self.routes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session and stop lease renewal. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.renewal).take() {
            task.abort();
        }
        let session = self.slot.lock().await.session.take();
        if let Some(session) = session {
            session.close().await;
        }
        info!(server = %self.identity, "Connection closed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.identity)
            .field("client_id", &self.client_id)
            .field("reconnects", &self.reconnect_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
