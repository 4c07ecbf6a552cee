//! Per-connection event dispatch
//!
//! Each live session gets exactly one dispatch task. It drains the session's
//! event channel in arrival order and hands every event to the worker that
//! submitted it. When the channel closes, workers still bound to that
//! session are told the connection is gone.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sync::lock;
use crate::transport::ServerEvent;
use crate::types::RequestId;

/// Receives events for one submitted worker. Called inline on the dispatch
/// task, so implementations must not block.
pub(crate) trait EventSink: Send + Sync {
    fn deliver(&self, event: ServerEvent);
    fn connection_lost(&self, reason: &str);
}

struct Route {
    sink: Arc<dyn EventSink>,
    /// Session generation the submission was acknowledged on
    generation: Option<u64>,
}

/// In-flight workers keyed by request id
pub(crate) struct DispatchTable {
    routes: DashMap<RequestId, Route>,
    live: Mutex<HashSet<u64>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            live: Mutex::new(HashSet::new()),
        }
    }

    pub fn register(&self, request_id: RequestId, sink: Arc<dyn EventSink>) {
        self.routes.insert(
            request_id,
            Route {
                sink,
                generation: None,
            },
        );
    }

    /// Tie a route to the session that acknowledged it. Returns false if that
    /// session has already gone away, in which case no loss notice will come.
    pub fn bind(&self, request_id: RequestId, generation: u64) -> bool {
        let live = lock(&self.live);
        if !live.contains(&generation) {
            return false;
        }
        if let Some(mut route) = self.routes.get_mut(&request_id) {
            route.generation = Some(generation);
        }
        true
    }

    pub fn remove(&self, request_id: RequestId) {
        self.routes.remove(&request_id);
    }

    fn sink(&self, request_id: RequestId) -> Option<Arc<dyn EventSink>> {
        self.routes.get(&request_id).map(|r| Arc::clone(&r.sink))
    }

    pub fn mark_live(&self, generation: u64) {
        lock(&self.live).insert(generation);
    }

    /// Number of workers awaiting events
    pub fn in_flight(&self) -> usize {
        self.routes.len()
    }

    /// Retire a generation and hand back the sinks that were bound to it
    fn retire(&self, generation: u64) -> Vec<Arc<dyn EventSink>> {
        lock(&self.live).remove(&generation);

        let stranded: Vec<RequestId> = self
            .routes
            .iter()
            .filter(|r| r.generation == Some(generation))
            .map(|r| *r.key())
            .collect();

        stranded
            .into_iter()
            .filter_map(|id| self.routes.remove(&id).map(|(_, route)| route.sink))
            .collect()
    }
}

/// Dispatch loop for one session generation
pub(crate) async fn dispatch_loop(
    generation: u64,
    mut events: mpsc::Receiver<ServerEvent>,
    table: Arc<DispatchTable>,
) {
    debug!(generation, "Event dispatcher started");

    while let Some(event) = events.recv().await {
        let request_id = event.request_id();
        match table.sink(request_id) {
            Some(sink) => sink.deliver(event),
            None => debug!(%request_id, "Dropping event for unknown worker"),
        }
    }

    let stranded = table.retire(generation);
    if !stranded.is_empty() {
        warn!(
            generation,
            count = stranded.len(),
            "Connection lost with workers in flight"
        );
    }
    for sink in stranded {
        sink.connection_lost("connection to server lost");
    }
    debug!(generation, "Event dispatcher stopped");
}
