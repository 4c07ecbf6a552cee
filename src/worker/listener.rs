//! Worker lifecycle callbacks

use std::sync::Arc;

use super::WorkerStatus;
use crate::types::{ClientError, RequestId, Term, WorkerId};

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Started,
    DataAvailable(Term),
    Terminated {
        status: WorkerStatus,
        /// Final payload, if the server sent one
        result: Option<Term>,
        error: Option<ClientError>,
    },
}

/// Lifecycle notification for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub request_id: RequestId,
    /// Server-side task id, known once the task has started
    pub worker_id: Option<WorkerId>,
    pub kind: WorkerEventKind,
}

/// Callbacks run on the connection's dispatch task, in registration order.
///
/// Errors and panics are logged and do not stop the remaining listeners.
/// Implementations should return quickly: events for every worker on the
/// connection wait behind them.
pub trait WorkerListener: Send + Sync {
    fn notify_started(&self, _event: &WorkerEvent) -> anyhow::Result<()> {
        Ok(())
    }

    fn notify_data_available(&self, _event: &WorkerEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fired exactly once per worker
    fn notify_terminated(&self, _event: &WorkerEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One closure for every callback
pub struct FnListener<F>(F);

impl<F> WorkerListener for FnListener<F>
where
    F: Fn(&WorkerEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn notify_started(&self, event: &WorkerEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }

    fn notify_data_available(&self, event: &WorkerEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }

    fn notify_terminated(&self, event: &WorkerEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

pub fn listener_fn<F>(f: F) -> Arc<dyn WorkerListener>
where
    F: Fn(&WorkerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}
