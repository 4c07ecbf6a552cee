use std::sync::Arc;

use super::answer::InferenceAnswer;
use super::status::InferenceStatus;
use crate::types::ClientError;

/// Observer of a query's progress.
///
/// Runs on the connection's dispatch task after the query's own bookkeeping,
/// so the query already reflects the change being reported. Registering one
/// forces the query onto the worker path.
pub trait QueryListener: Send + Sync {
    fn notify_status_changed(
        &self,
        _old: InferenceStatus,
        _new: InferenceStatus,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Answers just appended, in index order
    fn notify_new_answers(&self, _answers: &[Arc<InferenceAnswer>]) -> anyhow::Result<()> {
        Ok(())
    }

    /// A run ended: suspended, done or failed
    fn notify_run_ended(
        &self,
        _status: InferenceStatus,
        _error: Option<&ClientError>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
