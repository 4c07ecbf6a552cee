//! Continuable inference queries
//!
//! A [`Query`] runs a sentence in a context on the server and accumulates
//! the answers it finds. Plain queries take one synchronous round trip.
//! Queries that need streaming, continuation or external listeners run each
//! step (the first run and every continuation) as its own [`Worker`], with
//! the query registered as that worker's first listener.
//!
//! Answers are append-only. Each answer index is translated once; later
//! reports that repeat an index are skipped, so answers handed out earlier
//! keep their identity across continuations.

mod answer;
mod listener;
mod properties;
mod result_set;
mod status;
mod update;

pub use answer::{AnswerId, BindingSet, InferenceAnswer};
pub use listener::QueryListener;
pub use properties::{InferenceMode, QueryProperties, ResultSortOrder};
pub use result_set::ResultSet;
pub use status::{InferenceStatus, SuspendReason};

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use self::update::InferenceUpdate;
use crate::commands;
use crate::connection::ConnectionManager;
use crate::listeners::{invoke_guarded, ListenerList};
use crate::sync::lock;
use crate::transport::Request;
use crate::types::{ClientError, InferenceId, Result, Term, Variable};
use crate::worker::{Worker, WorkerEvent, WorkerEventKind, WorkerListener, WorkerOptions, WorkerStatus};

/// Handle to one query. Clones share the same inference.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    connection: Arc<ConnectionManager>,
    sentence: Term,
    context: Term,
    variables: Vec<Variable>,
    state: Mutex<QueryState>,
    listeners: ListenerList<dyn QueryListener>,
    progress: watch::Sender<Progress>,
}

#[derive(Default)]
struct QueryState {
    status: InferenceStatus,
    suspend_reason: Option<SuspendReason>,
    inference_id: Option<InferenceId>,
    properties: QueryProperties,
    started: bool,
    answers: Vec<Arc<InferenceAnswer>>,
    /// Worker of the current run, if it took the worker path
    worker: Option<Worker>,
    failure: Option<ClientError>,
    closed: bool,
    /// Server inferences already released or being released
    released: HashSet<InferenceId>,
    /// Bumped on every run and on clear; events from older runs are ignored
    run: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    status: InferenceStatus,
    answers: usize,
    run: u64,
}

/// State change to report once the state lock is released
struct Transition {
    run: u64,
    old: InferenceStatus,
    new: InferenceStatus,
    added: Vec<Arc<InferenceAnswer>>,
    answers: usize,
    run_ended: bool,
    failure: Option<ClientError>,
}

enum Launch {
    Initial,
    Continue(Term),
}

impl Query {
    pub fn new(
        connection: Arc<ConnectionManager>,
        sentence: Term,
        context: Term,
        properties: QueryProperties,
    ) -> Self {
        let (progress, _) = watch::channel(Progress {
            status: InferenceStatus::NotStarted,
            answers: 0,
            run: 0,
        });
        Self {
            inner: Arc::new(QueryInner {
                connection,
                variables: sentence.variables(),
                sentence,
                context,
                state: Mutex::new(QueryState {
                    properties,
                    ..Default::default()
                }),
                listeners: ListenerList::new(),
                progress,
            }),
        }
    }

    pub fn sentence(&self) -> &Term {
        &self.inner.sentence
    }

    pub fn context(&self) -> &Term {
        &self.inner.context
    }

    /// Free variables of the sentence, in order of first appearance
    pub fn variables(&self) -> &[Variable] {
        &self.inner.variables
    }

    pub fn status(&self) -> InferenceStatus {
        lock(&self.inner.state).status
    }

    /// Meaningful only while suspended
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        lock(&self.inner.state).suspend_reason.clone()
    }

    pub fn inference_id(&self) -> Option<InferenceId> {
        lock(&self.inner.state).inference_id
    }

    pub fn properties(&self) -> QueryProperties {
        lock(&self.inner.state).properties.clone()
    }

    /// Why the query is in `Error`
    pub fn failure(&self) -> Option<ClientError> {
        lock(&self.inner.state).failure.clone()
    }

    /// Worker of the current or last run, if it took the worker path
    pub fn worker(&self) -> Option<Worker> {
        lock(&self.inner.state).worker.clone()
    }

    /// Replace the parameters. Only allowed before the first start.
    pub fn set_properties(&self, properties: QueryProperties) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.started {
            return Err(ClientError::InvalidState(
                "query parameters are frozen once started".to_string(),
            ));
        }
        state.properties = properties;
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn QueryListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn QueryListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Whether the next run goes through a worker
    pub fn requires_worker(&self) -> bool {
        self.inner.requires_worker(&lock(&self.inner.state).properties)
    }

    /// Not yet started, or suspended with the continuable option
    pub fn is_continuable(&self) -> bool {
        let state = lock(&self.inner.state);
        if state.closed {
            return false;
        }
        match state.status {
            InferenceStatus::NotStarted => true,
            InferenceStatus::Suspended => {
                state.properties.continuable
                    && state
                        .suspend_reason
                        .as_ref()
                        .map_or(true, SuspendReason::permits_continuation)
            }
            _ => false,
        }
    }

    /// Begin the first run. On the worker path this returns once the server
    /// has acknowledged the submission; on the simple path it returns with
    /// the complete result.
    pub async fn start(&self) -> Result<()> {
        self.launch(Launch::Initial)
            .await?
            .ok_or_else(already_started)?;
        Ok(())
    }

    /// Run the query and wait until it is done or suspended
    pub async fn perform_inference(&self) -> Result<InferenceStatus> {
        let run = self
            .launch(Launch::Initial)
            .await?
            .ok_or_else(already_started)?;
        self.inner.wait_run(run).await
    }

    /// Resume a suspended query with a fresh budget. Only the ceilings of
    /// `budget` are used; without one the query's own ceilings apply again.
    /// A query that has not started yet is simply started.
    pub async fn continue_inference(
        &self,
        budget: Option<QueryProperties>,
    ) -> Result<InferenceStatus> {
        let status = {
            let mut state = lock(&self.inner.state);
            if state.status == InferenceStatus::NotStarted {
                if let Some(budget) = &budget {
                    state.properties.apply_budget(budget);
                }
            }
            state.status
        };
        if status == InferenceStatus::NotStarted {
            return self.perform_inference().await;
        }
        if !self.is_continuable() {
            return Err(ClientError::InvalidState(format!(
                "query cannot be continued while {status}"
            )));
        }

        let budget = budget.unwrap_or_else(|| self.properties()).budget_term();
        let run = self
            .launch(Launch::Continue(budget))
            .await?
            .ok_or_else(|| ClientError::InvalidState("query is no longer suspended".to_string()))?;
        self.inner.wait_run(run).await
    }

    /// Forget all answers and return to `NotStarted`, keeping the sentence,
    /// context and parameters. Any running worker is aborted and the server
    /// inference released.
    pub async fn clear_results(&self) -> Result<()> {
        let (worker, inference, transition) = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(closed());
            }
            let old = state.status;
            state.run += 1;
            state.status = InferenceStatus::NotStarted;
            state.suspend_reason = None;
            state.failure = None;
            state.started = false;
            state.answers.clear();
            let transition = Transition {
                run: state.run,
                old,
                new: InferenceStatus::NotStarted,
                added: Vec::new(),
                answers: 0,
                run_ended: false,
                failure: None,
            };
            let inference = state.inference_id.take();
            state.released.extend(inference);
            (state.worker.take(), inference, transition)
        };
        self.inner.announce(transition);

        if let Some(worker) = worker {
            worker.abort().await;
        }
        if let Some(id) = inference {
            self.inner.release(id).await;
        }
        debug!(sentence = %self.inner.sentence, "Query results cleared");
        Ok(())
    }

    /// Ask a running query to stop. With `patience`, escalate to a hard abort
    /// if it has not stopped within that time.
    pub async fn stop(&self, patience: Option<Duration>) -> Result<()> {
        let (worker, run) = {
            let state = lock(&self.inner.state);
            if state.status != InferenceStatus::Working {
                return Ok(());
            }
            (state.worker.clone(), state.run)
        };
        // A simple-path run is a single round trip and cannot be interrupted
        let Some(worker) = worker else { return Ok(()) };

        if let Err(e) = worker.cancel().await {
            warn!(sentence = %self.inner.sentence, "Cancel request failed: {}", e);
        }
        if let Some(patience) = patience {
            if tokio::time::timeout(patience, self.inner.wait_run(run))
                .await
                .is_err()
            {
                info!(
                    sentence = %self.inner.sentence,
                    ?patience,
                    "Query did not stop in time, aborting"
                );
                worker.abort().await;
            }
        }
        Ok(())
    }

    /// Abort any running work and release the server inference. Safe to call
    /// more than once; release failures are logged, not returned.
    /// A run still in flight ends in `Error`; an inference it reports later
    /// is released as soon as it arrives.
    pub async fn close(&self) {
        let (worker, inference, transition) = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let inference = state.inference_id.take();
            state.released.extend(inference);

            let transition = (state.status == InferenceStatus::Working).then(|| {
                state.status = InferenceStatus::Error;
                state.suspend_reason = None;
                state.failure = Some(closed());
                Transition {
                    run: state.run,
                    old: InferenceStatus::Working,
                    new: InferenceStatus::Error,
                    added: Vec::new(),
                    answers: state.answers.len(),
                    run_ended: true,
                    failure: Some(closed()),
                }
            });
            (state.worker.clone(), inference, transition)
        };
        if let Some(transition) = transition {
            self.inner.announce(transition);
        }
        if let Some(worker) = worker {
            worker.abort().await;
        }
        if let Some(id) = inference {
            self.inner.release(id).await;
        }
        debug!(sentence = %self.inner.sentence, "Query closed");
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Number of answers once in-flight work has settled, running the query
    /// first if needed
    pub async fn answer_count(&self) -> Result<usize> {
        self.settle().await?;
        Ok(lock(&self.inner.state).answers.len())
    }

    /// Answer at `index`, running or continuing the query as far as needed
    pub async fn answer(&self, index: usize) -> Result<Arc<InferenceAnswer>> {
        let missing = || ClientError::InvalidState(format!("query has no answer at index {index}"));
        let wanted = index.checked_add(1).ok_or_else(missing)?;
        if !self.ensure_answers(wanted).await? {
            return Err(missing());
        }
        self.answer_at(index).ok_or_else(missing)
    }

    /// Answers accumulated so far, without waiting
    pub fn answers(&self) -> Vec<Arc<InferenceAnswer>> {
        lock(&self.inner.state).answers.clone()
    }

    /// Whether at least one answer exists
    pub async fn is_provable(&self) -> Result<bool> {
        self.ensure_answers(1).await
    }

    /// Truth value of a variable-free query
    pub async fn is_true(&self) -> Result<bool> {
        if !self.inner.variables.is_empty() {
            return Err(ClientError::InvalidState(format!(
                "query has free variables: {}",
                self.inner.sentence
            )));
        }
        self.ensure_answers(1).await
    }

    /// Cursor over this query's answers
    pub fn result_set(&self) -> ResultSet {
        ResultSet::new(self.clone())
    }

    pub(crate) fn answer_at(&self, index: usize) -> Option<Arc<InferenceAnswer>> {
        lock(&self.inner.state).answers.get(index).cloned()
    }

    /// Drive the query until at least `wanted` answers exist. Returns false
    /// when no more can come without caller intervention: done, suspended at
    /// a ceiling, or a continuation that found nothing new.
    pub(crate) async fn ensure_answers(&self, wanted: usize) -> Result<bool> {
        loop {
            let (status, have, run, reason, failure) = {
                let state = lock(&self.inner.state);
                (
                    state.status,
                    state.answers.len(),
                    state.run,
                    state.suspend_reason.clone(),
                    state.failure.clone(),
                )
            };
            if have >= wanted {
                return Ok(true);
            }

            match status {
                InferenceStatus::NotStarted => {
                    // Another cursor may have launched it first; loop either way
                    self.launch(Launch::Initial).await?;
                }
                InferenceStatus::Working => self.inner.wait_change(run, have).await,
                InferenceStatus::Suspended => {
                    if !self.is_continuable() || reason.as_ref().is_some_and(SuspendReason::is_ceiling) {
                        return Ok(false);
                    }
                    let budget = self.properties().budget_term();
                    if let Some(run) = self.launch(Launch::Continue(budget)).await? {
                        self.inner.wait_run(run).await?;
                        if lock(&self.inner.state).answers.len() == have {
                            return Ok(false);
                        }
                    }
                }
                InferenceStatus::Done => return Ok(false),
                InferenceStatus::Error => {
                    return Err(failure.unwrap_or_else(|| {
                        ClientError::Server("inference failed".to_string())
                    }))
                }
            }
        }
    }

    /// Wait out in-flight work, starting the query if it never ran
    async fn settle(&self) -> Result<()> {
        loop {
            let (status, run, failure) = {
                let state = lock(&self.inner.state);
                (state.status, state.run, state.failure.clone())
            };
            match status {
                InferenceStatus::NotStarted => {
                    if let Some(run) = self.launch(Launch::Initial).await? {
                        return self.inner.wait_run(run).await.map(|_| ());
                    }
                }
                InferenceStatus::Working => return self.inner.wait_run(run).await.map(|_| ()),
                InferenceStatus::Error => {
                    return Err(failure
                        .unwrap_or_else(|| ClientError::Server("inference failed".to_string())))
                }
                InferenceStatus::Suspended | InferenceStatus::Done => return Ok(()),
            }
        }
    }

    /// Begin a run. `None` means another caller changed the state first.
    async fn launch(&self, launch: Launch) -> Result<Option<u64>> {
        let inner = &self.inner;
        let (run, command, use_worker, transition, options) = {
            let mut state = lock(&inner.state);
            if state.closed {
                return Err(closed());
            }
            let (command, use_worker) = match &launch {
                Launch::Initial => {
                    if state.status != InferenceStatus::NotStarted {
                        return Ok(None);
                    }
                    let properties = state.properties.to_term();
                    if inner.requires_worker(&state.properties) {
                        let command =
                            commands::start_inference(&inner.sentence, &inner.context, properties);
                        (command, true)
                    } else {
                        let command =
                            commands::run_query(&inner.sentence, &inner.context, properties);
                        (command, false)
                    }
                }
                Launch::Continue(budget) => {
                    if state.status != InferenceStatus::Suspended {
                        return Ok(None);
                    }
                    let id = state.inference_id.ok_or_else(|| {
                        ClientError::InvalidState("no server inference to continue".to_string())
                    })?;
                    (commands::continue_inference(id, budget.clone()), true)
                }
            };

            let old = state.status;
            state.run += 1;
            state.status = InferenceStatus::Working;
            state.suspend_reason = None;
            state.failure = None;
            state.started = true;
            state.worker = None;

            let timeout = state
                .properties
                .timeout
                .unwrap_or_else(|| inner.connection.config().query_timeout());
            let options = WorkerOptions::default()
                .with_priority(state.properties.priority)
                .with_timeout(timeout)
                .incremental(true);

            let transition = Transition {
                run: state.run,
                old,
                new: InferenceStatus::Working,
                added: Vec::new(),
                answers: state.answers.len(),
                run_ended: false,
                failure: None,
            };
            (state.run, command, use_worker, transition, options)
        };
        inner.announce(transition);

        if use_worker {
            self.submit(run, command, options).await?;
        } else {
            self.converse(run, command).await?;
        }
        Ok(Some(run))
    }

    async fn submit(&self, run: u64, command: Term, options: WorkerOptions) -> Result<()> {
        let worker = Worker::new(Arc::clone(&self.inner.connection), command, options);
        worker.add_listener(Arc::new(EngineListener {
            query: Arc::downgrade(&self.inner),
            run,
        }));

        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(closed());
            }
            if state.run != run {
                // Cleared before submission
                return Ok(());
            }
            state.worker = Some(worker.clone());
        }
        debug!(sentence = %self.inner.sentence, request_id = %worker.request_id(), "Submitting inference run");
        // A failed start has already moved the query to Error through the
        // worker's terminated notification
        worker.start().await
    }

    async fn converse(&self, run: u64, command: Term) -> Result<()> {
        match self
            .inner
            .connection
            .converse_with_retry(Request::eval(command))
            .await
        {
            Ok(reply) => {
                self.inner.absorb(run, &reply, true);
                let failure = {
                    let state = lock(&self.inner.state);
                    match state.status {
                        InferenceStatus::Error if state.run == run => state.failure.clone(),
                        _ => None,
                    }
                };
                match failure {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                }
            }
            Err(e) => {
                self.inner.finish(run, InferenceStatus::Error, Some(e.clone()));
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Query")
            .field("sentence", &self.inner.sentence.to_string())
            .field("status", &state.status)
            .field("inference_id", &state.inference_id)
            .field("answers", &state.answers.len())
            .finish()
    }
}

fn already_started() -> ClientError {
    ClientError::InvalidState("query has already been started".to_string())
}

fn closed() -> ClientError {
    ClientError::InvalidState("query is closed".to_string())
}

impl QueryInner {
    fn requires_worker(&self, properties: &QueryProperties) -> bool {
        properties.requires_worker() || !self.listeners.is_empty()
    }

    /// Wait for `run` to leave `Working`, then report how it ended
    async fn wait_run(&self, run: u64) -> Result<InferenceStatus> {
        let mut rx = self.progress.subscribe();
        let _ = rx
            .wait_for(|p| p.run != run || p.status != InferenceStatus::Working)
            .await;

        let state = lock(&self.state);
        match state.status {
            InferenceStatus::Error => Err(state
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::Server("inference failed".to_string()))),
            status => Ok(status),
        }
    }

    /// Wait for anything to move: new answers, a status change or a new run
    async fn wait_change(&self, run: u64, answers: usize) {
        let mut rx = self.progress.subscribe();
        let _ = rx
            .wait_for(|p| {
                p.run != run || p.status != InferenceStatus::Working || p.answers != answers
            })
            .await;
    }

    /// Fold an inference report into the state. `finishing` marks the final
    /// report of a run.
    fn absorb(&self, run: u64, payload: &Term, finishing: bool) {
        let update = match InferenceUpdate::from_term(payload) {
            Ok(update) => update,
            Err(e) => {
                warn!(sentence = %self.sentence, "Unreadable inference report: {}", e);
                self.finish(run, InferenceStatus::Error, Some(e));
                return;
            }
        };

        let recorded = {
            let mut state = lock(&self.state);
            if state.closed || state.run != run || state.status != InferenceStatus::Working {
                // A stale report may still name an inference nobody owns now
                let orphan = update.inference_id.filter(|id| {
                    state.inference_id != Some(*id) && !state.released.contains(id)
                });
                if let Some(id) = orphan {
                    state.released.insert(id);
                    drop(state);
                    debug!(inference = %id, sentence = %self.sentence, "Releasing orphaned server inference");
                    tokio::spawn(release_inference(Arc::clone(&self.connection), id));
                }
                return;
            }
            state.record(run, &update, finishing)
        };
        match recorded {
            Ok(transition) => self.announce(transition),
            Err(e) => {
                warn!(sentence = %self.sentence, "Rejected inference report: {}", e);
                self.finish(run, InferenceStatus::Error, Some(e));
            }
        }
    }

    /// End `run` with `status` unless it already ended
    fn finish(&self, run: u64, status: InferenceStatus, failure: Option<ClientError>) {
        let transition = {
            let mut state = lock(&self.state);
            if state.run != run || state.status != InferenceStatus::Working {
                return;
            }
            let old = state.status;
            state.status = status;
            state.suspend_reason = None;
            state.failure = failure.clone();
            Transition {
                run,
                old,
                new: status,
                added: Vec::new(),
                answers: state.answers.len(),
                run_ended: true,
                failure,
            }
        };
        self.announce(transition);
    }

    fn announce(&self, transition: Transition) {
        let listeners = self.listeners.snapshot();

        if !transition.added.is_empty() {
            for listener in &listeners {
                invoke_guarded("new-answers", || listener.notify_new_answers(&transition.added));
            }
        }
        if transition.old != transition.new {
            debug!(
                sentence = %self.sentence,
                old = %transition.old,
                new = %transition.new,
                "Inference status changed"
            );
            for listener in &listeners {
                invoke_guarded("status-changed", || {
                    listener.notify_status_changed(transition.old, transition.new)
                });
            }
        }
        if transition.run_ended {
            for listener in &listeners {
                invoke_guarded("run-ended", || {
                    listener.notify_run_ended(transition.new, transition.failure.as_ref())
                });
            }
        }

        self.progress.send_replace(Progress {
            status: transition.new,
            answers: transition.answers,
            run: transition.run,
        });
    }

    async fn release(&self, id: InferenceId) {
        release_inference(Arc::clone(&self.connection), id).await;
    }
}

/// Destroy a server inference, bounded by the release timeout and exempt
/// from the lease check
async fn release_inference(connection: Arc<ConnectionManager>, id: InferenceId) {
    let limit = connection.config().release_timeout();
    let request = Request::eval(commands::release_inference(id));
    match tokio::time::timeout(limit, connection.converse(request, true)).await {
        Ok(Ok(_)) => debug!(inference = %id, "Released server inference"),
        Ok(Err(e)) => warn!(inference = %id, "Failed to release server inference: {}", e),
        Err(_) => warn!(inference = %id, "Releasing server inference timed out after {:?}", limit),
    }
}

impl QueryState {
    fn record(
        &mut self,
        run: u64,
        update: &InferenceUpdate,
        finishing: bool,
    ) -> Result<Transition> {
        if self.inference_id.is_none() {
            self.inference_id = update.inference_id;
        }
        let added = self.append_answers(update)?;
        let old = self.status;

        if finishing {
            let new = match update.status {
                Some(
                    status @ (InferenceStatus::Suspended
                    | InferenceStatus::Done
                    | InferenceStatus::Error),
                ) => status,
                _ => InferenceStatus::Done,
            };
            self.status = new;
            self.suspend_reason = (new == InferenceStatus::Suspended).then(|| {
                update
                    .suspend_reason
                    .clone()
                    .unwrap_or(SuspendReason::Exhaust)
            });
            if new == InferenceStatus::Error {
                self.failure = Some(ClientError::Server(
                    update
                        .error
                        .clone()
                        .unwrap_or_else(|| "inference failed".to_string()),
                ));
            }
        }

        Ok(Transition {
            run,
            old,
            new: self.status,
            added,
            answers: self.answers.len(),
            run_ended: finishing,
            failure: self.failure.clone(),
        })
    }

    fn append_answers(&mut self, update: &InferenceUpdate) -> Result<Vec<Arc<InferenceAnswer>>> {
        let start = update.answer_start.unwrap_or(self.answers.len());
        let mut added = Vec::new();

        for (offset, raw) in update.answers.iter().enumerate() {
            let index = start + offset;
            if index < self.answers.len() {
                continue;
            }
            if index > self.answers.len() {
                return Err(ClientError::Protocol(format!(
                    "answer {} arrived before answer {}",
                    index,
                    self.answers.len()
                )));
            }
            let answer = Arc::new(InferenceAnswer::new(
                AnswerId {
                    inference: self.inference_id,
                    index,
                },
                BindingSet::from_raw(raw)?,
            ));
            self.answers.push(Arc::clone(&answer));
            added.push(answer);
        }
        Ok(added)
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if let (false, Some(id)) = (state.closed, state.inference_id) {
            warn!(
                inference = %id,
                sentence = %self.sentence,
                "Query dropped without close(); server inference leaked"
            );
        }
    }
}

/// The query's own bookkeeping, registered first on every run's worker
struct EngineListener {
    query: Weak<QueryInner>,
    run: u64,
}

impl WorkerListener for EngineListener {
    fn notify_data_available(&self, event: &WorkerEvent) -> anyhow::Result<()> {
        if let (Some(query), WorkerEventKind::DataAvailable(payload)) =
            (self.query.upgrade(), &event.kind)
        {
            query.absorb(self.run, payload, false);
        }
        Ok(())
    }

    fn notify_terminated(&self, event: &WorkerEvent) -> anyhow::Result<()> {
        let Some(query) = self.query.upgrade() else {
            return Ok(());
        };
        let WorkerEventKind::Terminated {
            status,
            result,
            error,
        } = &event.kind
        else {
            return Ok(());
        };

        match (status, result) {
            (WorkerStatus::Completed, Some(payload)) => query.absorb(self.run, payload, true),
            (WorkerStatus::Completed, None) | (WorkerStatus::Aborted, _) => {
                query.finish(self.run, InferenceStatus::Done, None)
            }
            _ => {
                let failure = error
                    .clone()
                    .unwrap_or_else(|| ClientError::Server(format!("inference worker {status}")));
                query.finish(self.run, InferenceStatus::Error, Some(failure));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fixture::FixtureServer;
    use crate::transport::{ServerEvent, TerminationStatus};
    use crate::types::{RequestId, WorkerId};

    fn emu_query() -> Term {
        Term::list([Term::symbol("isa"), Term::var("X"), Term::symbol("Emu")])
    }

    fn binding(value: &str) -> Term {
        Term::list([Term::Dotted(
            vec![Term::var("X")],
            Box::new(Term::symbol(value)),
        )])
    }

    fn report(status: Option<&str>, reason: Option<&str>, start: usize, answers: Vec<Term>) -> Term {
        let mut plist = vec![
            Term::keyword("inference-id"),
            Term::list([Term::Int(1), Term::Int(4)]),
            Term::keyword("answer-start"),
            Term::Int(start as i64),
            Term::keyword("answers"),
            Term::List(answers),
        ];
        if let Some(status) = status {
            plist.push(Term::keyword("status"));
            plist.push(Term::keyword(status));
        }
        if let Some(reason) = reason {
            plist.push(Term::keyword("suspend-reason"));
            plist.push(Term::keyword(reason));
        }
        Term::List(plist)
    }

    fn head(command: &Term) -> &str {
        command
            .as_list()
            .and_then(|items| items.first())
            .and_then(Term::as_symbol)
            .unwrap_or_default()
    }

    fn run_events(id: RequestId, data: Term, last: Term) -> Vec<ServerEvent> {
        vec![
            ServerEvent::Started {
                request_id: id,
                worker_id: WorkerId(id.0 as i64),
            },
            ServerEvent::DataAvailable {
                request_id: id,
                payload: data,
            },
            ServerEvent::Terminated {
                request_id: id,
                status: TerminationStatus::Completed,
                payload: Some(last),
                error: None,
            },
        ]
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl QueryListener for Recorder {
        fn notify_status_changed(
            &self,
            old: InferenceStatus,
            new: InferenceStatus,
        ) -> anyhow::Result<()> {
            lock(&self.seen).push(format!("{old} -> {new}"));
            Ok(())
        }

        fn notify_new_answers(&self, answers: &[Arc<InferenceAnswer>]) -> anyhow::Result<()> {
            lock(&self.seen).push(format!("+{}", answers.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_simple_path_emu_example() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(report(Some("done"), None, 0, vec![binding("Emu-1")]))
        });
        let connection = server.connect().await;

        let props = QueryProperties::default().with_max_answers(5);
        let query = Query::new(connection, emu_query(), Term::symbol("BiologyMt"), props);
        assert!(!query.requires_worker());

        assert_eq!(query.answer_count().await.unwrap(), 1);
        let answer = query.answer(0).await.unwrap();
        assert_eq!(answer.binding_by_name("?X"), Some(&Term::symbol("Emu-1")));
        assert_eq!(
            answer.id(),
            AnswerId {
                inference: Some(InferenceId::new(1, 4)),
                index: 0
            }
        );
        assert!(query.is_provable().await.unwrap());
        assert_eq!(query.status(), InferenceStatus::Done);
        assert_eq!(server.count("run-query"), 1);
        assert_eq!(server.count("start-inference"), 0);
        query.close().await;
    }

    #[tokio::test]
    async fn test_is_true_on_ground_queries() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |command| {
            let proven = command.to_string().contains("Emu-1");
            let answers = if proven { vec![Term::Nil] } else { Vec::new() };
            Ok(report(Some("done"), None, 0, answers))
        });
        let connection = server.connect().await;

        let ground = |name: &str| {
            Query::new(
                Arc::clone(&connection),
                Term::list([Term::symbol("isa"), Term::symbol(name), Term::symbol("Emu")]),
                Term::symbol("BiologyMt"),
                QueryProperties::default(),
            )
        };
        assert!(ground("Emu-1").is_true().await.unwrap());
        assert!(!ground("Kiwi-1").is_true().await.unwrap());

        let open = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );
        assert!(open.is_true().await.unwrap_err().is_programming_error());
    }

    #[tokio::test]
    async fn test_continue_keeps_earlier_answers() {
        let server = FixtureServer::new();
        server.on_submit(|id, command| match head(command) {
            "start-inference" => run_events(
                id,
                report(None, None, 0, vec![binding("A"), binding("B"), binding("C")]),
                report(Some("suspended"), Some("max-number"), 3, Vec::new()),
            ),
            _ => run_events(
                id,
                report(None, None, 3, vec![binding("D")]),
                // Overlapping final batch repeats answers already seen
                report(
                    Some("done"),
                    None,
                    0,
                    ["A", "B", "C", "D", "E"].into_iter().map(binding).collect(),
                ),
            ),
        });
        let connection = server.connect().await;

        let props = QueryProperties::default().with_max_answers(3).continuable(true);
        let query = Query::new(connection, emu_query(), Term::symbol("BiologyMt"), props);
        let recorder = Arc::new(Recorder::default());
        query.add_listener(recorder.clone());

        assert_eq!(
            query.perform_inference().await.unwrap(),
            InferenceStatus::Suspended
        );
        assert_eq!(query.suspend_reason(), Some(SuspendReason::MaxNumber));
        assert!(query.is_continuable());
        let first = query.answers();
        assert_eq!(first.len(), 3);

        let budget = QueryProperties::default().with_max_answers(10);
        assert_eq!(
            query.continue_inference(Some(budget)).await.unwrap(),
            InferenceStatus::Done
        );
        let all = query.answers();
        assert_eq!(all.len(), 5);
        for (index, answer) in first.iter().enumerate() {
            assert!(Arc::ptr_eq(answer, &all[index]));
            assert_eq!(all[index].index(), index);
        }
        assert_eq!(all[4].binding_by_name("X"), Some(&Term::symbol("E")));

        let continued = server
            .requests()
            .into_iter()
            .find_map(|r| match r {
                Request::Submit { command, .. } if head(&command) == "continue-inference" => {
                    Some(command)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(
            continued.to_string(),
            "(continue-inference 1 4 (quote (:max-number 10)))"
        );

        assert_eq!(
            lock(&recorder.seen).as_slice(),
            [
                "not-started -> working",
                "+3",
                "working -> suspended",
                "suspended -> working",
                "+1",
                "+1",
                "working -> done",
            ]
        );
        query.close().await;
    }

    #[tokio::test]
    async fn test_clear_results_then_rerun_matches() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(report(Some("done"), None, 0, vec![binding("Emu-1"), binding("Emu-2")]))
        });
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );

        let first = query.answer_count().await.unwrap();
        query.clear_results().await.unwrap();
        assert_eq!(query.status(), InferenceStatus::NotStarted);
        assert!(query.answers().is_empty());
        assert_eq!(server.count("destroy-inference"), 1);

        assert_eq!(query.answer_count().await.unwrap(), first);
        assert_eq!(server.count("run-query"), 2);
        query.close().await;
    }

    #[tokio::test]
    async fn test_misuse_fails_before_any_request() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| Ok(report(Some("done"), None, 0, Vec::new())));
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );

        query.perform_inference().await.unwrap();
        let sent = server.requests().len();

        assert!(query.start().await.unwrap_err().is_programming_error());
        assert!(query
            .continue_inference(None)
            .await
            .unwrap_err()
            .is_programming_error());
        assert!(query
            .set_properties(QueryProperties::default().continuable(true))
            .unwrap_err()
            .is_programming_error());
        assert_eq!(server.requests().len(), sent);
        query.close().await;
    }

    #[tokio::test]
    async fn test_worker_timeout_puts_query_in_error() {
        let server = FixtureServer::new();
        server.on_submit(|id, _| {
            vec![ServerEvent::Started {
                request_id: id,
                worker_id: WorkerId(1),
            }]
        });
        let connection = server.connect().await;

        let props = QueryProperties::default()
            .continuable(true)
            .with_timeout(Duration::from_millis(100));
        let query = Query::new(connection, emu_query(), Term::symbol("BiologyMt"), props);

        let result = query.perform_inference().await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
        assert_eq!(query.status(), InferenceStatus::Error);
        assert!(matches!(query.failure(), Some(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_abort() {
        let server = FixtureServer::new();
        server.on_submit(|id, _| {
            vec![ServerEvent::Started {
                request_id: id,
                worker_id: WorkerId(1),
            }]
        });
        let connection = server.connect().await;
        let props = QueryProperties::default().browsable(true);
        let query = Query::new(connection, emu_query(), Term::symbol("BiologyMt"), props);

        query.start().await.unwrap();
        assert_eq!(query.status(), InferenceStatus::Working);

        query.stop(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(server.count("cancel"), 1);
        assert_eq!(server.count("abort"), 1);
        assert_eq!(query.status(), InferenceStatus::Done);
        assert_eq!(
            query.worker().map(|w| w.status()),
            Some(WorkerStatus::Aborted)
        );
    }

    #[tokio::test]
    async fn test_close_releases_once() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(report(Some("done"), None, 0, vec![binding("Emu-1")]))
        });
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );
        query.perform_inference().await.unwrap();

        query.close().await;
        query.close().await;
        assert_eq!(server.count("destroy-inference"), 1);
        assert!(query.is_closed());
        assert!(!query.is_continuable());
        assert!(query.clear_results().await.is_err());
    }

    #[tokio::test]
    async fn test_server_error_report_fails_the_query() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(Term::list([
                Term::keyword("status"),
                Term::keyword("error"),
                Term::keyword("error"),
                Term::string("unknown microtheory"),
            ]))
        });
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("NoSuchMt"),
            QueryProperties::default(),
        );

        assert_eq!(
            query.perform_inference().await,
            Err(ClientError::Server("unknown microtheory".to_string()))
        );
        assert_eq!(query.status(), InferenceStatus::Error);
        assert!(query.answer_count().await.is_err());
    }

    #[tokio::test]
    async fn test_listeners_force_the_worker_path() {
        let server = FixtureServer::new();
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );
        assert!(!query.requires_worker());
        let recorder: Arc<dyn QueryListener> = Arc::new(Recorder::default());
        query.add_listener(Arc::clone(&recorder));
        assert!(query.requires_worker());

        assert!(query.remove_listener(&recorder));
        assert!(!query.remove_listener(&recorder));
        assert!(!query.requires_worker());
    }

    #[tokio::test]
    async fn test_close_during_a_slow_run_releases_the_late_inference() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(report(Some("done"), None, 0, vec![binding("Emu-1")]))
        });
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );

        // The reply waits behind a slow reconnect
        server.set_open_delay(Duration::from_millis(200));
        server.drop_connection();
        let running = tokio::spawn({
            let query = query.clone();
            async move { query.perform_inference().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        query.close().await;
        assert_eq!(query.status(), InferenceStatus::Error);
        assert_eq!(server.count("destroy-inference"), 0);

        let result = running.await.unwrap();
        assert!(result.unwrap_err().is_programming_error());
        for _ in 0..100 {
            if server.count("destroy-inference") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.count("destroy-inference"), 1);
        assert!(query.answers().is_empty());
        assert_eq!(query.inference_id(), None);
    }

    #[tokio::test]
    async fn test_close_ends_a_running_worker_run() {
        let server = FixtureServer::new();
        server.on_submit(|id, _| {
            vec![ServerEvent::Started {
                request_id: id,
                worker_id: WorkerId(1),
            }]
        });
        let connection = server.connect().await;
        let props = QueryProperties::default().continuable(true);
        let query = Query::new(connection, emu_query(), Term::symbol("BiologyMt"), props);

        query.start().await.unwrap();
        let waiting = tokio::spawn({
            let query = query.clone();
            async move { query.inner.wait_run(1).await }
        });
        query.close().await;

        assert!(waiting.await.unwrap().unwrap_err().is_programming_error());
        assert_eq!(query.status(), InferenceStatus::Error);
        assert_eq!(server.count("abort"), 1);
        assert_eq!(
            query.worker().map(|w| w.status()),
            Some(WorkerStatus::Aborted)
        );
        assert!(query.start().await.is_err());
        assert_eq!(server.count("start-inference"), 1);
    }

    #[tokio::test]
    async fn test_answer_index_past_usize_is_rejected() {
        let server = FixtureServer::new();
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );

        let err = query.answer(usize::MAX).await.unwrap_err();
        assert!(err.is_programming_error());
        assert_eq!(server.count("run-query"), 0);
    }

    #[tokio::test]
    async fn test_answer_gap_is_a_protocol_error() {
        let server = FixtureServer::new();
        server.on_eval("run-query", |_| {
            Ok(report(Some("done"), None, 2, vec![binding("Emu-3")]))
        });
        let connection = server.connect().await;
        let query = Query::new(
            connection,
            emu_query(),
            Term::symbol("BiologyMt"),
            QueryProperties::default(),
        );

        let result = query.perform_inference().await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(query.status(), InferenceStatus::Error);
        assert!(query.answers().is_empty());
        query.close().await;
    }
}
