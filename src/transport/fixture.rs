//! Scripted in-process server for tests
//!
//! Records every request across every session it opens and answers from
//! per-command handlers. Submitted tasks emit whatever events the submit
//! handler returns, in order, on the session's event channel.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EventSender, Request, ServerEvent, TransportError, TransportFactory, TransportSession};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::types::{RequestId, SessionIdentity, Term};

type EvalHandler = Box<dyn Fn(&Term) -> Result<Term, TransportError> + Send + Sync>;
type SubmitHandler = Box<dyn Fn(RequestId, &Term) -> Vec<ServerEvent> + Send + Sync>;

pub(crate) struct FixtureServer {
    state: Mutex<State>,
    opens: AtomicUsize,
}

struct State {
    requests: Vec<Request>,
    image: String,
    eval_handlers: HashMap<String, EvalHandler>,
    submit_handler: Option<SubmitHandler>,
    failures: HashMap<String, usize>,
    failing_opens: usize,
    open_delay: Duration,
    current: Option<Arc<FixtureSession>>,
}

/// Key used for scripting and counting: the command head for eval/submit,
/// the request kind otherwise.
pub(crate) fn request_key(request: &Request) -> String {
    match request {
        Request::Eval { command } | Request::Submit { command, .. } => command_head(command),
        other => other.kind().to_string(),
    }
}

fn command_head(command: &Term) -> String {
    command
        .as_list()
        .and_then(|items| items.first())
        .and_then(Term::as_symbol)
        .unwrap_or_default()
        .to_string()
}

impl FixtureServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                requests: Vec::new(),
                image: "image-1".to_string(),
                eval_handlers: HashMap::new(),
                submit_handler: None,
                failures: HashMap::new(),
                failing_opens: 0,
                open_delay: Duration::ZERO,
                current: None,
            }),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn TransportFactory> {
        Arc::new(FixtureFactory(Arc::clone(self)))
    }

    /// Connection manager over this fixture with default settings
    pub async fn connect(self: &Arc<Self>) -> Arc<ConnectionManager> {
        self.connect_with(ClientConfig::default()).await
    }

    pub async fn connect_with(self: &Arc<Self>, config: ClientConfig) -> Arc<ConnectionManager> {
        ConnectionManager::connect(config, self.factory())
            .await
            .expect("fixture connect")
    }

    pub fn set_image(&self, image: &str) {
        self.state.lock().unwrap().image = image.to_string();
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().unwrap().open_delay = delay;
    }

    pub fn on_eval(
        &self,
        head: &str,
        handler: impl Fn(&Term) -> Result<Term, TransportError> + Send + Sync + 'static,
    ) {
        self.state
            .lock()
            .unwrap()
            .eval_handlers
            .insert(head.to_string(), Box::new(handler));
    }

    pub fn on_submit(
        &self,
        handler: impl Fn(RequestId, &Term) -> Vec<ServerEvent> + Send + Sync + 'static,
    ) {
        self.state.lock().unwrap().submit_handler = Some(Box::new(handler));
    }

    /// Make the next `times` requests with this key fail as a dropped connection
    pub fn fail_next(&self, key: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(key.to_string(), times);
    }

    pub fn fail_opens(&self, times: usize) {
        self.state.lock().unwrap().failing_opens = times;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, key: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| request_key(r) == key)
            .count()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Push an event on the live session
    pub async fn emit(&self, event: ServerEvent) {
        let sender = self
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .and_then(|s| s.sender());
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Break the live session as if the socket died
    pub fn drop_connection(&self) {
        if let Some(session) = self.state.lock().unwrap().current.clone() {
            session.sever();
        }
    }

    fn handle(&self, session: &FixtureSession, request: Request) -> Result<Term, TransportError> {
        let key = request_key(&request);
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if let Some(remaining) = state.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                drop(state);
                session.sever();
                return Err(TransportError::Closed(format!("scripted failure on {key}")));
            }
        }

        match request {
            Request::Eval { command } => match state.eval_handlers.get(&key) {
                Some(handler) => handler(&command),
                None => Ok(default_reply(&key, &command, &state.image)),
            },
            Request::Submit {
                request_id,
                command,
                ..
            } => {
                let events = state
                    .submit_handler
                    .as_ref()
                    .map(|h| h(request_id, &command))
                    .unwrap_or_default();
                if let Some(sender) = session.sender() {
                    tokio::spawn(async move {
                        for event in events {
                            if sender.send(event).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Ok(Term::Nil)
            }
            Request::Cancel { .. } | Request::Abort { .. } => Ok(Term::Bool(true)),
        }
    }
}

fn default_reply(key: &str, command: &Term, image: &str) -> Term {
    match key {
        "server-image-id" => Term::string(image),
        // Grant whatever was asked for
        "acquire-api-lease" => command
            .as_list()
            .and_then(|items| items.get(1))
            .cloned()
            .unwrap_or(Term::Nil),
        _ => Term::Bool(true),
    }
}

struct FixtureFactory(Arc<FixtureServer>);

#[async_trait]
impl TransportFactory for FixtureFactory {
    async fn open(
        &self,
        _identity: &SessionIdentity,
        events: EventSender,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.0.state.lock().unwrap().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.0.state.lock().unwrap();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Unreachable("scripted open failure".into()));
        }
        let session = Arc::new(FixtureSession {
            server: Arc::clone(&self.0),
            valid: AtomicBool::new(true),
            events: Mutex::new(Some(events)),
        });
        state.current = Some(Arc::clone(&session));
        Ok(session)
    }
}

pub(crate) struct FixtureSession {
    server: Arc<FixtureServer>,
    valid: AtomicBool,
    events: Mutex<Option<EventSender>>,
}

impl FixtureSession {
    fn sender(&self) -> Option<EventSender> {
        self.events.lock().unwrap().clone()
    }

    fn sever(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

#[async_trait]
impl TransportSession for FixtureSession {
    async fn send(&self, request: Request) -> Result<Term, TransportError> {
        if !self.is_valid() {
            return Err(TransportError::Closed("fixture session severed".into()));
        }
        self.server.handle(self, request)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.sever();
    }
}
