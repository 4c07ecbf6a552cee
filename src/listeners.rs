//! Ordered listener lists with guarded invocation
//!
//! Lists are copied before firing so callbacks never run under the lock, and
//! a callback that errors or panics is logged and skipped.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::sync::lock;

pub(crate) struct ListenerList<L: ?Sized> {
    entries: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerList<L> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        lock(&self.entries).push(listener);
    }

    /// Remove the first registration of this exact listener
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = lock(&self.entries);
        let target = Arc::as_ptr(listener);
        match entries
            .iter()
            .position(|l| std::ptr::addr_eq(Arc::as_ptr(l), target))
        {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Registration-ordered copy for firing
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run one listener callback, containing any failure
pub(crate) fn invoke_guarded(callback: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(callback, "Listener failed: {:#}", e),
        Err(panic) => error!(callback, "Listener panicked: {}", panic_message(&panic)),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
