//! Lifecycle and message listeners registered on the master.
//!
//! Each event has a single slot: registering a listener replaces whatever was
//! there, clearing it restores the no-op.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde_json::Value;

use crate::bridge::protocol::WorkerId;
use crate::error::{IpcError, Result};

pub type MessageListener = Arc<dyn Fn(&WorkerId, Value) + Send + Sync>;
pub type CloseListener = Arc<dyn Fn(&WorkerId) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&WorkerId, &IpcError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Close,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Close => "close",
            Self::Error => "error",
        }
    }
}

impl FromStr for EventKind {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(Self::Message),
            "close" => Ok(Self::Close),
            "error" => Ok(Self::Error),
            other => Err(IpcError::invalid_argument(format!(
                "invalid event name: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listener for one master event.
pub enum Listener {
    /// Note from a worker: `(worker_id, content)`.
    Message(MessageListener),
    /// Worker channel closed: `(worker_id)`.
    Close(CloseListener),
    /// Worker channel failed: `(worker_id, error)`.
    Error(ErrorListener),
}

impl Listener {
    pub fn message(f: impl Fn(&WorkerId, Value) + Send + Sync + 'static) -> Self {
        Self::Message(Arc::new(f))
    }

    pub fn close(f: impl Fn(&WorkerId) + Send + Sync + 'static) -> Self {
        Self::Close(Arc::new(f))
    }

    pub fn error(f: impl Fn(&WorkerId, &IpcError) + Send + Sync + 'static) -> Self {
        Self::Error(Arc::new(f))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Close(_) => EventKind::Close,
            Self::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    message: Option<MessageListener>,
    close: Option<CloseListener>,
    error: Option<ErrorListener>,
}

impl Listeners {
    pub(crate) fn set(&mut self, listener: Listener) {
        match listener {
            Listener::Message(f) => self.message = Some(f),
            Listener::Close(f) => self.close = Some(f),
            Listener::Error(f) => self.error = Some(f),
        }
    }

    pub(crate) fn clear(&mut self, kind: EventKind) {
        match kind {
            EventKind::Message => self.message = None,
            EventKind::Close => self.close = None,
            EventKind::Error => self.error = None,
        }
    }
}

/// Listener slots shared between master handles and the event loop.
///
/// Listeners are cloned out before being invoked so a listener may call
/// `on`/`off` itself.
#[derive(Clone, Default)]
pub(crate) struct SharedListeners(Arc<StdMutex<Listeners>>);

impl SharedListeners {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Listeners> {
        // Listeners run outside the lock, so a poisoned lock still holds
        // consistent slots.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit_message(&self, worker: &WorkerId, content: Value) {
        let listener = self.lock().message.clone();
        if let Some(f) = listener {
            guard("message", worker, move || f(worker, content));
        }
    }

    pub(crate) fn emit_close(&self, worker: &WorkerId) {
        let listener = self.lock().close.clone();
        if let Some(f) = listener {
            guard("close", worker, move || f(worker));
        }
    }

    pub(crate) fn emit_error(&self, worker: &WorkerId, error: &IpcError) {
        let listener = self.lock().error.clone();
        if let Some(f) = listener {
            guard("error", worker, move || f(worker, error));
        }
    }
}

fn guard(event: &'static str, worker: &WorkerId, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(worker_id = %worker, event, "Listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn event_kind_parses_known_names() {
        assert_eq!("message".parse::<EventKind>().unwrap(), EventKind::Message);
        assert_eq!("close".parse::<EventKind>().unwrap(), EventKind::Close);
        assert_eq!("error".parse::<EventKind>().unwrap(), EventKind::Error);
        assert!(matches!(
            "request".parse::<EventKind>(),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn second_listener_replaces_first() {
        let shared = SharedListeners::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        shared.lock().set(Listener::close(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        let s = Arc::clone(&second);
        shared.lock().set(Listener::close(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        shared.emit_close(&WorkerId::from("a"));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleared_listener_is_not_called() {
        let shared = SharedListeners::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        shared.lock().set(Listener::message(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        shared.lock().clear(EventKind::Message);

        shared.emit_message(&WorkerId::from("a"), Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_is_contained() {
        let shared = SharedListeners::default();
        shared.lock().set(Listener::error(|worker, _| {
            if worker.as_str() == "a" {
                panic!("listener bug");
            }
        }));

        shared.emit_error(&WorkerId::from("a"), &IpcError::Closed);
    }

    #[test]
    fn listener_reports_its_kind() {
        assert_eq!(Listener::message(|_, _| {}).kind(), EventKind::Message);
        assert_eq!(Listener::close(|_| {}).kind(), EventKind::Close);
        assert_eq!(Listener::error(|_, _| {}).kind(), EventKind::Error);
    }
}
