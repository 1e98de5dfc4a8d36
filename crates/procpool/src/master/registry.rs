//! Worker registry and response correlation.
//!
//! Owned by the master event loop; nothing here is shared or locked. Each
//! worker entry carries its own request counter, pending-response table and
//! outstanding pings.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::protocol::{Message, RequestId, ResponseStatus, WorkerId};
use crate::error::{IpcError, Result};

pub(crate) type Completion = oneshot::Sender<Result<Value>>;
pub(crate) type PingCompletion = oneshot::Sender<Result<Duration>>;

struct PendingResponse {
    completion: Completion,
    enqueued_at: Instant,
}

struct PendingPing {
    completion: PingCompletion,
    enqueued_at: Instant,
}

pub(crate) struct WorkerHandle {
    id: WorkerId,
    /// Distinguishes this registration from earlier ones under the same id.
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    next_request_id: u64,
    pending: HashMap<RequestId, PendingResponse>,
    pings: VecDeque<PendingPing>,
    reader: Option<JoinHandle<()>>,
    #[allow(dead_code)] // held so the child is reaped with its registration
    child: Option<Child>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        outbound: mpsc::UnboundedSender<Message>,
        reader: Option<JoinHandle<()>>,
        child: Option<Child>,
    ) -> Self {
        Self {
            id,
            generation: 0,
            outbound,
            next_request_id: 0,
            pending: HashMap::new(),
            pings: VecDeque::new(),
            reader,
            child,
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| IpcError::Channel(format!("worker {} writer has stopped", self.id)))
    }

    /// Fails every outstanding request and ping with `error`.
    fn fail_outstanding(&mut self, error: impl Fn() -> IpcError) {
        for (request_id, pending) in self.pending.drain() {
            tracing::debug!(worker_id = %self.id, %request_id, "Failing pending request");
            let _ = pending.completion.send(Err(error()));
        }
        for ping in self.pings.drain(..) {
            let _ = ping.completion.send(Err(error()));
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

pub(crate) struct Registry {
    workers: IndexMap<WorkerId, WorkerHandle>,
    request_timeout: Duration,
    next_generation: u64,
}

impl Registry {
    pub(crate) fn new(request_timeout: Duration) -> Self {
        Self {
            workers: IndexMap::new(),
            request_timeout,
            next_generation: 0,
        }
    }

    pub(crate) fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    /// Reserves the generation the next inserted worker will carry.
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn insert(&mut self, mut handle: WorkerHandle, generation: u64) -> Result<()> {
        if self.workers.contains_key(&handle.id) {
            return Err(IpcError::invalid_argument(format!(
                "worker {} is already registered",
                handle.id
            )));
        }
        handle.generation = generation;
        self.workers.insert(handle.id.clone(), handle);
        Ok(())
    }

    /// True if `id` is registered under exactly this `generation`.
    pub(crate) fn is_current(&self, id: &WorkerId, generation: u64) -> bool {
        self.workers
            .get(id)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Registered worker ids in registration order.
    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }

    /// Removes a worker registration, failing whatever it still owes.
    pub(crate) fn remove(&mut self, id: &WorkerId, generation: u64) -> bool {
        if !self.is_current(id, generation) {
            return false;
        }
        tracing::debug!(worker_id = %id, "Cleaning up after worker");
        match self.workers.shift_remove(id) {
            Some(mut handle) => {
                handle.fail_outstanding(|| IpcError::WorkerGone(id.clone()));
                true
            }
            None => false,
        }
    }

    /// Drops every registration; used when the master shuts down.
    pub(crate) fn clear(&mut self) {
        for (_, mut handle) in self.workers.drain(..) {
            handle.fail_outstanding(|| IpcError::Closed);
        }
    }

    /// Sends a note to one worker, or to every worker in registration order.
    pub(crate) fn send_note(&self, content: Value, worker: Option<&WorkerId>) -> Result<()> {
        match worker {
            Some(id) => {
                let handle = self
                    .workers
                    .get(id)
                    .ok_or_else(|| IpcError::UnknownWorker(id.clone()))?;
                tracing::debug!(worker_id = %id, "Sending message to worker");
                handle.send(Message::note(content))
            }
            None => {
                tracing::debug!(workers = self.workers.len(), "Sending message to all workers");
                for handle in self.workers.values() {
                    if let Err(e) = handle.send(Message::note(content.clone())) {
                        tracing::warn!(worker_id = %handle.id, error = %e, "Failed to queue message");
                    }
                }
                Ok(())
            }
        }
    }

    /// Sends a request and parks `completion` until the response, a timeout
    /// or the worker's exit resolves it.
    pub(crate) fn send_request(
        &mut self,
        content: Value,
        worker: Option<&WorkerId>,
        completion: Completion,
    ) {
        let Some(id) = worker else {
            let _ = completion.send(Err(IpcError::MissingWorkerId));
            return;
        };
        let Some(handle) = self.workers.get_mut(id) else {
            let _ = completion.send(Err(IpcError::UnknownWorker(id.clone())));
            return;
        };

        let request_id = handle.next_request_id();
        tracing::debug!(worker_id = %id, %request_id, "Sending request to worker");

        let request = match Message::request(content, Some(request_id)) {
            Ok(request) => request,
            Err(e) => {
                let _ = completion.send(Err(e));
                return;
            }
        };

        if let Err(e) = handle.send(request) {
            let _ = completion.send(Err(e));
            return;
        }

        tracing::trace!(worker_id = %id, %request_id, "Adding response handler");
        handle.pending.insert(
            request_id,
            PendingResponse {
                completion,
                enqueued_at: Instant::now(),
            },
        );
    }

    /// Resolves the pending entry for a response. Returns false when there is
    /// none (already timed out, duplicate, or never sent).
    pub(crate) fn resolve_response(
        &mut self,
        worker: &WorkerId,
        request_id: RequestId,
        status: ResponseStatus,
        content: Value,
    ) -> bool {
        let Some(pending) = self
            .workers
            .get_mut(worker)
            .and_then(|handle| handle.pending.remove(&request_id))
        else {
            return false;
        };

        tracing::trace!(worker_id = %worker, %request_id, "Removing response handler");
        let result = match status {
            ResponseStatus::Ok => Ok(content),
            ResponseStatus::Error => Err(IpcError::Handler(describe(content))),
        };
        if pending.completion.send(result).is_err() {
            tracing::debug!(worker_id = %worker, %request_id, "Requester went away before response");
        }
        true
    }

    pub(crate) fn send_ping(&mut self, worker: &WorkerId, completion: PingCompletion) {
        let Some(handle) = self.workers.get_mut(worker) else {
            let _ = completion.send(Err(IpcError::UnknownWorker(worker.clone())));
            return;
        };
        if let Err(e) = handle.send(Message::ping()) {
            let _ = completion.send(Err(e));
            return;
        }
        handle.pings.push_back(PendingPing {
            completion,
            enqueued_at: Instant::now(),
        });
    }

    /// Pongs carry no id; a worker channel is FIFO so each answers the oldest ping.
    pub(crate) fn resolve_pong(&mut self, worker: &WorkerId) -> Result<()> {
        let ping = self
            .workers
            .get_mut(worker)
            .and_then(|handle| handle.pings.pop_front())
            .ok_or_else(|| IpcError::protocol("unexpected pong"))?;
        let _ = ping.completion.send(Ok(ping.enqueued_at.elapsed()));
        Ok(())
    }

    /// Expires every pending request and ping older than the timeout, across
    /// all workers. Returns how many were expired.
    pub(crate) fn sweep(&mut self, now: Instant) -> usize {
        tracing::trace!("Cleaning up request handlers");
        let timeout = self.request_timeout;
        let mut expired = 0;

        for handle in self.workers.values_mut() {
            let stale: Vec<RequestId> = handle
                .pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.enqueued_at) > timeout)
                .map(|(request_id, _)| *request_id)
                .collect();

            for request_id in stale {
                if let Some(pending) = handle.pending.remove(&request_id) {
                    tracing::info!(worker_id = %handle.id, %request_id, "Request timed out");
                    let _ = pending.completion.send(Err(IpcError::RequestTimeout {
                        worker_id: handle.id.clone(),
                        request_id,
                    }));
                    expired += 1;
                }
            }

            while handle
                .pings
                .front()
                .is_some_and(|p| now.saturating_duration_since(p.enqueued_at) > timeout)
            {
                if let Some(ping) = handle.pings.pop_front() {
                    tracing::info!(worker_id = %handle.id, "Ping timed out");
                    let _ = ping
                        .completion
                        .send(Err(IpcError::PingTimeout(handle.id.clone())));
                    expired += 1;
                }
            }
        }

        expired
    }

    #[cfg(test)]
    fn pending_count(&self, worker: &WorkerId) -> usize {
        self.workers
            .get(worker)
            .map(|handle| handle.pending.len())
            .unwrap_or(0)
    }
}

/// Error responses carry their description as a string; anything else is
/// rendered as JSON.
fn describe(content: Value) -> String {
    match content {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn add_worker(
        registry: &mut Registry,
        id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = registry.next_generation();
        registry
            .insert(WorkerHandle::new(WorkerId::from(id), tx, None, None), generation)
            .unwrap();
        (generation, rx)
    }

    fn request(
        registry: &mut Registry,
        worker: Option<&str>,
        content: Value,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let worker = worker.map(WorkerId::from);
        registry.send_request(content, worker.as_ref(), tx);
        rx
    }

    fn sent_request_id(rx: &mut mpsc::UnboundedReceiver<Message>) -> RequestId {
        match rx.try_recv().unwrap() {
            Message::Request { request_id, .. } => request_id,
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn request_ids_increase_per_worker() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let (_, mut b) = add_worker(&mut registry, "b");

        let _r1 = request(&mut registry, Some("a"), json!(1));
        let _r2 = request(&mut registry, Some("a"), json!(2));
        let _r3 = request(&mut registry, Some("b"), json!(3));
        let _r4 = request(&mut registry, Some("a"), json!(4));

        assert_eq!(sent_request_id(&mut a), RequestId::new(0));
        assert_eq!(sent_request_id(&mut a), RequestId::new(1));
        assert_eq!(sent_request_id(&mut a), RequestId::new(2));
        assert_eq!(sent_request_id(&mut b), RequestId::new(0));
    }

    #[test]
    fn request_ids_are_not_reused_after_resolution() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let _r = request(&mut registry, Some("a"), json!(null));
        let first = sent_request_id(&mut a);
        assert!(registry.resolve_response(&id, first, ResponseStatus::Ok, json!(null)));

        let _r = request(&mut registry, Some("a"), json!(null));
        assert!(sent_request_id(&mut a) > first);
    }

    #[test]
    fn missing_worker_id_fails_request() {
        let mut registry = Registry::new(TIMEOUT);
        let mut rx = request(&mut registry, None, json!({}));
        assert_eq!(rx.try_recv().unwrap(), Err(IpcError::MissingWorkerId));
    }

    #[test]
    fn unknown_worker_fails_request_without_sending() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");

        let mut rx = request(&mut registry, Some("z"), json!({}));

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(IpcError::UnknownWorker(WorkerId::from("z")))
        );
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn ok_response_resolves_with_content() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let mut rx = request(&mut registry, Some("a"), json!({"op": "count"}));
        let request_id = sent_request_id(&mut a);

        assert!(registry.resolve_response(&id, request_id, ResponseStatus::Ok, json!({"n": 1})));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!({"n": 1})));
        assert_eq!(registry.pending_count(&id), 0);
    }

    #[test]
    fn error_response_resolves_with_handler_error() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let mut rx = request(&mut registry, Some("a"), json!({}));
        let request_id = sent_request_id(&mut a);

        registry.resolve_response(&id, request_id, ResponseStatus::Error, json!("bad input"));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(IpcError::Handler("bad input".to_string()))
        );
    }

    #[test]
    fn duplicate_response_is_dropped() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let _rx = request(&mut registry, Some("a"), json!({}));
        let request_id = sent_request_id(&mut a);

        assert!(registry.resolve_response(&id, request_id, ResponseStatus::Ok, json!(1)));
        assert!(!registry.resolve_response(&id, request_id, ResponseStatus::Ok, json!(2)));
    }

    #[test]
    fn sweep_expires_only_stale_requests() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let mut rx = request(&mut registry, Some("a"), json!({}));
        let request_id = sent_request_id(&mut a);

        assert_eq!(registry.sweep(Instant::now()), 0);
        assert_eq!(registry.pending_count(&id), 1);

        let later = Instant::now() + TIMEOUT + Duration::from_secs(1);
        assert_eq!(registry.sweep(later), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(IpcError::RequestTimeout {
                worker_id: id.clone(),
                request_id,
            })
        );

        // A late response finds nothing to resolve.
        assert!(!registry.resolve_response(&id, request_id, ResponseStatus::Ok, json!(1)));
    }

    #[test]
    fn sweep_reaches_every_worker() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, _a) = add_worker(&mut registry, "a");
        let (_, _b) = add_worker(&mut registry, "b");

        let _ra = request(&mut registry, Some("a"), json!({}));
        let _rb = request(&mut registry, Some("b"), json!({}));

        let later = Instant::now() + TIMEOUT + Duration::from_secs(1);
        assert_eq!(registry.sweep(later), 2);
    }

    #[test]
    fn broadcast_follows_registration_order() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut b) = add_worker(&mut registry, "b");
        let (_, mut a) = add_worker(&mut registry, "a");

        registry.send_note(json!({"ping": true}), None).unwrap();

        assert_eq!(registry.ids(), vec![WorkerId::from("b"), WorkerId::from("a")]);
        assert_eq!(b.try_recv().unwrap(), Message::note(json!({"ping": true})));
        assert_eq!(a.try_recv().unwrap(), Message::note(json!({"ping": true})));
    }

    #[test]
    fn note_to_unknown_worker_fails() {
        let registry = Registry::new(TIMEOUT);
        let err = registry
            .send_note(json!({}), Some(&WorkerId::from("nope")))
            .unwrap_err();
        assert_eq!(err, IpcError::UnknownWorker(WorkerId::from("nope")));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, _a) = add_worker(&mut registry, "a");

        let (tx, _rx) = mpsc::unbounded_channel();
        let generation = registry.next_generation();
        let err = registry
            .insert(WorkerHandle::new(WorkerId::from("a"), tx, None, None), generation)
            .unwrap_err();
        assert!(matches!(err, IpcError::InvalidArgument(_)));
    }

    #[test]
    fn removal_fails_pending_with_worker_gone() {
        let mut registry = Registry::new(TIMEOUT);
        let (generation, _a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let mut rx = request(&mut registry, Some("a"), json!({}));

        assert!(registry.remove(&id, generation));
        assert_eq!(rx.try_recv().unwrap(), Err(IpcError::WorkerGone(id.clone())));
        assert!(!registry.contains(&id));
    }

    #[test]
    fn stale_generation_does_not_remove_new_registration() {
        let mut registry = Registry::new(TIMEOUT);
        let (old, _a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");
        assert!(registry.remove(&id, old));

        let (_new, _a2) = add_worker(&mut registry, "a");
        assert!(!registry.remove(&id, old));
        assert!(registry.contains(&id));
    }

    #[test]
    fn pong_answers_oldest_ping() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, mut a) = add_worker(&mut registry, "a");
        let id = WorkerId::from("a");

        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        registry.send_ping(&id, tx1);
        registry.send_ping(&id, tx2);
        assert_eq!(a.try_recv().unwrap(), Message::Ping);

        registry.resolve_pong(&id).unwrap();
        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unsolicited_pong_is_protocol_error() {
        let mut registry = Registry::new(TIMEOUT);
        let (_, _a) = add_worker(&mut registry, "a");
        assert!(matches!(
            registry.resolve_pong(&WorkerId::from("a")),
            Err(IpcError::Protocol(_))
        ));
    }
}
