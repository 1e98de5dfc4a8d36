//! Demo worker: counts what it receives and reports the tallies.
//!
//! Requests are answered with `{"requests": r, "messages": m}`. Each note
//! bumps the message count and sends the same tally back to the master.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

use crate::master::{Listener, Master};
use crate::worker::Worker;

#[derive(Debug, Default)]
struct Tally {
    requests: AtomicU64,
    messages: AtomicU64,
}

impl Tally {
    fn snapshot(&self) -> Value {
        json!({
            "requests": self.requests.load(Ordering::SeqCst),
            "messages": self.messages.load(Ordering::SeqCst),
        })
    }
}

/// Installs the counting handlers on `worker`.
pub fn install_counters(worker: &mut Worker) {
    let tally = Arc::new(Tally::default());
    let notifier = worker.notifier();

    let requests = Arc::clone(&tally);
    worker.on_request(move |_content: Value| {
        let tally = Arc::clone(&requests);
        async move {
            tally.requests.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(tally.snapshot())
        }
    });

    worker.on_message(move |_content: Value| {
        tracing::info!("Received message in worker");
        tally.messages.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = notifier.send_msg(tally.snapshot()) {
            tracing::warn!(error = %e, "Failed to report tally");
        }
    });
}

/// Logs every note, close and error the master sees from its workers.
pub fn log_worker_events(master: &Master) {
    master.on(Listener::message(|worker, content| {
        tracing::info!(worker_id = %worker, message = %content, "Received a message from worker");
    }));
    master.on(Listener::close(|worker| {
        tracing::warn!(worker_id = %worker, "Worker exited");
    }));
    master.on(Listener::error(|worker, e| {
        tracing::error!(worker_id = %worker, error = %e, "Worker channel failed");
    }));
}
