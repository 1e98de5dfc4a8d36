//! Worker dispatcher - runs inside each worker subprocess.
//!
//! This module provides the child side of the master/worker protocol.
//! The parent side (registry, correlation, timeouts) is in master/.
//!
//! Architecture:
//! - One loop classifies inbound messages strictly in arrival order
//! - A Request's handler is started (polled once) before the next frame is
//!   read; if it suspends, it keeps running alongside later messages
//! - All outbound frames go through a single writer task
//! - When the parent closes the channel, in-flight requests are given
//!   [`DRAIN_TIMEOUT`] to answer before the worker exits

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::channel::{Channel, ChannelWriter};
use crate::bridge::protocol::Message;
use crate::error::{IpcError, Result};

/// How long a closing worker waits for in-flight requests and queued writes.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handler for requests from the master.
///
/// Returning `Err` (or panicking) sends an error Response carrying the error's
/// description. Closures `Fn(Value) -> impl Future<Output = anyhow::Result<Value>>`
/// implement this trait.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, content: Value) -> anyhow::Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, content: Value) -> anyhow::Result<Value> {
        (self)(content).await
    }
}

/// Handler for fire-and-forget notes from the master.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, content: Value);
}

impl<F> MessageHandler for F
where
    F: Fn(Value) + Send + Sync + 'static,
{
    fn handle(&self, content: Value) {
        (self)(content)
    }
}

/// Answers every request with an empty success so an unconfigured worker
/// still speaks the protocol.
struct EmptyResponse;

#[async_trait::async_trait]
impl RequestHandler for EmptyResponse {
    async fn handle(&self, _content: Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

struct IgnoreMessage;

impl MessageHandler for IgnoreMessage {
    fn handle(&self, _content: Value) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Request,
    Message,
}

impl FromStr for HandlerKind {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(Self::Request),
            "message" => Ok(Self::Message),
            other => Err(IpcError::invalid_argument(format!("unknown event: {}", other))),
        }
    }
}

/// Sends notes to the master from anywhere in the worker (including handlers).
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Message>,
}

impl Notifier {
    pub fn send_msg(&self, content: Value) -> Result<()> {
        self.tx
            .send(Message::note(content))
            .map_err(|_| IpcError::Channel("parent channel closed".to_string()))
    }
}

#[derive(Clone)]
struct Dispatcher {
    request: Arc<dyn RequestHandler>,
    message: Arc<dyn MessageHandler>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Dispatcher {
    fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| IpcError::Channel("parent channel closed".to_string()))
    }

    /// Handles one inbound message. For a Request, returns the future that
    /// answers it; the caller drives it.
    fn dispatch(&self, msg: Message) -> Result<Option<BoxFuture<'static, ()>>> {
        match msg {
            Message::Ping => self.send(Message::pong()).map(|()| None),
            Message::Note { content } => {
                let handler = Arc::clone(&self.message);
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(move || handler.handle(content)));
                if let Err(panic) = outcome {
                    tracing::error!(
                        error = %panic_message(panic.as_ref()),
                        "Message handler panicked"
                    );
                }
                Ok(None)
            }
            mut request @ Message::Request { .. } => {
                let content = match &mut request {
                    Message::Request { content, .. } => std::mem::take(content),
                    _ => Value::Null,
                };
                let this = self.clone();
                Ok(Some(
                    async move { this.answer(request, content).await }.boxed(),
                ))
            }
            other => Err(IpcError::protocol(format!(
                "invalid message type: {}",
                other.kind()
            ))),
        }
    }

    /// Runs the request handler and sends exactly one Response for `request`.
    async fn answer(&self, request: Message, content: Value) {
        let outcome = AssertUnwindSafe(self.request.handle(content))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(result)) => Message::response(&request, result),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Exception in worker process");
                Message::error_response(&request, e.to_string())
            }
            Err(panic) => {
                let explanation = panic_message(panic.as_ref());
                tracing::error!(error = %explanation, "Exception while processing request");
                Message::error_response(&request, explanation)
            }
        };

        let sent = response.and_then(|resp| self.send(resp));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Failed to send response");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

/// Worker side of a channel: owns the two handler slots and the dispatch loop.
pub struct Worker {
    channel: Channel,
    request: Arc<dyn RequestHandler>,
    message: Arc<dyn MessageHandler>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
}

impl Worker {
    pub fn new(channel: Channel) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            request: Arc::new(EmptyResponse),
            message: Arc::new(IgnoreMessage),
            outbound_tx,
            outbound_rx,
        }
    }

    /// Worker talking to its parent over stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(Channel::stdio())
    }

    /// Replaces the request handler.
    pub fn on_request(&mut self, handler: impl RequestHandler) -> &mut Self {
        self.request = Arc::new(handler);
        self
    }

    /// Replaces the message handler.
    pub fn on_message(&mut self, handler: impl MessageHandler) -> &mut Self {
        self.message = Arc::new(handler);
        self
    }

    /// Restores the default handler for `kind`.
    pub fn off(&mut self, kind: HandlerKind) -> &mut Self {
        match kind {
            HandlerKind::Request => self.request = Arc::new(EmptyResponse),
            HandlerKind::Message => self.message = Arc::new(IgnoreMessage),
        }
        self
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.outbound_tx.clone(),
        }
    }

    /// Run the dispatch loop until the parent closes the channel.
    pub async fn run(self) -> io::Result<()> {
        let (mut reader, writer) = self.channel.into_split();
        let writer_task = tokio::spawn(write_outbound(writer, self.outbound_rx));

        let dispatcher = Dispatcher {
            request: self.request,
            message: self.message,
            outbound: self.outbound_tx,
        };

        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        let result = loop {
            tokio::select! {
                biased;

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                frame = reader.next() => match frame {
                    Some(Ok(Ok(msg))) => {
                        tracing::debug!(kind = msg.kind(), "Received message in worker");
                        match dispatcher.dispatch(msg) {
                            Ok(Some(mut answer)) => {
                                // Start the handler before the next frame is read.
                                if (&mut answer).now_or_never().is_none() {
                                    in_flight.push(answer);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::error!(error = %e, "Exception while processing message from parent");
                            }
                        }
                    }
                    Some(Ok(Err(e))) => {
                        tracing::error!(error = %e, "Exception while processing message from parent");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Parent channel error");
                        break Err(e);
                    }
                    None => {
                        tracing::info!("Parent channel closed, exiting");
                        break Ok(());
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            tracing::debug!(pending = in_flight.len(), "Waiting for in-flight requests");
            let drain = async { while in_flight.next().await.is_some() {} };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                tracing::warn!(pending = in_flight.len(), "Abandoning in-flight requests");
            }
        }

        // Closing the queue lets the writer flush what is left and stop.
        drop(in_flight);
        drop(dispatcher);
        let mut writer_task = writer_task;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            tracing::warn!("Outbound queue still open, dropping unsent messages");
            writer_task.abort();
        }
        result
    }
}

async fn write_outbound(mut writer: ChannelWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        tracing::debug!(kind = msg.kind(), "Sending message to parent");
        if let Err(e) = writer.send(msg).await {
            tracing::error!(error = %e, "Failed to write to parent");
            break;
        }
    }
    tracing::trace!("Worker writer exiting");
}
