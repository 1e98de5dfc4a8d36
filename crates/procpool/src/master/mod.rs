//! Master - registers worker channels and correlates requests with responses.
//!
//! Flow:
//! 1. Register a worker connection (channel + optional pid/child)
//! 2. Reader/writer tasks move frames between the channel and the event loop
//! 3. The event loop owns the registry: it assigns request ids, parks
//!    completions, routes responses and notes, and sweeps timed-out requests
//! 4. On channel close/error: drop the registration, fail what it still owes,
//!    notify the close/error listener

mod listeners;
mod registry;

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::bridge::channel::{Channel, ChannelReader, ChannelWriter};
use crate::bridge::protocol::{Message, WorkerId};
use crate::error::{IpcError, Result};

pub use listeners::{CloseListener, ErrorListener, EventKind, Listener, MessageListener};

use listeners::SharedListeners;
use registry::{Completion, PingCompletion, Registry, WorkerHandle};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Age after which a pending request (or ping) fails with a timeout.
    pub request_timeout: Duration,
    /// Period of the background sweep. `None` sweeps only when a worker
    /// sends something.
    pub sweep_interval: Option<Duration>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
        }
    }
}

impl MasterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// A worker's end of the pool as handed to [`Master::register`].
pub struct WorkerConnection {
    channel: Channel,
    pid: Option<u32>,
    child: Option<Child>,
}

impl WorkerConnection {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            pid: None,
            child: None,
        }
    }

    /// Connection over a spawned child's stdin/stdout; its pid becomes the
    /// default worker id.
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let channel = Channel::from_child(&mut child)?;
        Ok(Self {
            channel,
            pid: child.id(),
            child: Some(child),
        })
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl From<Channel> for WorkerConnection {
    fn from(channel: Channel) -> Self {
        Self::new(channel)
    }
}

enum Command {
    Register {
        connection: WorkerConnection,
        id: Option<WorkerId>,
        reply: oneshot::Sender<Result<WorkerId>>,
    },
    SendMsg {
        content: Value,
        worker: Option<WorkerId>,
        reply: oneshot::Sender<Result<()>>,
    },
    SendRequest {
        content: Value,
        worker: Option<WorkerId>,
        reply: Completion,
    },
    Ping {
        worker: WorkerId,
        reply: PingCompletion,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerId>>,
    },
}

enum WorkerEvent {
    Frame(Result<Message>),
    Error(IpcError),
    Closed,
}

struct Inbound {
    worker: WorkerId,
    generation: u64,
    event: WorkerEvent,
}

/// Handle to the master event loop.
///
/// Cheap to clone. The event loop runs until the last handle is dropped.
#[derive(Clone)]
pub struct Master {
    commands: mpsc::UnboundedSender<Command>,
    listeners: SharedListeners,
}

impl Master {
    /// Starts the event loop on the current tokio runtime.
    pub fn new(config: MasterConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let listeners = SharedListeners::default();

        tokio::spawn(run_event_loop(config, commands_rx, listeners.clone()));

        Self {
            commands,
            listeners,
        }
    }

    /// Registers one worker. Without `id`, the worker's pid is used.
    pub async fn register(
        &self,
        connection: impl Into<WorkerConnection>,
        id: Option<WorkerId>,
    ) -> Result<WorkerId> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Register {
                connection: connection.into(),
                id,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Registers workers in order; `ids[n]` (if present) names `connections[n]`.
    pub async fn register_all(
        &self,
        connections: Vec<WorkerConnection>,
        ids: Vec<Option<WorkerId>>,
    ) -> Result<Vec<WorkerId>> {
        let mut ids = ids.into_iter();
        let mut registered = Vec::with_capacity(connections.len());
        for connection in connections {
            let id = ids.next().flatten();
            registered.push(self.register(connection, id).await?);
        }
        Ok(registered)
    }

    /// Sends a note to `worker`, or to every registered worker when `None`.
    pub async fn send_msg(&self, content: Value, worker: Option<&WorkerId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::SendMsg {
                content,
                worker: worker.cloned(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Sends a request and waits for its response, a timeout or the worker's exit.
    pub async fn send_request(&self, content: Value, worker: Option<&WorkerId>) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::SendRequest {
                content,
                worker: worker.cloned(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Round-trips a ping, returning the time until the pong arrived.
    pub async fn ping(&self, worker: &WorkerId) -> Result<Duration> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Ping {
                worker: worker.clone(),
                reply,
            },
            rx,
        )
        .await?
    }

    /// Registered worker ids in registration order.
    pub async fn workers(&self) -> Result<Vec<WorkerId>> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Workers { reply }, rx).await
    }

    /// Sets the listener for its event, replacing any previous one.
    pub fn on(&self, listener: Listener) {
        tracing::info!(event = %listener.kind(), "Adding handler");
        self.listeners.lock().set(listener);
    }

    pub fn off(&self, event: EventKind) {
        tracing::info!(%event, "Removing handler");
        self.listeners.lock().clear(event);
    }

    async fn call<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.commands.send(command).map_err(|_| IpcError::Closed)?;
        rx.await.map_err(|_| IpcError::Closed)
    }
}

async fn run_event_loop(
    config: MasterConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    listeners: SharedListeners,
) {
    let mut registry = Registry::new(config.request_timeout);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();

    let mut sweep_timer = config.sweep_interval.map(|period| {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    });

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut registry, &inbound_tx, command),
                    None => {
                        tracing::debug!("All master handles dropped");
                        break;
                    }
                }
            }

            Some(inbound) = inbound_rx.recv() => {
                let swept = matches!(inbound.event, WorkerEvent::Frame(_));
                handle_inbound(&mut registry, &listeners, inbound);
                if swept {
                    registry.sweep(Instant::now());
                }
            }

            _ = tick(&mut sweep_timer) => {
                registry.sweep(Instant::now());
            }
        }
    }

    registry.clear();
    tracing::info!("Master event loop exiting");
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn handle_command(
    registry: &mut Registry,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    command: Command,
) {
    match command {
        Command::Register {
            connection,
            id,
            reply,
        } => {
            let _ = reply.send(register_worker(registry, inbound_tx, connection, id));
        }
        Command::SendMsg {
            content,
            worker,
            reply,
        } => {
            let _ = reply.send(registry.send_note(content, worker.as_ref()));
        }
        Command::SendRequest {
            content,
            worker,
            reply,
        } => {
            registry.send_request(content, worker.as_ref(), reply);
        }
        Command::Ping { worker, reply } => {
            registry.send_ping(&worker, reply);
        }
        Command::Workers { reply } => {
            let _ = reply.send(registry.ids());
        }
    }
}

fn register_worker(
    registry: &mut Registry,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    connection: WorkerConnection,
    id: Option<WorkerId>,
) -> Result<WorkerId> {
    let WorkerConnection {
        channel,
        pid,
        child,
    } = connection;

    let id = id.or_else(|| pid.map(WorkerId::from_pid)).ok_or_else(|| {
        IpcError::invalid_argument("worker has neither an id nor a process id")
    })?;
    if registry.contains(&id) {
        return Err(IpcError::invalid_argument(format!(
            "worker {} is already registered",
            id
        )));
    }

    tracing::info!(worker_id = %id, ?pid, "Initializing worker");

    let generation = registry.next_generation();
    let (reader, writer) = channel.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_worker(
        id.clone(),
        generation,
        writer,
        outbound_rx,
        inbound_tx.clone(),
    ));
    let reader_task = tokio::spawn(read_worker(
        id.clone(),
        generation,
        reader,
        inbound_tx.clone(),
    ));

    registry.insert(
        WorkerHandle::new(id.clone(), outbound_tx, Some(reader_task), child),
        generation,
    )?;
    Ok(id)
}

fn handle_inbound(registry: &mut Registry, listeners: &SharedListeners, inbound: Inbound) {
    let Inbound {
        worker,
        generation,
        event,
    } = inbound;

    if !registry.is_current(&worker, generation) {
        tracing::trace!(worker_id = %worker, "Ignoring event from stale worker registration");
        return;
    }

    match event {
        WorkerEvent::Frame(Ok(msg)) => {
            tracing::debug!(worker_id = %worker, kind = msg.kind(), "Received message from worker");
            if let Err(e) = route_message(registry, listeners, &worker, msg) {
                tracing::error!(worker_id = %worker, error = %e, "Exception while processing worker message");
            }
        }
        WorkerEvent::Frame(Err(e)) => {
            tracing::error!(worker_id = %worker, error = %e, "Exception while processing worker message");
        }
        WorkerEvent::Error(e) => {
            tracing::error!(worker_id = %worker, error = %e, "Worker channel error");
            registry.remove(&worker, generation);
            listeners.emit_error(&worker, &e);
        }
        WorkerEvent::Closed => {
            tracing::info!(worker_id = %worker, "Worker closed");
            registry.remove(&worker, generation);
            listeners.emit_close(&worker);
        }
    }
}

fn route_message(
    registry: &mut Registry,
    listeners: &SharedListeners,
    worker: &WorkerId,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Note { content } => {
            listeners.emit_message(worker, content);
            Ok(())
        }
        Message::Response {
            request_id,
            status,
            content,
        } => {
            if !registry.resolve_response(worker, request_id, status, content) {
                tracing::debug!(worker_id = %worker, %request_id, "Dropping response with no pending request");
            }
            Ok(())
        }
        Message::Pong => registry.resolve_pong(worker),
        other => Err(IpcError::protocol(format!(
            "unknown message type: {}",
            other.kind()
        ))),
    }
}

async fn read_worker(
    worker: WorkerId,
    generation: u64,
    mut reader: ChannelReader,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let (event, last) = match reader.next().await {
            Some(Ok(frame)) => (WorkerEvent::Frame(frame), false),
            Some(Err(e)) => (WorkerEvent::Error(e.into()), true),
            None => (WorkerEvent::Closed, true),
        };
        let inbound = Inbound {
            worker: worker.clone(),
            generation,
            event,
        };
        if tx.send(inbound).is_err() || last {
            break;
        }
    }
    tracing::debug!(worker_id = %worker, "Worker reader task exiting");
}

async fn write_worker(
    worker: WorkerId,
    generation: u64,
    mut writer: ChannelWriter,
    mut rx: mpsc::UnboundedReceiver<Message>,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(msg).await {
            let _ = tx.send(Inbound {
                worker: worker.clone(),
                generation,
                event: WorkerEvent::Error(e.into()),
            });
            break;
        }
    }
    tracing::trace!(worker_id = %worker, "Worker writer task exiting");
}
