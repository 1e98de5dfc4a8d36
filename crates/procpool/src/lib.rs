//! procpool: master/worker process pool over framed JSON channels.
//!
//! The master registers worker channels, sends fire-and-forget notes and
//! correlated requests, and routes each response back to the caller that is
//! waiting for it. Workers answer requests through a pluggable handler.

pub mod bridge;
pub mod config;
pub mod demo;
pub mod error;
pub mod master;
pub mod spawn;
pub mod transport;
pub mod worker;

pub use bridge::channel::Channel;
pub use bridge::protocol::{Message, RequestId, ResponseStatus, WorkerId};
pub use config::{ConfigError, DemoConfig};
pub use error::{IpcError, Result};
pub use master::{
    EventKind, Listener, Master, MasterConfig, WorkerConnection, DEFAULT_REQUEST_TIMEOUT,
};
pub use spawn::{CommandSpawner, SpawnError, WorkerSpawner, spawn_workers};
pub use worker::{HandlerKind, MessageHandler, Notifier, RequestHandler, Worker};
