//! IPC bridge for master-worker communication.
//!
//! This module provides the wire protocol, codec and channel shared by the
//! master (parent) and the worker subprocesses.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Ping/Pong, Note, Request/Response)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: Framed duplex endpoint (stdio, child pipes, in-process pair)

pub mod channel;
pub mod codec;
pub mod protocol;
