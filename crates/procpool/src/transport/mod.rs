//! Transport layer for procpool.
//!
//! HTTP front end via axum, driving a [`Master`](crate::master::Master).

pub mod http;

pub use http::{ServerConfig, serve, serve_with_shutdown};
