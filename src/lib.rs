//! recast: a small concurrent text transformation server
//!
//! Each connection carries one request. The server reads it, runs it
//! through a [`Transformer`](transform::Transformer) and writes one
//! response back before closing the connection.
//!
//! Features:
//! - Length-prefixed or line-terminated framing
//! - Built-in transformers, chainable into pipelines, or a custom one
//! - Bounded concurrency with wait or reject admission
//! - Read/write timeouts and graceful shutdown
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod transform;

pub use config::{AdmissionPolicy, Config};
pub use server::{serve, Server};
pub use shutdown::{Shutdown, ShutdownListener};
