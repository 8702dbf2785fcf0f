//! Core engine for Ember out-of-process script invocation.
//!
//! This crate provides:
//! - Worker process lifecycle with NUL-framed output
//! - Startup handshake and loopback HTTP transport
//! - Invocation orchestration with retries and worker replacement
//! - File watching that swaps workers on change
//! - Round-robin pools of workers

pub mod config;
pub mod error;
pub mod handshake;
pub mod invoke;
pub mod pool;
pub mod process;
pub mod request;
pub mod transport;
pub mod watch;

pub use config::{Concurrency, EmberConfig, InvocationOptions, ProcessOptions, WatchOptions};
pub use error::{Error, Result};
pub use invoke::Orchestrator;
pub use pool::Pool;
pub use process::{ProcessFactory, ProcessState, WorkerProcess};
pub use request::{InvocationRequest, ModuleSource, RequestStream, SourceKind};
pub use transport::{
    HttpTransport, ResponseBody, Transport, TransportError, TransportRequest, TransportResponse,
};
pub use watch::FileWatcher;

pub use tokio_util::sync::CancellationToken;
