//! Worker process management.
//!
//! - `factory` - spawn configuration and process creation
//! - `framing` - NUL-terminated message framing over stdout/stderr
//! - `worker` - `WorkerProcess` lifecycle wrapper

mod factory;
mod framing;
mod worker;

pub use factory::{
    DEFAULT_BOOTSTRAP, DEFAULT_EXECUTABLE, HOSTING_ENV_VAR, ProcessFactory, RUNTIME_ENV_VAR,
    SpawnSpec, escape_inline_script,
};
pub use framing::{MESSAGE_TERMINATOR, MessageFramer};
pub use worker::{ProcessState, StatusCell, WorkerEvents, WorkerProcess};
