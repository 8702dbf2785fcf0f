//! Invocation orchestration.
//!
//! ```text
//! Orchestrator::invoke
//!     │
//!     ├── acquire ── single-flight gate ── ProcessFactory::spawn + handshake
//!     │
//!     ├── attempt ── Transport::send (timeout, cancellation, in-flight tracking)
//!     │
//!     └── RetryBudget ── same-process retry │ process retry │ surface
//! ```

mod orchestrator;
mod retry;

pub use orchestrator::Orchestrator;
