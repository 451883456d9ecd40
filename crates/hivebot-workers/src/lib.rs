//! Hivebot workers — the subprocess seam of the orchestrator.
//!
//! Provides the [`invoker::WorkerInvoker`] trait and its CLI implementation,
//! the per-agent [`memory`] context composer, and [`reset`] flag handling.

pub mod invoker;
pub mod memory;
pub mod reset;

pub use invoker::{CliWorkerInvoker, WorkerError, WorkerInvoker};
pub use reset::ResetFlags;
