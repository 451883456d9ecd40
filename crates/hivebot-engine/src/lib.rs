//! Hivebot engine — the orchestration core.
//!
//! Four tightly coupled subsystems around the file queue:
//!
//! - [`dispatcher`] — polling queue dispatcher with per-key FIFO chains,
//!   crash recovery, and dead-letter quarantine;
//! - [`routing`] — `@mention` parsing and target resolution;
//! - [`team`] — team chains with sequential handoff and parallel fan-out;
//! - [`swarm`] — the map / shuffle / reduce pipeline over a bounded pool.

pub mod dispatcher;
pub mod queue;
pub mod routing;
pub mod swarm;
pub mod team;

pub use dispatcher::Dispatcher;
pub use queue::{QueueError, QueueStore};
pub use routing::Route;
pub use swarm::{SwarmEngine, SwarmError, SwarmOutcome};
pub use team::TeamChainExecutor;
