//! Non-durable coordinator kept entirely in process memory.
//!
//! Implements both coordinator ports with the observable protocol of the
//! remote coordinator (readiness, router skips, map fan-out/fan-in, timers,
//! approvals, child executions) so workers can be run end to end without a
//! server. Nothing survives the process.

mod coordinator;
mod state;

#[cfg(test)]
mod scenarios;

pub use coordinator::InMemoryCoordinator;
pub use state::ReportRecord;
