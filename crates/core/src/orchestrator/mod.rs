//! Per-image orchestration.
//!
//! The orchestrator runs the two independent producers concurrently:
//! - **Calibration**: async, IO-bound (remote plate solver)
//! - **Detection**: blocking, CPU-bound (runs on the blocking pool)
//!
//! Both branches are joined before reconciliation starts. A failing branch
//! never aborts the other one; it is reported as a [`BranchStatus`] in the
//! [`RunReport`].

mod runner;
mod types;

pub use runner::ParallelOrchestrator;
pub use types::{BranchResult, BranchStatus, OrchestratorError, RunOutcome, RunReport};
