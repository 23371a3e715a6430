//! Engine module - process supervision
//!
//! This module owns everything between "run this argv in that directory" and the
//! raw outcome:
//! - Spawning the child in its own process group
//! - Wall-clock deadline race and process-group kill
//! - Best-effort rlimits applied before exec
//! - Bounded stdout/stderr capture
//!
//! The engine module does NOT:
//! - Know about languages or snippet files
//! - Touch session storage

pub mod limits;
pub mod output;
pub mod supervisor;

pub use limits::ResourceLimits;
pub use output::CapturedOutput;
pub use supervisor::{
    ExecutionOutcome, ExecutionSpec, ExecutionStatus, ProcessSupervisor, TIMEOUT_EXIT_CODE,
};
