//! Per-task phase lifecycle.
//!
//! Every task moves through the same fixed phase sequence. The
//! `PhaseStateMachine` only advances once the driver's verification predicate
//! confirms the previous phase, and persists a checkpoint after each verified
//! transition.

mod machine;
mod types;

pub use machine::{MachineOutcome, PhaseStateMachine, ResumePoint};
pub use types::{MachineState, Phase, PhaseRecord, PhaseStatus};
