//! Core domain models for batch coordination.
//!
//! Task descriptors, the dependency graph built over them, and the analyzer
//! that derives conflict ordering from resource footprints.

pub mod analyzer;
pub mod dag;
pub mod task;

pub use analyzer::{Analysis, ConflictComponent, DependencyAnalyzer};
pub use dag::{DependencyGraph, DependencyType};
pub use task::{Batch, TaskDescriptor, TaskId, TaskPayload, TaskStatus};
