//! External collaborators: the version-control host that backs isolation and
//! integration, and the issue tracker that receives progress updates.

mod tracker;
mod vcs;

pub use tracker::{IssueTracker, NullTracker, ProgressReporter, TrackerItem};
pub use vcs::{GitHost, MergeOutcome, VersionControlHost};
