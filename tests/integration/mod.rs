//! Integration test suite for foreman.
//!
//! These tests drive whole batches through the coordinator and check the
//! scheduling, isolation, recovery and integration guarantees end to end.
//!
//! # Test Categories
//!
//! - `scheduling`: concurrency bounds, resource exclusion, ordering
//! - `failures`: verification failures, retries, blocked descendants
//! - `recovery`: checkpoint resume, cancellation, workspace hygiene
//! - `health_gating`: admission deferred by open circuit breakers
//! - `git_e2e`: real repositories through `GitHost` and the command driver
//! - `cli`: the `foreman` binary against a real repository
//!
//! # CI Compatibility
//!
//! Everything except `git_e2e` and `cli` runs against a fake host and
//! driver. Those two need the `git` and `sh` binaries.

mod fixtures;

mod failures;
mod git_e2e;
mod health_gating;
mod recovery;
