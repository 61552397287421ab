//! Batch orchestration: admission, health gating, retries and integration.
//!
//! The `Coordinator` drives a batch through a `WorkerPool`, consulting the
//! `HealthMonitor` before each admission and handing finished tasks to the
//! `ResultAggregator`.

mod aggregator;
mod coordinator;
mod health;
mod pool;
mod retry;

pub use aggregator::{IntegrationOutcome, ResultAggregator};
pub use coordinator::{Coordinator, WorkerEvent, WorkerOutcome, WorkerResult};
pub use health::{
    probe_from_spec, Admission, BreakerSnapshot, BreakerState, CircuitBreakerState,
    CommandProbe, FnProbe, HealthEvent, HealthMonitor, HealthProbe, PathProbe,
};
pub use pool::{RunningTask, WorkerPool};
pub use retry::{RetryPolicy, RetryTracker};
