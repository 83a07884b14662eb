#![doc = include_str!("../README.md")]

pub mod core;

/// Shared test specifications for coordination backend implementations.
///
/// These test functions ensure consistent election behavior across all
/// `Coordinator` implementations (PostgreSQL, MySQL, etc.). Backend tests
/// should call these functions with their coordinator instance.
#[doc(hidden)]
pub mod coordination_spec;

/// Execution-side services: the per-firing gate and the heartbeat publisher.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod gate;
    pub mod heartbeat;
}

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use super::core::{
        config::{DatabaseConfig, Dialect},
        coordinator::{CoordinationError, Coordinator, ElectionResult},
        job::{Job, JobError},
        retry::{BackoffStrategy, ErrorPolicy, RetryPolicy},
        CancellationToken,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        gate::{ExecutionGate, FiringOutcome, GateOptions, ScheduledJob},
        heartbeat::{HeartbeatOptions, HeartbeatPublisher},
    };
    pub use serde::{Deserialize, Serialize};
}
