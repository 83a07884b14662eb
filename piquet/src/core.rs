//! Implementation agnostic traits for coordination backends and re-exports of
//! 3rd party types used in the public interface.

pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

pub mod config;
pub mod coordinator;
pub mod job;
pub mod retry;
