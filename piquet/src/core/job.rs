//! The job-body interface invoked by the execution gate.

use async_trait::async_trait;
use std::convert::Infallible;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A user-supplied job body.
///
/// The trigger engine decides *when* a firing happens; the execution gate
/// decides *whether* this instance may run it. Once authorized, the gate calls
/// `execute`, applying the job's retry/backoff and error policy around it.
///
/// ## Example
/// ```rust
/// use piquet::prelude::{Job, CancellationToken};
///
/// struct ReportJob;
///
/// #[async_trait::async_trait]
/// impl Job for ReportJob {
///     type Error = anyhow::Error;
///
///     async fn execute(&self, cancellation_token: CancellationToken) -> Result<(), Self::Error> {
///         tokio::select! {
///             result = async { /* ..do the work */ Ok(()) } => result,
///             _ = cancellation_token.cancelled() => Ok(()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync {
    /// The error type reported by this job body.
    ///
    /// Should implement `Into<JobError>` for proper error handling.
    type Error: Send + Into<JobError>;

    /// Run the job body once.
    ///
    /// Should listen for `cancellation_token.cancelled()` so a terminating
    /// error policy or a shutdown can stop long-running work.
    async fn execute(&self, cancellation_token: CancellationToken) -> Result<(), Self::Error>;
}

/// A job body failure.
///
/// Handled entirely by the retry/backoff and error-policy machinery; it never
/// affects election state.
#[derive(Error, Debug)]
pub enum JobError {
    /// Error from the job body implementation.
    #[error("Job handler error: {0}")]
    HandlerError(#[source] anyhow::Error),
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        JobError::HandlerError(error)
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}
