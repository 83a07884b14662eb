//! Per-firing coordination gate.
//!
//! The trigger engine calls [`ExecutionGate::fire`] on every scheduled firing.
//! The gate decides whether this instance is authorized to run the job body:
//! the current leader re-validates with a cheap read-only `verify`, a standby
//! attempts a full `acquire`. Once authorized, the gate owns the retry/backoff
//! loop around the body and routes a still-failing result to the configured
//! error policy.
//!
//! If the coordination store is unreachable the firing is skipped - never
//! executed - because uniqueness cannot be proven. This is a deliberate
//! dead-man's switch.

use crate::core::coordinator::{CoordinationError, Coordinator};
use crate::core::job::{Job, JobError};
use crate::core::retry::{ErrorPolicy, RetryPolicy};
use crate::runner::heartbeat::{HeartbeatOptions, HeartbeatPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Coordination settings for one group member.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GateOptions {
    /// Identity of this instance, unique across the whole token table.
    pub task_id: String,

    /// The logical job group this gate elects within.
    pub group_id: String,

    /// Maximum tolerated heartbeat age before the holder is presumed dead
    /// (default: 30 seconds).
    pub liveness_interval: Duration,

    /// Heartbeat publisher cadence while this instance leads
    /// (default: 1 second).
    pub heartbeat_period: Duration,
}

impl GateOptions {
    pub fn new(task_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            group_id: group_id.into(),
            liveness_interval: Duration::from_secs(30),
            heartbeat_period: Duration::from_secs(1),
        }
    }

    pub fn with_liveness_interval(mut self, liveness_interval: Duration) -> Self {
        self.liveness_interval = liveness_interval;
        self
    }

    pub fn with_heartbeat_period(mut self, heartbeat_period: Duration) -> Self {
        self.heartbeat_period = heartbeat_period;
        self
    }
}

/// A job body plus its per-firing execution settings.
pub struct ScheduledJob<J> {
    pub job: J,

    /// Interval between scheduled firings. Retries never bleed past the next
    /// firing, and a retry policy whose base delay exceeds this interval is
    /// inert.
    pub firing_interval: Duration,

    pub error_policy: ErrorPolicy,
    pub retry: Option<RetryPolicy>,

    /// Cancelled by a terminating error policy so the trigger engine drops the
    /// job's future firings.
    pub cancellation: CancellationToken,
}

impl<J: Job> ScheduledJob<J> {
    pub fn new(job: J, firing_interval: Duration) -> Self {
        Self {
            job,
            firing_interval,
            error_policy: ErrorPolicy::default(),
            retry: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// What the gate decided (and did) for one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiringOutcome {
    /// The job body ran. A failure of the body itself, if any, was consumed by
    /// a non-terminating error policy.
    Executed,

    /// The job body ran, still failed after every configured attempt, and the
    /// terminating policy cancelled the job's future firings.
    Terminated,

    /// Another instance holds the group token; nothing ran.
    SkippedStandby,

    /// `verify` reported leadership lost since the last firing; nothing ran.
    /// Prevents a double execution against a newer leader.
    SkippedLostLeadership,

    /// The coordination store was unreachable (or the call timed out), so the
    /// firing was skipped rather than executed unsafely.
    SkippedCoordinationFailure,
}

enum GateState {
    Standby,
    Leader {
        term: i64,
        heartbeat: HeartbeatPublisher,
    },
}

/// Decides, per firing, whether the local instance runs the job body.
///
/// One gate serves one `(task_id, group_id)` pair; the remembered leadership
/// state carries between firings so the leader path stays a single read-only
/// query. Only the current leader publishes heartbeats: the gate starts the
/// publisher when it wins an election and stops it when `verify` reports the
/// lease lost.
pub struct ExecutionGate<C> {
    coordinator: Arc<C>,
    options: GateOptions,
    state: Mutex<GateState>,
}

impl<C> ExecutionGate<C>
where
    C: Coordinator + 'static,
{
    pub fn new(coordinator: Arc<C>, options: GateOptions) -> Self {
        info!(
            task_id = %options.task_id,
            group_id = %options.group_id,
            liveness_interval = ?options.liveness_interval,
            "Initializing execution gate"
        );
        Self {
            coordinator,
            options,
            state: Mutex::new(GateState::Standby),
        }
    }

    /// Whether this instance currently believes it leads the group.
    pub async fn is_leader(&self) -> bool {
        matches!(&*self.state.lock().await, GateState::Leader { .. })
    }

    /// The fencing term this instance leads under, if any.
    pub async fn current_term(&self) -> Option<i64> {
        match &*self.state.lock().await {
            GateState::Leader { term, .. } => Some(*term),
            GateState::Standby => None,
        }
    }

    /// Gate one scheduled firing.
    ///
    /// Returns `Err` only for [`CoordinationError::DuplicateIdentity`] and
    /// [`CoordinationError::GroupMismatch`], which are fatal to the
    /// acquisition and surfaced immediately. Every other coordination failure
    /// is reported through the log and folded into
    /// [`FiringOutcome::SkippedCoordinationFailure`].
    #[instrument(
        skip_all,
        fields(task_id = %self.options.task_id, group_id = %self.options.group_id)
    )]
    pub async fn fire<J: Job>(
        &self,
        entry: &ScheduledJob<J>,
    ) -> Result<FiringOutcome, CoordinationError> {
        let mut state = self.state.lock().await;

        let authorized = if matches!(&*state, GateState::Leader { .. }) {
            match self
                .coordinator
                .verify(&self.options.task_id, &self.options.group_id)
                .await
            {
                Ok(true) => true,
                Ok(false) => {
                    warn!("Leadership lost since the last firing, demoting to standby");
                    self.demote(&mut state).await;
                    return Ok(FiringOutcome::SkippedLostLeadership);
                }
                Err(error) => {
                    // No leadership change is assumed; the next firing
                    // re-validates.
                    error!(error = %error, "Leadership re-validation failed, skipping this firing");
                    return Ok(FiringOutcome::SkippedCoordinationFailure);
                }
            }
        } else {
            match self
                .coordinator
                .acquire(
                    &self.options.task_id,
                    &self.options.group_id,
                    self.options.liveness_interval,
                )
                .await
            {
                Ok(result) if result.is_leader => {
                    info!(term = result.term, "Acquired group leadership");
                    let heartbeat = HeartbeatPublisher::start(
                        self.coordinator.clone(),
                        self.options.task_id.clone(),
                        self.options.group_id.clone(),
                        HeartbeatOptions {
                            period: self.options.heartbeat_period,
                            ..HeartbeatOptions::default()
                        },
                    );
                    *state = GateState::Leader {
                        term: result.term,
                        heartbeat,
                    };
                    true
                }
                Ok(result) => {
                    debug!(
                        term = result.term,
                        "Another instance holds the token, staying standby"
                    );
                    return Ok(FiringOutcome::SkippedStandby);
                }
                Err(
                    error @ (CoordinationError::DuplicateIdentity { .. }
                    | CoordinationError::GroupMismatch { .. }),
                ) => {
                    return Err(error);
                }
                Err(error) => {
                    error!(error = %error, "Token acquisition failed, skipping this firing");
                    return Ok(FiringOutcome::SkippedCoordinationFailure);
                }
            }
        };

        // The coordination check is done; release the state lock so a slow job
        // body never blocks is_leader/shutdown.
        drop(state);
        debug_assert!(authorized);
        Ok(execute_with_policy(entry).await)
    }

    /// Stop heartbeating and forget any held leadership. The token itself is
    /// not released; a peer takes over once the heartbeat goes stale.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.demote(&mut state).await;
    }

    async fn demote(&self, state: &mut GateState) {
        if let GateState::Leader { heartbeat, .. } = std::mem::replace(state, GateState::Standby) {
            heartbeat.stop().await;
        }
    }
}

/// Run a job that carries no coordination configuration: the body executes on
/// every firing, with the same retry/backoff and error-policy handling the
/// gate applies.
pub async fn run_uncoordinated<J: Job>(entry: &ScheduledJob<J>) -> FiringOutcome {
    execute_with_policy(entry).await
}

async fn execute_with_policy<J: Job>(entry: &ScheduledJob<J>) -> FiringOutcome {
    let mut result: Result<(), JobError> = entry
        .job
        .execute(entry.cancellation.child_token())
        .await
        .map_err(Into::into);

    if result.is_err() {
        if let Some(retry) = &entry.retry {
            for delay in retry.delays(entry.firing_interval) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = entry.cancellation.cancelled() => break,
                }
                result = entry
                    .job
                    .execute(entry.cancellation.child_token())
                    .await
                    .map_err(Into::into);
                if result.is_ok() {
                    break;
                }
            }
        }
    }

    match result {
        Ok(()) => FiringOutcome::Executed,
        Err(error) => {
            if entry.error_policy.is_logged() {
                error!(
                    error = %error,
                    policy = ?entry.error_policy,
                    "Job still failing after all configured attempts"
                );
            }
            if entry.error_policy.is_terminating() {
                warn!("Terminating error policy in effect, cancelling future firings");
                entry.cancellation.cancel();
                FiringOutcome::Terminated
            } else {
                FiringOutcome::Executed
            }
        }
    }
}
