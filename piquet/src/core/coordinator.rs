//! The election coordinator abstraction.
//!
//! A `Coordinator` implements the claim/verify/fence protocol against the two
//! coordination tables (`token_holder`, `health_check`). Each operation runs as
//! one atomically committed database transaction on its own short-lived
//! connection; no lock or connection is held between calls. All required mutual
//! exclusion is pushed into that transaction plus the active-holder uniqueness
//! constraint per group.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single token acquisition attempt.
///
/// Carries enough state for the caller to feed later coordination checks
/// without re-deriving it: whether this instance now leads the group, and the
/// fencing term under which it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionResult {
    /// True when this instance holds the group token after the attempt.
    pub is_leader: bool,

    /// The group's fencing term as observed by the attempt. Strictly
    /// increasing per group; `0` when the group had no committed term at read
    /// time and the attempt did not create one.
    pub term: i64,

    /// The task identity the attempt ran under.
    pub task_id: String,

    /// The group the attempt ran against.
    pub group_id: String,
}

/// Database-backed leader election for job groups.
///
/// Implementations determine, per logical job group, which instance in a fleet
/// is the active executor. The term attached to every claim is a fencing
/// token: any party comparing claims must compare by maximum term, never by
/// the presence of an active flag alone, so a resurrected stale leader can
/// never be confused with the current one.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Attempt to claim (or re-confirm) leadership of `group_id` for
    /// `task_id`.
    ///
    /// Runs as one transaction: reads the highest-term holder, compares its
    /// last heartbeat against the database server's clock, and takes over with
    /// a bumped term only when the holder's heartbeat is missing or older than
    /// `liveness_interval`. A live holder leaves the table untouched and the
    /// result reports standby.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::DuplicateIdentity`] when `task_id` is already
    ///   registered by a different live instance anywhere in the token table.
    /// - [`CoordinationError::GroupMismatch`] when `task_id` is already bound
    ///   to a different group; a task id elects within one group for its
    ///   whole lifetime.
    /// - [`CoordinationError::Timeout`] / [`CoordinationError::DatabaseError`]
    ///   roll the whole transaction back; no partial state is ever committed.
    async fn acquire(
        &self,
        task_id: &str,
        group_id: &str,
        liveness_interval: Duration,
    ) -> Result<ElectionResult, CoordinationError>;

    /// Cheap read-only re-validation for the current holder: true iff
    /// `task_id`'s row for `group_id` is currently marked active.
    ///
    /// The existing leader calls this on every firing instead of repeating the
    /// full acquire dance.
    async fn verify(&self, task_id: &str, group_id: &str) -> Result<bool, CoordinationError>;

    /// Upsert this instance's liveness timestamp for `group_id`, using the
    /// database server's clock. Last write wins; ordering between ticks is
    /// irrelevant since only the latest value matters.
    async fn publish_heartbeat(
        &self,
        task_id: &str,
        group_id: &str,
    ) -> Result<(), CoordinationError>;
}

/// Errors surfaced by coordination operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoordinationError {
    /// The task id collides with a different, still-live registration. Fatal
    /// to the single acquisition call; never retried automatically.
    #[error("Task id '{task_id}' is already registered by another live instance")]
    DuplicateIdentity { task_id: String },

    /// The task id is already bound to a different group. Token rows never
    /// relocate between groups: moving one would erase the source group's
    /// term history and let a later claim there restart at term 1.
    #[error("Task id '{task_id}' is already bound to group '{registered_group_id}'")]
    GroupMismatch {
        task_id: String,
        registered_group_id: String,
    },

    /// A coordination database call exceeded its bound. Treated exactly like
    /// any other coordination failure: the firing is skipped, never executed
    /// on a claim that cannot be proven.
    #[error("Coordination database call exceeded the {0:?} timeout")]
    Timeout(Duration),

    /// Connection or SQL failure. The triggering transaction was rolled back;
    /// the operation counts as "no leadership change / heartbeat dropped this
    /// cycle".
    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_identity_message_names_the_task() {
        let error = CoordinationError::DuplicateIdentity {
            task_id: "worker-7".to_string(),
        };
        assert!(error.to_string().contains("worker-7"));
    }

    #[test]
    fn test_group_mismatch_message_names_both_sides() {
        let error = CoordinationError::GroupMismatch {
            task_id: "worker-7".to_string(),
            registered_group_id: "invoices".to_string(),
        };
        assert!(error.to_string().contains("worker-7"));
        assert!(error.to_string().contains("invoices"));
    }

    #[test]
    fn test_database_error_preserves_source() {
        use std::error::Error;

        let error = CoordinationError::DatabaseError(anyhow::anyhow!("connection refused"));
        assert!(error.source().is_some());
        assert!(error.to_string().contains("connection refused"));
    }

    #[test]
    fn test_timeout_message_includes_bound() {
        let error = CoordinationError::Timeout(Duration::from_secs(5));
        assert!(error.to_string().contains("5s"));
    }
}
