use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use piquet::core::config::DatabaseConfig;
use piquet::core::coordinator::{CoordinationError, Coordinator, ElectionResult};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlConnection, MySqlPool};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// An implementation of the Coordinator backed by MySQL.
///
/// Each instance carries its own registration nonce: re-acquires from the same
/// instance are idempotent, while a different process presenting the same task
/// id trips the duplicate-identity check as long as the registration is live.
#[derive(Clone)]
pub struct MySqlCoordinator {
    pool: MySqlPool,
    registration: String,
    op_timeout: Duration,
}

#[derive(sqlx::FromRow)]
struct TokenRow {
    task_id: String,
    term: i64,
    is_active: bool,
    registration_id: String,
}

impl MySqlCoordinator {
    pub fn with_pool(pool: MySqlPool) -> Self {
        Self {
            pool,
            registration: Uuid::new_v4().to_string(),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Connect using a [`DatabaseConfig`] descriptor.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, CoordinationError> {
        let pool = MySqlPoolOptions::new()
            .acquire_timeout(DEFAULT_OP_TIMEOUT)
            .connect(&config.connection_url())
            .await
            .context("Failed to connect to the coordination database")?;
        Ok(Self::with_pool(pool))
    }

    /// Override the per-operation timeout (default: 5 seconds).
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Every coordination call is bounded; an overrun is reported as
    /// `Timeout` and treated by callers exactly like any other coordination
    /// failure.
    async fn bounded<T, F>(&self, operation: F) -> Result<T, CoordinationError>
    where
        F: Future<Output = Result<T, CoordinationError>>,
    {
        match tokio::time::timeout(self.op_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout(self.op_timeout)),
        }
    }

    fn result(&self, is_leader: bool, term: i64, task_id: &str, group_id: &str) -> ElectionResult {
        ElectionResult {
            is_leader,
            term,
            task_id: task_id.to_string(),
            group_id: group_id.to_string(),
        }
    }

    async fn acquire_inner(
        &self,
        task_id: &str,
        group_id: &str,
        liveness_interval: Duration,
    ) -> Result<ElectionResult, CoordinationError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open a coordination transaction")?;

        self.check_identity(&mut tx, task_id, group_id, liveness_interval)
            .await?;

        // Ties at the maximum term resolve toward the active row. FOR UPDATE
        // serializes contenders on the holder row.
        let holder: Option<TokenRow> = sqlx::query_as(
            "SELECT task_id, term, is_active, registration_id FROM token_holder \
             WHERE group_id = ? ORDER BY term DESC, is_active DESC LIMIT 1 FOR UPDATE",
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to read the current token holder")?;

        let result = match holder {
            None => {
                if !self.replace_token(&mut tx, task_id, group_id, 1).await? {
                    tx.rollback()
                        .await
                        .context("Failed to roll back a lost claim")?;
                    return Ok(self.result(false, 0, task_id, group_id));
                }
                self.result(true, 1, task_id, group_id)
            }
            Some(row) if row.task_id == task_id => {
                // Restart/idempotent path. A stale registration under our own
                // task id was cleared by check_identity, so adopt the row.
                if row.registration_id != self.registration {
                    sqlx::query("UPDATE token_holder SET registration_id = ? WHERE task_id = ?")
                        .bind(&self.registration)
                        .bind(task_id)
                        .execute(&mut *tx)
                        .await
                        .context("Failed to refresh the task registration")?;
                }
                self.result(row.is_active, row.term, task_id, group_id)
            }
            Some(row) => {
                self.contest(&mut tx, task_id, group_id, liveness_interval, row)
                    .await?
            }
        };

        tx.commit()
            .await
            .context("Failed to commit the coordination transaction")?;
        Ok(result)
    }

    /// Contested claim: take over only when the holder's heartbeat is missing
    /// or older than the liveness interval, judged by the database server's
    /// clock.
    async fn contest(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        task_id: &str,
        group_id: &str,
        liveness_interval: Duration,
        holder: TokenRow,
    ) -> Result<ElectionResult, CoordinationError> {
        let last_heartbeat = self
            .latest_heartbeat(&mut *tx, &holder.task_id, group_id)
            .await?;
        let holder_dead = match last_heartbeat {
            None => true,
            Some(beat) => {
                let server_time = server_time(&mut *tx).await?;
                (server_time - beat).num_seconds() > liveness_interval.as_secs() as i64
            }
        };

        if !holder_dead {
            debug!(holder = %holder.task_id, "Holder heartbeat is fresh, staying standby");
            return Ok(self.result(false, holder.term, task_id, group_id));
        }

        let max_term: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(term), 0) FROM token_holder WHERE group_id = ?")
                .bind(group_id)
                .fetch_one(&mut **tx)
                .await
                .context("Failed to read the group's maximum term")?;
        let next_term = max_term + 1;

        // Compare-and-swap on the observed maximum term: the affected-row
        // count decides the race between contenders.
        let fenced = sqlx::query(
            "UPDATE token_holder SET is_active = FALSE, term = ? \
             WHERE group_id = ? AND term = ?",
        )
        .bind(next_term)
        .bind(group_id)
        .bind(max_term)
        .execute(&mut **tx)
        .await
        .context("Failed to fence the stale holder")?;
        if fenced.rows_affected() == 0 {
            warn!(group_id, "Another contender fenced the holder first, staying standby");
            return Ok(self.result(false, holder.term, task_id, group_id));
        }

        // Invalidate every remaining row in the group except our own.
        sqlx::query(
            "UPDATE token_holder SET is_active = FALSE, term = ? \
             WHERE group_id = ? AND task_id <> ? AND term < ?",
        )
        .bind(next_term)
        .bind(group_id)
        .bind(task_id)
        .bind(next_term)
        .execute(&mut **tx)
        .await
        .context("Failed to invalidate standby rows")?;

        if !self.replace_token(tx, task_id, group_id, next_term).await? {
            // Unreachable once the fence succeeded, but a lost insert must
            // still roll the invalidation back with it.
            return Err(CoordinationError::DatabaseError(anyhow::anyhow!(
                "claim insert lost a race after a successful fence"
            )));
        }
        Ok(self.result(true, next_term, task_id, group_id))
    }

    /// Claim (or re-claim) the caller's own row as the active holder.
    ///
    /// MySQL's `ON DUPLICATE KEY UPDATE` fires on any unique index, including
    /// the one-active-per-group key, and would update a rival's row. Deleting
    /// our own row first (check_identity guarantees it can only be our row in
    /// this group) makes the plain insert conflict only on that key, so
    /// a violation always means a concurrent contender committed first. The
    /// surrounding transaction is unusable after that and must be rolled back.
    async fn replace_token(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        task_id: &str,
        group_id: &str,
        term: i64,
    ) -> Result<bool, CoordinationError> {
        let cleared = sqlx::query("DELETE FROM token_holder WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut **tx)
            .await;
        if let Err(error) = cleared {
            if is_lost_race(&error) {
                return Ok(false);
            }
            return Err(CoordinationError::DatabaseError(
                anyhow::Error::new(error).context("Failed to clear the previous token row"),
            ));
        }

        let insert = sqlx::query(
            "INSERT INTO token_holder (task_id, group_id, term, is_active, registration_id) \
             VALUES (?, ?, ?, TRUE, ?)",
        )
        .bind(task_id)
        .bind(group_id)
        .bind(term)
        .bind(&self.registration)
        .execute(&mut **tx)
        .await;

        match insert {
            Ok(_) => Ok(true),
            Err(error) if is_lost_race(&error) => Ok(false),
            Err(error) => Err(CoordinationError::DatabaseError(
                anyhow::Error::new(error).context("Failed to insert the token holder"),
            )),
        }
    }

    /// Fail when the task id is already registered by a different, still-live
    /// instance anywhere in the token table, or when it is bound to a group
    /// other than the one being claimed. Token rows never relocate between
    /// groups; a move would erase the source group's term history.
    async fn check_identity(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        task_id: &str,
        group_id: &str,
        liveness_interval: Duration,
    ) -> Result<(), CoordinationError> {
        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT registration_id, group_id FROM token_holder WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to check the task registration")?;

        let Some((registration_id, owner_group)) = existing else {
            return Ok(());
        };

        if registration_id != self.registration {
            let live = match self
                .latest_heartbeat(&mut *tx, task_id, &owner_group)
                .await?
            {
                None => false,
                Some(beat) => {
                    let server_time = server_time(&mut *tx).await?;
                    (server_time - beat).num_seconds() <= liveness_interval.as_secs() as i64
                }
            };
            if live {
                return Err(CoordinationError::DuplicateIdentity {
                    task_id: task_id.to_string(),
                });
            }
        }

        if owner_group != group_id {
            return Err(CoordinationError::GroupMismatch {
                task_id: task_id.to_string(),
                registered_group_id: owner_group,
            });
        }
        Ok(())
    }

    async fn latest_heartbeat(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
        task_id: &str,
        group_id: &str,
    ) -> Result<Option<NaiveDateTime>, CoordinationError> {
        let beat = sqlx::query_scalar(
            "SELECT last_heartbeat FROM health_check WHERE task_id = ? AND group_id = ? \
             ORDER BY last_heartbeat DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(group_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to read the holder heartbeat")?;
        Ok(beat)
    }
}

/// The database server's clock, not the caller's, to avoid cross-host skew.
/// `UTC_TIMESTAMP(6)` keeps heartbeat comparisons in one timezone regardless
/// of the session setting.
async fn server_time(conn: &mut MySqlConnection) -> Result<NaiveDateTime, CoordinationError> {
    let now = sqlx::query_scalar("SELECT UTC_TIMESTAMP(6)")
        .fetch_one(conn)
        .await
        .context("Failed to read the database server time")?;
    Ok(now)
}

/// A lost claim shows up either as a duplicate on the one-active-per-group
/// key or, under InnoDB gap locking, as the victim of a deadlock (SQLSTATE
/// 40001). Both mean another contender committed first.
fn is_lost_race(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.kind() == sqlx::error::ErrorKind::UniqueViolation
                || db.code().as_deref() == Some("40001")
        }
        _ => false,
    }
}

#[async_trait]
impl Coordinator for MySqlCoordinator {
    #[instrument(skip(self, liveness_interval), err)]
    async fn acquire(
        &self,
        task_id: &str,
        group_id: &str,
        liveness_interval: Duration,
    ) -> Result<ElectionResult, CoordinationError> {
        self.bounded(self.acquire_inner(task_id, group_id, liveness_interval))
            .await
    }

    #[instrument(skip(self), err)]
    async fn verify(&self, task_id: &str, group_id: &str) -> Result<bool, CoordinationError> {
        self.bounded(async {
            let active: Option<bool> = sqlx::query_scalar(
                "SELECT is_active FROM token_holder WHERE task_id = ? AND group_id = ?",
            )
            .bind(task_id)
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read the token holder status")?;
            Ok(active.unwrap_or(false))
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn publish_heartbeat(
        &self,
        task_id: &str,
        group_id: &str,
    ) -> Result<(), CoordinationError> {
        self.bounded(async {
            sqlx::query(
                "INSERT INTO health_check (task_id, group_id, last_heartbeat) \
                 VALUES (?, ?, UTC_TIMESTAMP(6)) \
                 ON DUPLICATE KEY UPDATE last_heartbeat = UTC_TIMESTAMP(6)",
            )
            .bind(task_id)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .context("Failed to upsert the heartbeat")?;
            Ok(())
        })
        .await
    }
}
