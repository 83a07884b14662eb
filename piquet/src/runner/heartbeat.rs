//! Periodic liveness-timestamp writer for the current group leader.
//!
//! The publisher runs as an independent tokio task with no application-level
//! mutual exclusion against the execution gate. Each tick is a short-lived
//! upsert of `health_check.last_heartbeat`; a failed tick is dropped silently
//! (logged at warn) and the next tick retries unconditionally. Only the latest
//! timestamp matters, so last-write-wins between ticks is correct.

use crate::core::coordinator::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Options for the heartbeat publisher.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HeartbeatOptions {
    /// Delay between liveness writes (default: 1 second).
    pub period: Duration,

    /// How long `stop` waits for an in-flight tick before force-cancelling
    /// (default: 5 seconds).
    pub shutdown_timeout: Duration,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a running heartbeat task.
///
/// Dropping the handle without calling [`stop`](Self::stop) cancels future
/// ticks but does not wait for an in-flight one.
pub struct HeartbeatPublisher {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl HeartbeatPublisher {
    /// Spawn the repeating liveness writer for `(task_id, group_id)`.
    ///
    /// The first tick fires immediately; subsequent ticks follow
    /// `options.period`.
    pub fn start<C>(
        coordinator: Arc<C>,
        task_id: impl Into<String>,
        group_id: impl Into<String>,
        options: HeartbeatOptions,
    ) -> Self
    where
        C: Coordinator + 'static,
    {
        let cancellation = CancellationToken::new();
        let token = cancellation.clone();
        let task_id = task_id.into();
        let group_id = group_id.into();
        let shutdown_timeout = options.shutdown_timeout;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(options.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(task_id, group_id, period = ?options.period, "Heartbeat publisher started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // A failed write must never crash the publisher; the
                        // next tick retries unconditionally.
                        if let Err(error) = coordinator.publish_heartbeat(&task_id, &group_id).await {
                            warn!(task_id, group_id, error = %error, "Heartbeat dropped this cycle");
                        }
                    }
                    _ = token.cancelled() => {
                        debug!(task_id, group_id, "Heartbeat publisher stopping");
                        break;
                    }
                }
            }
        });

        Self {
            cancellation,
            handle,
            shutdown_timeout,
        }
    }

    /// Cancel future ticks, wait a bounded grace period for an in-flight tick
    /// to finish, then force-cancel.
    pub async fn stop(mut self) {
        self.cancellation.cancel();
        if tokio::time::timeout(self.shutdown_timeout, &mut self.handle)
            .await
            .is_err()
        {
            warn!("Heartbeat task did not stop within the grace period, aborting");
            self.handle.abort();
        }
    }
}

impl Drop for HeartbeatPublisher {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::coordinator::{CoordinationError, ElectionResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct CountingCoordinator {
        beats: AtomicU32,
        fail: AtomicBool,
    }

    impl CountingCoordinator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                beats: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Coordinator for CountingCoordinator {
        async fn acquire(
            &self,
            task_id: &str,
            group_id: &str,
            _liveness_interval: Duration,
        ) -> Result<ElectionResult, CoordinationError> {
            Ok(ElectionResult {
                is_leader: false,
                term: 0,
                task_id: task_id.to_string(),
                group_id: group_id.to_string(),
            })
        }

        async fn verify(&self, _task_id: &str, _group_id: &str) -> Result<bool, CoordinationError> {
            Ok(false)
        }

        async fn publish_heartbeat(
            &self,
            _task_id: &str,
            _group_id: &str,
        ) -> Result<(), CoordinationError> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(CoordinationError::DatabaseError(anyhow::anyhow!(
                    "connection reset"
                )))
            } else {
                Ok(())
            }
        }
    }

    /// Starts a heartbeat write and never finishes it.
    struct StuckCoordinator {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Coordinator for StuckCoordinator {
        async fn acquire(
            &self,
            task_id: &str,
            group_id: &str,
            _liveness_interval: Duration,
        ) -> Result<ElectionResult, CoordinationError> {
            Ok(ElectionResult {
                is_leader: false,
                term: 0,
                task_id: task_id.to_string(),
                group_id: group_id.to_string(),
            })
        }

        async fn verify(&self, _task_id: &str, _group_id: &str) -> Result<bool, CoordinationError> {
            Ok(false)
        }

        async fn publish_heartbeat(
            &self,
            _task_id: &str,
            _group_id: &str,
        ) -> Result<(), CoordinationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_on_a_cadence() {
        let coordinator = CountingCoordinator::new();
        let publisher = HeartbeatPublisher::start(
            coordinator.clone(),
            "n1",
            "g1",
            HeartbeatOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let beats = coordinator.beats.load(Ordering::SeqCst);
        // Immediate first tick plus one per elapsed second.
        assert!(beats >= 3, "expected at least 3 beats, saw {beats}");

        publisher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_future_ticks() {
        let coordinator = CountingCoordinator::new();
        let publisher = HeartbeatPublisher::start(
            coordinator.clone(),
            "n1",
            "g1",
            HeartbeatOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        publisher.stop().await;
        let beats_at_stop = coordinator.beats.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(coordinator.beats.load(Ordering::SeqCst), beats_at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_a_tick_that_outlives_the_grace_period() {
        let coordinator = Arc::new(StuckCoordinator {
            calls: AtomicU32::new(0),
        });
        let publisher = HeartbeatPublisher::start(
            coordinator.clone(),
            "n1",
            "g1",
            HeartbeatOptions::default(),
        );

        // Let the first tick start and wedge inside the write.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 1);

        // stop must come back once the grace period elapses, via abort.
        publisher.stop().await;
        assert_eq!(coordinator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_the_publisher() {
        let coordinator = CountingCoordinator::new();
        coordinator.fail.store(true, Ordering::SeqCst);
        let publisher = HeartbeatPublisher::start(
            coordinator.clone(),
            "n1",
            "g1",
            HeartbeatOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        coordinator.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Ticks kept coming through and after the failure window.
        assert!(coordinator.beats.load(Ordering::SeqCst) >= 4);
        publisher.stop().await;
    }
}
