//! Shared test specifications for `Coordinator` implementations.
//!
//! These test functions can be called by any backend (PostgreSQL, MySQL, etc.)
//! to ensure consistent election behavior across all implementations. Tests
//! that exercise identity conflicts take two coordinator instances sharing one
//! database, standing in for two distinct processes.

/// Generate all coordination spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// // PostgreSQL example with sqlx::test
/// piquet::generate_coordination_spec_tests! {
///     backend = "pg",
///     test_attr = #[sqlx::test(migrator = "MIGRATOR")],
///     setup = |pool: PgPool| PostgresCoordinator::with_pool(pool)
/// }
/// ```
#[macro_export]
macro_rules! generate_coordination_spec_tests {
    (
        backend = $backend:literal,
        test_attr = #[$test_attr:meta],
        setup = |$pool:ident: $pool_type:ty| $setup_expr:expr
    ) => {
        paste::paste! {
            #[$test_attr]
            async fn [<first_claim_wins_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_first_claim_wins(coordinator).await;
            }

            #[$test_attr]
            async fn [<reacquire_is_idempotent_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_reacquire_is_idempotent(coordinator).await;
            }

            #[$test_attr]
            async fn [<groups_are_independent_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_groups_are_independent(coordinator).await;
            }

            #[$test_attr]
            async fn [<concurrent_fresh_group_single_winner_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_concurrent_fresh_group_single_winner(coordinator).await;
            }

            #[$test_attr]
            async fn [<verify_tracks_active_row_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_verify_tracks_active_row(coordinator).await;
            }

            #[$test_attr]
            async fn [<fresh_heartbeat_blocks_takeover_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_fresh_heartbeat_blocks_takeover(first, second).await;
            }

            #[$test_attr]
            async fn [<stale_heartbeat_allows_takeover_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_stale_heartbeat_allows_takeover(first, second).await;
            }

            #[$test_attr]
            async fn [<missing_heartbeat_treated_as_dead_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_missing_heartbeat_treated_as_dead(first, second).await;
            }

            #[$test_attr]
            async fn [<terms_strictly_increase_across_takeovers_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_terms_strictly_increase_across_takeovers(first, second).await;
            }

            #[$test_attr]
            async fn [<duplicate_identity_rejected_while_live_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_duplicate_identity_rejected_while_live(first, second).await;
            }

            #[$test_attr]
            async fn [<stale_identity_can_be_taken_over_ $backend>]($pool: $pool_type) {
                let first = { let $pool = $pool.clone(); $setup_expr };
                let second = { let $pool = $pool.clone(); $setup_expr };
                $crate::coordination_spec::test_stale_identity_can_be_taken_over(first, second).await;
            }

            #[$test_attr]
            async fn [<same_instance_reregistration_allowed_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_same_instance_reregistration_allowed(coordinator).await;
            }

            #[$test_attr]
            async fn [<second_group_claim_rejected_ $backend>]($pool: $pool_type) {
                let coordinator = $setup_expr;
                $crate::coordination_spec::test_second_group_claim_rejected(coordinator).await;
            }
        }
    };
}

use crate::core::coordinator::{CoordinationError, Coordinator};
use std::time::Duration;

/// Liveness window long enough that a freshly written heartbeat always counts
/// as live within one test run.
const LIVE: Duration = Duration::from_secs(30);

/// First acquire against a fresh group claims it at term 1.
pub async fn test_first_claim_wins<C: Coordinator>(coordinator: C) {
    let result = coordinator.acquire("n1", "g", LIVE).await.unwrap();
    assert!(result.is_leader);
    assert_eq!(result.term, 1);
    assert_eq!(result.task_id, "n1");
    assert_eq!(result.group_id, "g");
    assert!(coordinator.verify("n1", "g").await.unwrap());
}

/// Re-acquiring from the holder itself is the restart/idempotent path: no term
/// bump, still leader.
pub async fn test_reacquire_is_idempotent<C: Coordinator>(coordinator: C) {
    let first = coordinator.acquire("n1", "g", LIVE).await.unwrap();
    let second = coordinator.acquire("n1", "g", LIVE).await.unwrap();
    assert!(second.is_leader);
    assert_eq!(second.term, first.term);
}

/// Elections in different groups sharing one database do not interact.
pub async fn test_groups_are_independent<C: Coordinator>(coordinator: C) {
    let a = coordinator.acquire("n1", "invoices", LIVE).await.unwrap();
    let b = coordinator.acquire("n2", "reports", LIVE).await.unwrap();
    assert!(a.is_leader);
    assert!(b.is_leader);
    assert_eq!(a.term, 1);
    assert_eq!(b.term, 1);
    assert!(coordinator.verify("n1", "invoices").await.unwrap());
    assert!(coordinator.verify("n2", "reports").await.unwrap());
    assert!(!coordinator.verify("n2", "invoices").await.unwrap());
}

/// N concurrent acquires from distinct task ids against a fresh group: exactly
/// one wins with term 1, the rest come back standby.
pub async fn test_concurrent_fresh_group_single_winner<C>(coordinator: C)
where
    C: Coordinator + Clone + 'static,
{
    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.acquire(&format!("n{i}"), "g", LIVE).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        if result.is_leader {
            winners += 1;
            assert_eq!(result.term, 1);
        }
    }
    assert_eq!(winners, 1, "exactly one contender may win a fresh group");
}

/// `verify` is true only for the row currently marked active.
pub async fn test_verify_tracks_active_row<C: Coordinator>(coordinator: C) {
    assert!(!coordinator.verify("n1", "g").await.unwrap());
    coordinator.acquire("n1", "g", LIVE).await.unwrap();
    assert!(coordinator.verify("n1", "g").await.unwrap());
    assert!(!coordinator.verify("n2", "g").await.unwrap());
    assert!(!coordinator.verify("n1", "other").await.unwrap());
}

/// While the holder's heartbeat is fresh a contender stays standby and the
/// table is left untouched.
pub async fn test_fresh_heartbeat_blocks_takeover<C: Coordinator>(first: C, second: C) {
    first.acquire("n1", "g", LIVE).await.unwrap();
    first.publish_heartbeat("n1", "g").await.unwrap();

    let contender = second.acquire("n2", "g", LIVE).await.unwrap();
    assert!(!contender.is_leader);
    assert_eq!(contender.term, 1, "a blocked claim must not move the term");
    assert!(first.verify("n1", "g").await.unwrap());
    assert!(!second.verify("n2", "g").await.unwrap());
}

/// Once the heartbeat age exceeds the liveness interval the next contender
/// takes over at the prior maximum term plus one.
pub async fn test_stale_heartbeat_allows_takeover<C: Coordinator>(first: C, second: C) {
    first.acquire("n1", "g", LIVE).await.unwrap();
    first.publish_heartbeat("n1", "g").await.unwrap();

    // Let the heartbeat age past a 1-second liveness window.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let takeover = second
        .acquire("n2", "g", Duration::from_secs(1))
        .await
        .unwrap();
    assert!(takeover.is_leader);
    assert_eq!(takeover.term, 2);
    assert!(!first.verify("n1", "g").await.unwrap());
    assert!(second.verify("n2", "g").await.unwrap());
}

/// A holder that never wrote a heartbeat is presumed dead.
pub async fn test_missing_heartbeat_treated_as_dead<C: Coordinator>(first: C, second: C) {
    first.acquire("n1", "g", LIVE).await.unwrap();

    let takeover = second.acquire("n2", "g", LIVE).await.unwrap();
    assert!(takeover.is_leader);
    assert_eq!(takeover.term, 2);
    assert!(!first.verify("n1", "g").await.unwrap());
}

/// Terms only ever move forward across a sequence of takeovers.
pub async fn test_terms_strictly_increase_across_takeovers<C: Coordinator>(first: C, second: C) {
    // Neither instance heartbeats, so each claim sees a dead holder.
    let t1 = first.acquire("n1", "g", LIVE).await.unwrap();
    let t2 = second.acquire("n2", "g", LIVE).await.unwrap();
    let t3 = first.acquire("n1", "g", LIVE).await.unwrap();
    assert_eq!((t1.term, t2.term, t3.term), (1, 2, 3));
    assert!(t3.is_leader);
    assert!(first.verify("n1", "g").await.unwrap());
    assert!(!second.verify("n2", "g").await.unwrap());
}

/// A second process claiming an already-registered, still-live task id fails
/// with `DuplicateIdentity`.
pub async fn test_duplicate_identity_rejected_while_live<C: Coordinator>(first: C, second: C) {
    first.acquire("n1", "g", LIVE).await.unwrap();
    first.publish_heartbeat("n1", "g").await.unwrap();

    let result = second.acquire("n1", "g", LIVE).await;
    assert!(
        matches!(result, Err(CoordinationError::DuplicateIdentity { ref task_id }) if task_id == "n1"),
        "expected DuplicateIdentity, got {result:?}"
    );
}

/// A stale registration under the same task id may be adopted by a new
/// process; this is what makes restart under a stable task id work.
pub async fn test_stale_identity_can_be_taken_over<C: Coordinator>(first: C, second: C) {
    first.acquire("n1", "g", LIVE).await.unwrap();
    // No heartbeat: the first registration counts as dead.

    let adopted = second.acquire("n1", "g", LIVE).await.unwrap();
    assert!(adopted.is_leader);
    assert_eq!(adopted.term, 1, "adopting an identity is not a takeover");
    assert!(second.verify("n1", "g").await.unwrap());
}

/// The same logical instance re-registering (e.g. after a reconnect) never
/// trips the duplicate check, even with a fresh heartbeat in place.
pub async fn test_same_instance_reregistration_allowed<C: Coordinator>(coordinator: C) {
    coordinator.acquire("n1", "g", LIVE).await.unwrap();
    coordinator.publish_heartbeat("n1", "g").await.unwrap();

    let again = coordinator.acquire("n1", "g", LIVE).await.unwrap();
    assert!(again.is_leader);
    assert_eq!(again.term, 1);
}

/// A task id stays bound to the group it first registered in. Claiming a
/// different group must fail without touching the existing row: relocating it
/// would erase the first group's term history and let a later claim there
/// restart at term 1.
pub async fn test_second_group_claim_rejected<C: Coordinator>(coordinator: C) {
    coordinator.acquire("n1", "g", LIVE).await.unwrap();

    let result = coordinator.acquire("n1", "h", LIVE).await;
    assert!(
        matches!(
            result,
            Err(CoordinationError::GroupMismatch { ref registered_group_id, .. })
                if registered_group_id == "g"
        ),
        "expected GroupMismatch, got {result:?}"
    );
    assert!(coordinator.verify("n1", "g").await.unwrap());
    assert!(!coordinator.verify("n1", "h").await.unwrap());
}
