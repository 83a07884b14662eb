//! PostgreSQL implementation of the Coordinator trait from piquet

pub mod coordinator;

pub use coordinator::PostgresCoordinator;
use sqlx::migrate::Migrator;
pub static MIGRATOR: Migrator = sqlx::migrate!();
