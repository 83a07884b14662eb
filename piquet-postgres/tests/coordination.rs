use piquet_postgres::{PostgresCoordinator, MIGRATOR};
use sqlx::PgPool;

fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

piquet::generate_coordination_spec_tests! {
    backend = "pg",
    test_attr = #[sqlx::test(migrator = "MIGRATOR")],
    setup = |pool: PgPool| {
        setup_logger();
        PostgresCoordinator::with_pool(pool)
    }
}
