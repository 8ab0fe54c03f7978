//! Schema setup for the Postgres stores.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so applying on each
//! startup is safe.

use sqlx::PgPool;
use tracing::info;

/// Migration scripts in apply order.
pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_feature_flag_schedules",
        include_str!("../migrations/0001_feature_flag_schedules.sql"),
    ),
    ("0002_feature_flags", include_str!("../migrations/0002_feature_flags.sql")),
];

/// Apply every migration in order.
pub async fn apply_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        info!(migration = name, "migration applied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_create_their_tables() {
        let names: Vec<_> = MIGRATIONS.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        assert!(MIGRATIONS[0].1.contains("CREATE TABLE IF NOT EXISTS feature_flag_schedules"));
        assert!(MIGRATIONS[0].1.contains("claim_token"));
        assert!(MIGRATIONS[1].1.contains("CREATE TABLE IF NOT EXISTS feature_flags"));
    }
}
