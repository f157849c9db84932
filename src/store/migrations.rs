//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "leads_and_funnels",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                suppressed INTEGER NOT NULL DEFAULT 0,
                fields TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);
            CREATE INDEX IF NOT EXISTS idx_leads_created ON leads(created_at);

            CREATE TABLE IF NOT EXISTS funnels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS funnel_steps (
                id TEXT PRIMARY KEY,
                funnel_id TEXT NOT NULL REFERENCES funnels(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                delay_value INTEGER NOT NULL DEFAULT 0,
                delay_unit TEXT NOT NULL DEFAULT 'days',
                send_time TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                subject TEXT NOT NULL,
                html TEXT NOT NULL,
                UNIQUE (funnel_id, position)
            );

            CREATE TABLE IF NOT EXISTS funnel_enrollments (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                funnel_id TEXT NOT NULL REFERENCES funnels(id) ON DELETE CASCADE,
                current_step_position INTEGER NOT NULL,
                next_send_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (lead_id, funnel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due
                ON funnel_enrollments(status, next_send_at);

            CREATE TABLE IF NOT EXISTS immediate_sends (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                html TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_immediate_sends_status
                ON immediate_sends(status, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "transmissions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS transmissions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                mode TEXT NOT NULL DEFAULT 'immediate',
                scheduled_at TEXT,
                min_interval_seconds INTEGER NOT NULL DEFAULT 0,
                max_interval_seconds INTEGER NOT NULL DEFAULT 0,
                send_order TEXT NOT NULL DEFAULT 'newest_first',
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'draft',
                audience TEXT NOT NULL,
                subject TEXT NOT NULL,
                html TEXT NOT NULL,
                total_recipients INTEGER NOT NULL DEFAULT 0,
                sent_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                pending_count INTEGER NOT NULL DEFAULT 0,
                next_dispatch_at TEXT,
                failure_reason TEXT,
                launched_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transmissions_status ON transmissions(status);

            CREATE TABLE IF NOT EXISTS transmission_recipients (
                id TEXT PRIMARY KEY,
                transmission_id TEXT NOT NULL REFERENCES transmissions(id) ON DELETE CASCADE,
                lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (transmission_id, lead_id)
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_pending
                ON transmission_recipients(transmission_id, state);
        "#,
    },
    Migration {
        version: 3,
        name: "sending_and_suppression",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sending_accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                from_address TEXT NOT NULL,
                smtp_host TEXT NOT NULL,
                smtp_port INTEGER NOT NULL DEFAULT 587,
                smtp_username TEXT NOT NULL,
                smtp_password TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                position INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sending_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                daily_limit INTEGER NOT NULL,
                min_interval_seconds INTEGER NOT NULL,
                rotation_chunk_size INTEGER NOT NULL,
                emails_sent_today INTEGER NOT NULL DEFAULT 0,
                counter_date TEXT NOT NULL,
                last_sent_at TEXT,
                current_account_index INTEGER NOT NULL DEFAULT 0,
                remaining_chunk INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT OR IGNORE INTO sending_config
                (id, daily_limit, min_interval_seconds, rotation_chunk_size, counter_date, remaining_chunk)
                VALUES (1, 200, 60, 10, '1970-01-01', 10);

            CREATE TABLE IF NOT EXISTS suppressions (
                email TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                reference_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                email TEXT NOT NULL,
                account_id TEXT NOT NULL,
                account_name TEXT NOT NULL,
                subject TEXT NOT NULL,
                sent INTEGER NOT NULL,
                error_class TEXT,
                error TEXT,
                variation_applied INTEGER NOT NULL DEFAULT 0,
                attempted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delivery_log_reference ON delivery_log(reference_id);
        "#,
    },
    Migration {
        version: 4,
        name: "scheduler_leases",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduler_leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn count(conn: &Connection, sql: &str) -> i64 {
        let mut rows = conn.query(sql, ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "leads",
            "funnels",
            "funnel_steps",
            "funnel_enrollments",
            "immediate_sends",
            "transmissions",
            "transmission_recipients",
            "sending_accounts",
            "sending_config",
            "suppressions",
            "delivery_log",
            "scheduler_leases",
        ] {
            let n = count(
                &conn,
                &format!("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='{table}'"),
            )
            .await;
            assert_eq!(n, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 4);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM sending_config").await, 1);
    }

    #[tokio::test]
    async fn migration_future_can_move_across_threads() {
        fn assert_send<T: Send>(_: &T) {}

        let conn = test_conn().await;
        let fut = run_migrations(&conn);
        assert_send(&fut);
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            applied.push((v, n));
        }
        assert_eq!(
            applied,
            vec![
                (1, "leads_and_funnels".to_string()),
                (2, "transmissions".to_string()),
                (3, "sending_and_suppression".to_string()),
                (4, "scheduler_leases".to_string()),
            ]
        );
    }
}
