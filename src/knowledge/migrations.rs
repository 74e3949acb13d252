//! Version-tracked schema migrations for the libSQL knowledge backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks the
//! current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StorageError;
use crate::knowledge::Collection;

macro_rules! expert_knowledge_ddl {
    () => {
        r#"
        CREATE TABLE IF NOT EXISTS expert_knowledge (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_expert_knowledge_tenant ON expert_knowledge(tenant_id);
        "#
    };
}

macro_rules! collaboration_history_ddl {
    () => {
        r#"
        CREATE TABLE IF NOT EXISTS collaboration_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_collaboration_history_tenant ON collaboration_history(tenant_id);
        "#
    };
}

macro_rules! problem_solutions_ddl {
    () => {
        r#"
        CREATE TABLE IF NOT EXISTS problem_solutions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_problem_solutions_tenant ON problem_solutions(tenant_id);
        "#
    };
}

/// DDL that (re)creates a single collection table. Idempotent.
pub(crate) fn collection_ddl(collection: Collection) -> &'static str {
    match collection {
        Collection::ExpertKnowledge => expert_knowledge_ddl!(),
        Collection::CollaborationHistory => collaboration_history_ddl!(),
        Collection::ProblemSolutions => problem_solutions_ddl!(),
    }
}

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
        name: "knowledge_collections",
        sql: concat!(
            expert_knowledge_ddl!(),
            collaboration_history_ddl!(),
            problem_solutions_ddl!()
        ),
    },
    Migration {
        version: 2,
        name: "tenant_created_indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_expert_knowledge_tenant_created
                ON expert_knowledge(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_collaboration_history_tenant_created
                ON collaboration_history(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_problem_solutions_tenant_created
                ON problem_solutions(tenant_id, created_at);
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub(crate) async fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StorageError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StorageError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Knowledge schema up to date"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StorageError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StorageError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StorageError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            StorageError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StorageError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
