//! Embedded schema and version-to-version migrations.

use sqlx::SqlitePool;

use crate::error::{Error, Result};

pub const CURRENT_VERSION: i64 = 2;

pub const SCHEMA_V2: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('active', 'inactive', 'archived')),
    linear_task TEXT,
    description TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    worktrees TEXT NOT NULL DEFAULT '{}',
    projects TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at);
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);
CREATE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name);
CREATE INDEX IF NOT EXISTS idx_sessions_status_updated ON sessions(status, updated_at);
CREATE INDEX IF NOT EXISTS idx_sessions_status_created ON sessions(status, created_at);
CREATE INDEX IF NOT EXISTS idx_sessions_linear_task ON sessions(linear_task) WHERE linear_task IS NOT NULL;

CREATE TABLE IF NOT EXISTS session_worktrees (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    project_name TEXT NOT NULL,
    path TEXT NOT NULL,
    branch TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, project_name)
);

CREATE TABLE IF NOT EXISTS session_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    file_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
";

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

async fn column_exists<'e, E>(executor: E, table: &str, column: &str) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
        sqlx::query_as(&format!("PRAGMA table_info({table})"))
            .fetch_all(executor)
            .await?;
    Ok(rows.iter().any(|(_, col_name, ..)| col_name == column))
}

async fn read_version(pool: &SqlitePool) -> Result<i64> {
    if !table_exists(pool, "schema_version").await? {
        return Ok(0);
    }
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map_or(0, |(v,)| v))
}

async fn write_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version").execute(pool).await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// `fresh -> migrating -> ready`. Errors leave the store closed (the caller's
/// pool is dropped by propagating the error out of `open`).
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let sessions_exists = table_exists(pool, "sessions").await?;
    let mut version = read_version(pool).await?;

    if version == 0 && sessions_exists {
        let has_worktrees = column_exists(pool, "sessions", "worktrees").await?;
        let has_projects = column_exists(pool, "sessions", "projects").await?;
        if !has_worktrees || !has_projects {
            tracing::warn!("detected pre-v2 session store layout; synthesizing version=1");
            version = 1;
        }
    }

    if version == 0 && !sessions_exists {
        apply_v2_schema(pool).await?;
        write_version(pool, CURRENT_VERSION).await?;
        return Ok(());
    }

    if version < CURRENT_VERSION {
        let mut tx = pool.begin().await?;
        if version < 1 {
            // no-op: initial schema already implies v1 shape for fresh stores
        }
        if version < 2 {
            migrate_v1_to_v2(&mut tx).await.map_err(|e| Error::Migration {
                from: version,
                message: e.to_string(),
            })?;
        }
        tx.commit().await?;
        write_version(pool, CURRENT_VERSION).await?;
    }

    Ok(())
}

async fn apply_v2_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_V2).execute(pool).await?;
    Ok(())
}

async fn migrate_v1_to_v2(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    if !column_exists(&mut **tx, "sessions", "worktrees").await.unwrap_or(false) {
        sqlx::query("ALTER TABLE sessions ADD COLUMN worktrees TEXT NOT NULL DEFAULT '{}'")
            .execute(&mut **tx)
            .await?;
    }
    if !column_exists(&mut **tx, "sessions", "projects").await.unwrap_or(false) {
        sqlx::query("ALTER TABLE sessions ADD COLUMN projects TEXT NOT NULL DEFAULT '[]'")
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS session_worktrees (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            project_name TEXT NOT NULL,
            path TEXT NOT NULL,
            branch TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(session_id, project_name)
        )",
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS session_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            file_path TEXT NOT NULL,
            file_type TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}
