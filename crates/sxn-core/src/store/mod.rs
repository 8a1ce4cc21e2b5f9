//! Indexed persistent store for session metadata: optimistic concurrency,
//! full-text-like search, and self-migrating schema.

pub mod schema;
pub mod session;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::config::RecoveryPolicy;
use crate::error::{Error, Result};
use crate::identifiers::{Name, SessionId};
use session::{
    CreateSessionInput, ListQuery, SearchHit, SessionChanges, SessionFilters, SessionRecord,
    SessionSort, SessionStatus, StoreStatistics, WorktreeDescriptor,
};

const BUSY_TIMEOUT_SECS: u32 = 30;
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

mod io {
    use crate::error::{Error, Result};
    use std::path::Path;

    /// Read the first `N` bytes of a file, returning `None` if the file does
    /// not exist (a brand-new store has no header to check yet).
    pub async fn read_prefix(path: &Path, n: usize) -> Result<Option<Vec<u8>>> {
        use tokio::io::AsyncReadExt;
        if !path.exists() {
            return Ok(None);
        }
        let mut file = tokio::fs::File::open(path).await.map_err(Error::Io)?;
        let mut buf = vec![0_u8; n];
        let read = file.read(&mut buf).await.map_err(Error::Io)?;
        buf.truncate(read);
        Ok(Some(buf))
    }
}

async fn check_integrity(db_path: &Path, policy: RecoveryPolicy) -> Result<()> {
    let header = io::read_prefix(db_path, SQLITE_MAGIC.len()).await?;
    if let Some(bytes) = header {
        if bytes != SQLITE_MAGIC {
            return report_integrity_violation(
                format!("database file '{}' has an invalid SQLite header", db_path.display()),
                policy,
            );
        }
    }

    let wal_path = db_path.with_extension("db-wal");
    if let Some(bytes) = io::read_prefix(&wal_path, 4).await? {
        // WAL header magic is one of two 32-bit big-endian constants; a
        // plausible check without depending on SQLite internals directly is
        // simply that the header is non-zero and not all the same byte.
        if bytes.len() == 4 && bytes.iter().all(|b| *b == bytes[0]) {
            return report_integrity_violation(
                format!("WAL file '{}' has a suspicious all-identical header", wal_path.display()),
                policy,
            );
        }
    }

    Ok(())
}

fn report_integrity_violation(message: String, policy: RecoveryPolicy) -> Result<()> {
    match policy {
        RecoveryPolicy::Silent => Ok(()),
        RecoveryPolicy::Warn => {
            tracing::warn!("{message}");
            Ok(())
        }
        RecoveryPolicy::FailFast => Err(Error::Integrity { message }),
    }
}

pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if absent) the store at `path`, running pre-flight
    /// integrity checks and any pending migrations.
    pub async fn open(path: &Path, policy: RecoveryPolicy) -> Result<Self> {
        check_integrity(path, policy).await?;

        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(u64::from(BUSY_TIMEOUT_SECS)));

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        schema::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store, useful for tests that do not care about persistence
    /// across processes.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await?;
        schema::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn create(&self, input: CreateSessionInput) -> Result<SessionId> {
        let name = Name::parse(input.name)?;
        let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM sessions WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(Error::DuplicateSession {
                name: name.as_str().to_string(),
            });
        }

        let id = SessionId::generate();
        let now = Utc::now();
        let status = input.status.unwrap_or(SessionStatus::Active);
        let tags = serde_json::to_string(&input.tags)?;
        let metadata = serde_json::to_string(&input.metadata)?;

        sqlx::query(
            "INSERT INTO sessions (id, name, created_at, updated_at, status, linear_task, description, tags, metadata, worktrees, projects)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, '{}', '[]')",
        )
        .bind(id.as_str())
        .bind(name.as_str())
        .bind(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .bind(now.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .bind(status.to_string())
        .bind(&input.linear_task)
        .bind(&input.description)
        .bind(tags)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord> {
        let id: String = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let status: String = row.try_get("status")?;
        let tags: String = row.try_get("tags")?;
        let metadata: String = row.try_get("metadata")?;
        let worktrees: String = row.try_get("worktrees")?;
        let projects: String = row.try_get("projects")?;

        Ok(SessionRecord {
            id: SessionId::parse(id)?,
            name: Name::parse(name)?,
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| Error::Validation { message: e.to_string() })?
                .with_timezone(&Utc),
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| Error::Validation { message: e.to_string() })?
                .with_timezone(&Utc),
            status: status.parse().map_err(|_| Error::Validation {
                message: format!("invalid status '{status}' in store"),
            })?,
            linear_task: row.try_get("linear_task")?,
            description: row.try_get("description")?,
            tags: serde_json::from_str(&tags)?,
            metadata: serde_json::from_str(&metadata)?,
            worktrees: serde_json::from_str::<BTreeMap<String, WorktreeDescriptor>>(&worktrees)?,
            projects: serde_json::from_str(&projects)?,
        })
    }

    pub async fn get(&self, id: &SessionId) -> Result<SessionRecord> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::SessionNotFound { id: id.as_str().to_string() })?;
        Self::row_to_record(&row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<SessionRecord>> {
        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        if query.filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.filters.linear_task.is_some() {
            sql.push_str(" AND linear_task = ?");
        }
        if query.filters.created_after.is_some() {
            sql.push_str(" AND created_at > ?");
        }
        if query.filters.created_before.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        let sort_col = match query.sort {
            SessionSort::UpdatedAt => "updated_at DESC",
            SessionSort::CreatedAt => "created_at DESC",
            SessionSort::Name => "name ASC",
        };
        sql.push_str(&format!(" ORDER BY {sort_col}"));
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut q = sqlx::query(&sql);
        if let Some(status) = query.filters.status {
            q = q.bind(status.to_string());
        }
        if let Some(task) = &query.filters.linear_task {
            q = q.bind(task.clone());
        }
        if let Some(after) = query.filters.created_after {
            q = q.bind(after.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
        }
        if let Some(before) = query.filters.created_before {
            q = q.bind(before.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;

        if !query.filters.tags.is_empty() {
            records.retain(|r| query.filters.tags.iter().all(|t| r.tags.contains(t)));
        }

        Ok(records)
    }

    pub async fn update(
        &self,
        id: &SessionId,
        changes: &SessionChanges,
        expected_version: Option<&str>,
    ) -> Result<bool> {
        let current = self.get(id).await?;

        if let Some(expected) = expected_version {
            let actual = current.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
            if actual != expected {
                return Err(Error::Conflict {
                    id: id.as_str().to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let mut sql_parts = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(status) = changes.status {
            sql_parts.push("status = ?");
            binds.push(status.to_string());
        }
        if let Some(task) = &changes.linear_task {
            sql_parts.push("linear_task = ?");
            binds.push(task.clone().unwrap_or_default());
        }
        if let Some(desc) = &changes.description {
            sql_parts.push("description = ?");
            binds.push(desc.clone().unwrap_or_default());
        }
        if let Some(tags) = &changes.tags {
            sql_parts.push("tags = ?");
            binds.push(serde_json::to_string(tags)?);
        }
        if let Some(metadata) = &changes.metadata {
            sql_parts.push("metadata = ?");
            binds.push(serde_json::to_string(metadata)?);
        }
        if let Some(worktrees) = &changes.worktrees {
            sql_parts.push("worktrees = ?");
            binds.push(serde_json::to_string(worktrees)?);
        }
        if let Some(projects) = &changes.projects {
            sql_parts.push("projects = ?");
            binds.push(serde_json::to_string(projects)?);
        }

        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        sql_parts.push("updated_at = ?");
        binds.push(now);

        let sql = format!("UPDATE sessions SET {} WHERE id = ?", sql_parts.join(", "));
        let mut q = sqlx::query(&sql);
        for bind in &binds {
            q = q.bind(bind.as_str());
        }
        q = q.bind(id.as_str());
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &SessionId, cascade: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if cascade {
            sqlx::query("DELETE FROM session_worktrees WHERE session_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM session_files WHERE session_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Full-text-style match across `name`, `description`, tags; weighted
    /// relevance: name=100, description=50, tag=25 (accumulates).
    pub async fn search(
        &self,
        query: &str,
        filters: &SessionFilters,
        limit: Option<i64>,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();

        let list_query = ListQuery {
            filters: filters.clone(),
            sort: SessionSort::UpdatedAt,
            limit: None,
            offset: None,
        };
        let records = self.list(&list_query).await?;

        let mut hits: Vec<SearchHit> = records
            .into_iter()
            .filter_map(|record| {
                let mut score = 0_u32;
                if record.name.as_str().to_lowercase().contains(&needle) {
                    score += 100;
                }
                if record
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle))
                {
                    score += 50;
                }
                score += 25 * u32::try_from(
                    record.tags.iter().filter(|t| t.to_lowercase().contains(&needle)).count(),
                )
                .unwrap_or(0);

                (score > 0).then_some(SearchHit { record, relevance_score: score })
            })
            .collect();

        hits.sort_by(|a, b| b.relevance_score.cmp(&a.relevance_score));
        if let Some(limit) = limit {
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            hits.truncate(limit);
        }
        Ok(hits)
    }

    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        let by_status_rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sessions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let recent: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE updated_at > ?",
        )
        .bind((Utc::now() - chrono::Duration::days(7)).to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStatistics {
            total: total.0,
            by_status: by_status_rows.into_iter().collect(),
            recent_activity_last_7_days: recent.0,
            database_size_mb: 0.0,
        })
    }

    /// `vacuum`, `analyze`, `integrity_check`; unknown tasks are silently
    /// ignored.
    pub async fn maintenance(&self, tasks: &[&str]) -> Result<Vec<(String, String)>> {
        let mut results = Vec::new();
        for task in tasks {
            let status = match *task {
                "vacuum" => {
                    sqlx::query("VACUUM").execute(&self.pool).await?;
                    "ok"
                }
                "analyze" => {
                    sqlx::query("ANALYZE").execute(&self.pool).await?;
                    "ok"
                }
                "integrity_check" => {
                    let row: (String,) = sqlx::query_as("PRAGMA integrity_check")
                        .fetch_one(&self.pool)
                        .await?;
                    return Ok(vec![("integrity_check".to_string(), row.0)]);
                }
                _ => continue,
            };
            results.push(((*task).to_string(), status.to_string()));
        }
        Ok(results)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SessionStore {
        SessionStore::open_in_memory().await.expect("open in-memory store")
    }

    #[tokio::test]
    async fn create_then_get_round_trips_up_to_defaults() {
        let store = store().await;
        let id = store
            .create(CreateSessionInput {
                name: "feature-auth".into(),
                ..Default::default()
            })
            .await
            .expect("create ok");
        let record = store.get(&id).await.expect("get ok");
        assert_eq!(record.name.as_str(), "feature-auth");
        assert_eq!(record.status, SessionStatus::Active);
        assert!(record.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let store = store().await;
        store
            .create(CreateSessionInput { name: "dup".into(), ..Default::default() })
            .await
            .expect("first create ok");
        let err = store
            .create(CreateSessionInput { name: "dup".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSession { .. }));
    }

    #[tokio::test]
    async fn update_succeeds_only_with_matching_expected_version() {
        let store = store().await;
        let id = store
            .create(CreateSessionInput { name: "s1".into(), ..Default::default() })
            .await
            .expect("create ok");
        let v1 = store
            .get(&id)
            .await
            .expect("get ok")
            .updated_at
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

        let changes = SessionChanges {
            description: Some(Some("updated".into())),
            ..Default::default()
        };
        let ok = store.update(&id, &changes, Some(&v1)).await.expect("update ok");
        assert!(ok);

        let stale = store.update(&id, &changes, Some(&v1)).await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn delete_cascade_removes_related_rows() {
        let store = store().await;
        let id = store
            .create(CreateSessionInput { name: "gone".into(), ..Default::default() })
            .await
            .expect("create ok");
        sqlx::query("INSERT INTO session_files (session_id, file_path, file_type, created_at) VALUES (?, 'a', 'copy', ?)")
            .bind(id.as_str())
            .bind(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            .execute(store.pool())
            .await
            .expect("insert file row");

        store.delete(&id, true).await.expect("delete ok");

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM session_files WHERE session_id = ?")
            .bind(id.as_str())
            .fetch_one(store.pool())
            .await
            .expect("count ok");
        assert_eq!(remaining.0, 0);
    }

    #[tokio::test]
    async fn search_empty_query_returns_empty() {
        let store = store().await;
        store
            .create(CreateSessionInput { name: "findme".into(), ..Default::default() })
            .await
            .expect("create ok");
        let hits = store.search("", &SessionFilters::default(), None).await.expect("search ok");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn search_scores_name_matches_highest() {
        let store = store().await;
        store
            .create(CreateSessionInput { name: "findme".into(), ..Default::default() })
            .await
            .expect("create ok");
        let hits = store
            .search("findme", &SessionFilters::default(), None)
            .await
            .expect("search ok");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].relevance_score, 100);
    }
}
