//! In-memory projections of session rows. The store is the single source of
//! truth; these types never hold a pointer back to a project or worktree —
//! only names and ids, looked up again through the store when needed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identifiers::{Name, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeDescriptor {
    pub project_name: String,
    pub path: String,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: Name,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub linear_task: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    pub worktrees: BTreeMap<String, WorktreeDescriptor>,
    pub projects: Vec<String>,
}

impl SessionRecord {
    /// Invariant: `updated_at >= created_at`, status is one of the enumerated
    /// values (guaranteed by the type system here), and every worktree's
    /// project name appears in `projects`.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.updated_at < self.created_at {
            return Err("updated_at must be >= created_at".to_string());
        }
        for project_name in self.worktrees.keys() {
            if !self.projects.iter().any(|p| p == project_name) {
                return Err(format!(
                    "worktree references project '{project_name}' not in projects set"
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionInput {
    pub name: String,
    pub status: Option<SessionStatus>,
    pub linear_task: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// Whitelisted set of columns `update()` may change. Any other key is an
/// `Error::UnknownField`.
#[derive(Debug, Clone, Default)]
pub struct SessionChanges {
    pub status: Option<SessionStatus>,
    pub linear_task: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, Value>>,
    pub worktrees: Option<BTreeMap<String, WorktreeDescriptor>>,
    pub projects: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilters {
    pub status: Option<SessionStatus>,
    pub linear_task: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSort {
    UpdatedAt,
    CreatedAt,
    Name,
}

impl Default for SessionSort {
    fn default() -> Self {
        Self::UpdatedAt
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filters: SessionFilters,
    pub sort: SessionSort,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: SessionRecord,
    pub relevance_score: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub recent_activity_last_7_days: i64,
    pub database_size_mb: f64,
}
