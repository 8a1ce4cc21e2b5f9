//! Crate-wide error type.
//!
//! One variant per error kind named in the error-handling design: callers match on
//! `kind()` to decide exit-code / retry behavior without enumerating every variant.

use std::path::PathBuf;

use thiserror::Error;

/// The five-way classification used by the orchestrator to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Security,
    Execution,
    Storage,
}

#[derive(Debug, Error)]
pub enum Error {
    // --- Validation ---
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("unknown field '{field}' in update")]
    UnknownField { field: String },

    #[error("cyclic dependency detected among rules: {cycle:?}")]
    CyclicDependency { cycle: Vec<String> },

    #[error("rule '{rule}' declares unknown dependency '{dependency}'")]
    UnknownDependency { rule: String, dependency: String },

    // --- Not-found ---
    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("project not found: {name}")]
    ProjectNotFound { name: String },

    #[error("source file not found: {path}")]
    SourceMissing { path: PathBuf },

    #[error("template not found: {path}")]
    TemplateMissing { path: PathBuf },

    // --- Conflict ---
    #[error("session name already in use: {name}")]
    DuplicateSession { name: String },

    #[error("optimistic lock conflict on {id}: expected version {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    // --- Security ---
    #[error("path '{attempted}' escapes root '{root}'")]
    PathEscape { attempted: PathBuf, root: PathBuf },

    #[error("path '{path}' is not readable")]
    PathNotReadable { path: PathBuf },

    #[error("path '{path}' exceeds the platform maximum length")]
    PathTooLong { path: PathBuf },

    #[error("path contains an embedded NUL byte")]
    NullByteInPath,

    #[error("path '{path}' matches a blocked pattern")]
    PathBlocked { path: PathBuf },

    #[error("command '{program}' is not on the allow-list")]
    CommandNotAllowed { program: String },

    // --- Execution ---
    #[error("command {argv:?} exited with status {code:?}")]
    CommandFailed {
        argv: Vec<String>,
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("command {argv:?} timed out after {timeout_secs}s")]
    Timeout { argv: Vec<String>, timeout_secs: u64 },

    #[error("command {argv:?} cancelled")]
    Cancelled { argv: Vec<String> },

    #[error("template syntax error: {message}")]
    TemplateSyntax { message: String },

    #[error("template render error: {message}")]
    TemplateRender { message: String },

    // --- Storage ---
    #[error("migration failed at version {from}: {message}")]
    Migration { from: i64, message: String },

    #[error("database integrity check failed: {message}")]
    Integrity { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("transaction failed: {message}")]
    Transaction { message: String },

    // --- Glue ---
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::UnknownField { .. }
            | Self::CyclicDependency { .. }
            | Self::UnknownDependency { .. } => ErrorKind::Validation,

            Self::SessionNotFound { .. }
            | Self::ProjectNotFound { .. }
            | Self::SourceMissing { .. }
            | Self::TemplateMissing { .. } => ErrorKind::NotFound,

            Self::DuplicateSession { .. } | Self::Conflict { .. } => ErrorKind::Conflict,

            Self::PathEscape { .. }
            | Self::PathNotReadable { .. }
            | Self::PathTooLong { .. }
            | Self::NullByteInPath
            | Self::PathBlocked { .. }
            | Self::CommandNotAllowed { .. } => ErrorKind::Security,

            Self::CommandFailed { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. }
            | Self::TemplateSyntax { .. }
            | Self::TemplateRender { .. } => ErrorKind::Execution,

            Self::Migration { .. }
            | Self::Integrity { .. }
            | Self::Storage(_)
            | Self::Transaction { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Yaml(_) => ErrorKind::Storage,
        }
    }

    /// Exit code mapping per the error-handling design: 0 is reserved for success.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 2,
            ErrorKind::Security => 3,
            ErrorKind::Conflict => 4,
            ErrorKind::NotFound | ErrorKind::Execution | ErrorKind::Storage => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
