//! Per-session advisory lock: a real file under the session directory, held
//! exclusively for the duration of one `apply()` so overlapping operations on
//! the same session fail fast instead of racing on the filesystem.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const LOCK_FILE_NAME: &str = ".sxn-lock";
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: u64,
    pub ttl_secs: u64,
}

impl LockInfo {
    fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.acquired_at) > self.ttl_secs
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A held advisory lock. Dropping it releases the OS-level file lock but does
/// not delete the file; the payload is left behind for diagnostics.
pub struct SessionLock {
    _file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Attempt to acquire the lock for `session_dir`, reclaiming a stale lock
    /// (past its recorded TTL) if one is found.
    pub fn acquire(session_dir: &Path, holder: &str, ttl: Duration) -> Result<Self> {
        let path = session_dir.join(LOCK_FILE_NAME);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::Io)?;

        if file.try_lock_exclusive().is_err() {
            let stale = std::fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok())
                .is_some_and(|info| info.is_stale(now_unix()));

            if !stale {
                return Err(Error::Validation {
                    message: format!("session at '{}' is locked by another operation", session_dir.display()),
                });
            }
            file.lock_exclusive().map_err(Error::Io)?;
        }

        let info = LockInfo {
            holder: holder.to_string(),
            acquired_at: now_unix(),
            ttl_secs: ttl.as_secs(),
        };
        let payload = serde_json::to_string(&info)?;
        std::fs::write(&path, payload).map_err(Error::Io)?;

        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[must_use]
pub fn default_ttl() -> Duration {
    Duration::from_secs(DEFAULT_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_writes_payload() {
        let dir = tempdir().expect("tempdir");
        let lock = SessionLock::acquire(dir.path(), "agent-1", default_ttl()).expect("lock ok");
        let payload = std::fs::read_to_string(lock.path()).expect("read lock file");
        let info: LockInfo = serde_json::from_str(&payload).expect("parse lock info");
        assert_eq!(info.holder, "agent-1");
    }

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempdir().expect("tempdir");
        let _first = SessionLock::acquire(dir.path(), "agent-1", default_ttl()).expect("first lock");
        let second = SessionLock::acquire(dir.path(), "agent-2", default_ttl());
        assert!(second.is_err());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(LOCK_FILE_NAME);
        let stale = LockInfo {
            holder: "agent-old".into(),
            acquired_at: 0,
            ttl_secs: 1,
        };
        std::fs::write(&path, serde_json::to_string(&stale).expect("serialize")).expect("write");

        let result = SessionLock::acquire(dir.path(), "agent-new", default_ttl());
        assert!(result.is_ok());
    }
}
