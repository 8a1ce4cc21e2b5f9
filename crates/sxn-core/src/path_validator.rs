//! Path validation for security and session-directory isolation.
//!
//! Every other component routes user-supplied paths through here before touching
//! the filesystem. Fail closed: a path is rejected unless it provably resolves
//! inside the declared root.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
const PATH_MAX: usize = 4096;
#[cfg(not(target_os = "linux"))]
const PATH_MAX: usize = 1024;

/// Validates candidate paths against a declared root and a set of blocked glob patterns.
pub struct PathValidator {
    blocked_patterns: Vec<String>,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PathValidator {
    #[must_use]
    pub fn new(blocked_patterns: Vec<String>) -> Self {
        Self { blocked_patterns }
    }

    /// Canonicalize a path even when it (or a trailing component) does not exist yet,
    /// by canonicalizing the deepest existing ancestor and rejoining the remainder.
    fn safe_canonicalize(path: &Path) -> Result<PathBuf> {
        if let Ok(canonical) = path.canonicalize() {
            return Ok(canonical);
        }

        let mut existing = path;
        let mut remainder = Vec::new();
        loop {
            match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        remainder.push(name.to_owned());
                    }
                    existing = parent;
                    if let Ok(canonical_parent) = existing.canonicalize() {
                        let mut result = canonical_parent;
                        for component in remainder.into_iter().rev() {
                            result.push(component);
                        }
                        return Ok(result);
                    }
                }
                None => return Err(Error::PathNotReadable { path: path.to_path_buf() }),
            }
        }
    }

    /// Check for encoded/unicode/control-character traversal attempts that survive
    /// naive component-based normalization.
    fn contains_traversal_patterns(path_str: &str) -> bool {
        const BASIC: &[&str] = &["../", "..\\", "/..", "\\.."];
        if path_str.starts_with("..") || BASIC.iter().any(|p| path_str.contains(p)) {
            return true;
        }

        const UNICODE_SLASHES: &[char] = &['\u{FF0F}', '\u{2044}', '\u{2215}'];
        if UNICODE_SLASHES
            .iter()
            .any(|&c| path_str.contains(&format!("..{c}")) || path_str.contains(&format!("{c}..")))
        {
            return true;
        }

        const URL_ENCODED: &[&str] = &["%2e%2e", "%2E%2E", "%252e%252e", "%252E%252E"];
        if URL_ENCODED.iter().any(|p| path_str.contains(p)) {
            return true;
        }

        let has_dotdot = path_str.contains("..");
        const CONTROL_CHARS: &[char] = &['\0', '\n', '\r', '\t'];
        (has_dotdot && CONTROL_CHARS.iter().any(|&c| path_str.contains(c)))
            || ((path_str.contains("/etc/") || path_str.contains("\\etc\\"))
                && (has_dotdot || path_str.contains("%2e")))
    }

    fn matches_glob(path_str: &str, pattern: &str) -> bool {
        glob::Pattern::new(pattern).map_or_else(|_| path_str.contains(pattern), |p| p.matches(path_str))
    }

    /// `true` if any blocked pattern matches the full path, the filename, or a
    /// trailing path suffix (last 1-3 normal components).
    #[must_use]
    pub fn is_blocked_path(&self, path: &Path) -> bool {
        if self.blocked_patterns.is_empty() {
            return false;
        }

        let path_str = path.to_string_lossy();
        let filename = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();

        let components: Vec<_> = path.components().collect();
        let suffixes: Vec<String> = (0..3.min(components.len()))
            .filter_map(|skip| {
                let start = components.len().saturating_sub(skip + 1);
                let parts: Vec<_> = components[start..]
                    .iter()
                    .filter_map(|c| match c {
                        Component::Normal(n) => Some(n.to_string_lossy()),
                        _ => None,
                    })
                    .collect();
                (!parts.is_empty()).then(|| parts.join("/"))
            })
            .collect();

        self.blocked_patterns.iter().any(|pattern| {
            Self::matches_glob(&path_str, pattern)
                || Self::matches_glob(&filename, pattern)
                || suffixes.iter().any(|s| Self::matches_glob(s, pattern))
        })
    }

    /// Resolve `candidate` (relative or absolute) against `root` and verify the
    /// result is canonically inside `root`.
    pub fn validate(&self, root: &Path, candidate: &Path) -> Result<PathBuf> {
        let candidate_str = candidate.to_string_lossy();
        if candidate_str.contains('\0') {
            return Err(Error::NullByteInPath);
        }
        if candidate_str.len() > PATH_MAX {
            return Err(Error::PathTooLong { path: candidate.to_path_buf() });
        }
        if Self::contains_traversal_patterns(&candidate_str) {
            return Err(Error::PathEscape {
                attempted: candidate.to_path_buf(),
                root: root.to_path_buf(),
            });
        }

        let canonical_root = Self::safe_canonicalize(root)?;
        let target = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            canonical_root.join(candidate)
        };
        let canonical_target = Self::safe_canonicalize(&target)?;

        if !canonical_target.starts_with(&canonical_root) {
            return Err(Error::PathEscape {
                attempted: canonical_target,
                root: canonical_root,
            });
        }

        if self.is_blocked_path(&canonical_target) {
            return Err(Error::PathBlocked { path: canonical_target });
        }

        Ok(canonical_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn accepts_path_inside_root() {
        let root = tempdir().expect("tempdir");
        fs::write(root.path().join("a.txt"), b"hi").expect("write");
        let validator = PathValidator::default();
        let result = validator.validate(root.path(), Path::new("a.txt"));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_dotdot_escape() {
        let root = tempdir().expect("tempdir");
        let validator = PathValidator::default();
        let err = validator
            .validate(root.path(), Path::new("../../../../etc/passwd"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Security);
    }

    #[test]
    fn rejects_url_encoded_traversal() {
        let root = tempdir().expect("tempdir");
        let validator = PathValidator::default();
        assert!(validator
            .validate(root.path(), Path::new("%2e%2e%2fetc%2fpasswd"))
            .is_err());
    }

    #[test]
    fn rejects_nonexistent_deep_path_outside_root() {
        let root = tempdir().expect("tempdir");
        let validator = PathValidator::default();
        assert!(validator
            .validate(root.path(), Path::new("../outside/does/not/exist"))
            .is_err());
    }

    #[test]
    fn blocked_pattern_matches_suffix() {
        let root = tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join(".git/hooks")).expect("mkdir");
        fs::write(root.path().join(".git/hooks/pre-commit"), b"x").expect("write");
        let validator = PathValidator::new(vec!["**/.git/**".to_string()]);
        let resolved = validator
            .validate(root.path(), Path::new(".git/hooks/pre-commit"))
            .expect("resolves inside root");
        assert!(validator.is_blocked_path(&resolved));
    }

    #[test]
    fn null_byte_is_rejected() {
        let root = tempdir().expect("tempdir");
        let validator = PathValidator::default();
        let bad = Path::new("a\0b");
        assert!(validator.validate(root.path(), bad).is_err());
    }
}
