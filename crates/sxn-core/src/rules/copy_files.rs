//! `copy_files` rule: duplicate or symlink one or more files from a
//! project's registered checkout into the session.

use std::path::{Path, PathBuf};

use crate::copier::{CopyRequest, CopyStrategy};
use crate::error::{Error, Result};
use crate::path_validator::PathValidator;

use super::types::{AppliedChange, CopyFileSpec, CopyStrategySpec};
use super::{RuleContext, RuleImpl};

pub struct CopyFilesRule {
    files: Vec<CopyFileSpec>,
}

impl CopyFilesRule {
    #[must_use]
    pub fn new(files: Vec<CopyFileSpec>) -> Self {
        Self { files }
    }

    /// Expand a glob source pattern against `source_root`, returning
    /// `(absolute_source, relative_path)` pairs.
    fn expand_matches(source_root: &Path, pattern: &str) -> Vec<(PathBuf, String)> {
        if !pattern.contains('*') && !pattern.contains('?') {
            let absolute = source_root.join(pattern);
            return vec![(absolute, pattern.to_string())];
        }

        let full_pattern = source_root.join(pattern).to_string_lossy().into_owned();
        glob::glob(&full_pattern)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .filter_map(|absolute| {
                let relative = absolute.strip_prefix(source_root).ok()?.to_string_lossy().into_owned();
                Some((absolute, relative))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl RuleImpl for CopyFilesRule {
    fn validate(&self) -> Result<()> {
        for spec in &self.files {
            if spec.source.trim().is_empty() {
                return Err(Error::Validation {
                    message: "copy_files entry must declare a non-empty source".into(),
                });
            }
            spec.mode()?;
        }
        Ok(())
    }

    async fn perform(&self, ctx: &RuleContext<'_>) -> Result<Vec<AppliedChange>> {
        let mut changes = Vec::new();
        let validator = PathValidator::default();

        for spec in &self.files {
            let matches = Self::expand_matches(ctx.source_root, &spec.source);

            if matches.is_empty() {
                if spec.required {
                    return Err(Error::SourceMissing {
                        path: ctx.source_root.join(&spec.source),
                    });
                }
                continue;
            }

            let is_glob = spec.source.contains('*') || spec.source.contains('?');

            for (absolute_source, relative_path) in matches {
                // A glob entry with no explicit destination mirrors the matched
                // relative path; a plain entry uses the configured destination.
                let destination_rel = if is_glob {
                    relative_path.clone()
                } else {
                    spec.destination_path().to_string()
                };

                validator.validate(ctx.source_root, Path::new(&relative_path))?;

                let strategy = match spec.strategy() {
                    CopyStrategySpec::Copy => CopyStrategy::Copy,
                    CopyStrategySpec::Symlink => CopyStrategy::Symlink,
                };

                let request = CopyRequest {
                    source: &absolute_source,
                    destination: Path::new(&destination_rel),
                    strategy,
                    mode: spec.mode()?,
                    encrypt: spec.encrypt,
                    required: spec.required,
                };

                let outcome = ctx.copier.copy(
                    ctx.session_root,
                    &request,
                    ctx.master_key.as_ref(),
                    &ctx.session_salt,
                )?;
                changes.push(AppliedChange::Copy(outcome));
            }
        }

        Ok(changes)
    }

    fn rollback(&self, _ctx: &RuleContext<'_>, changes: &[AppliedChange]) -> Result<()> {
        for change in changes.iter().rev() {
            if let AppliedChange::Copy(outcome) = change {
                // Reuse a throwaway copier; rollback only reads the outcome's
                // recorded prior state and touches the filesystem directly.
                crate::copier::FileCopier::new().rollback(outcome)?;
            }
        }
        Ok(())
    }
}
