//! Session Orchestrator: the thin coordinator that composes every other
//! component to create, activate, and remove sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::copier::FileCopier;
use crate::detector;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecOptions};
use crate::lock::{self, SessionLock};
use crate::rules::engine::RulesEngine;
use crate::rules::types::{ExecutionResult, RuleDefinition};
use crate::rules::RuleContext;
use crate::store::session::{CreateSessionInput, WorktreeDescriptor};
use crate::store::SessionStore;
use crate::template::VariableNamespace;

/// A project registered with the orchestrator: name, absolute path, and
/// default branch to check worktrees out from.
#[derive(Debug, Clone)]
pub struct ProjectRegistration {
    pub name: String,
    pub path: PathBuf,
    pub default_branch: String,
}

pub struct SessionOrchestrator {
    store: SessionStore,
    sessions_root: PathBuf,
    agent_id: String,
    allowed_commands: Vec<String>,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(store: SessionStore, sessions_root: PathBuf, agent_id: String) -> Self {
        Self {
            store,
            sessions_root,
            agent_id,
            allowed_commands: Vec::new(),
        }
    }

    /// Build from `EngineConfig` (ordinarily `EngineConfig::from_env()`), so
    /// `SXN_SESSIONS_FOLDER`, `SXN_AGENT_ID`, and `SXN_ALLOWED_COMMANDS`
    /// govern session materialization without the caller threading them
    /// through by hand. Falls back to a process-derived agent id when
    /// `SXN_AGENT_ID` is unset.
    #[must_use]
    pub fn from_config(store: SessionStore, config: EngineConfig) -> Self {
        let agent_id = config
            .agent_id
            .unwrap_or_else(|| format!("agent-{}", std::process::id()));
        Self {
            store,
            sessions_root: config.sessions_folder,
            agent_id,
            allowed_commands: config.allowed_commands,
        }
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a session, materialize one git worktree per project, and apply
    /// the merged rule set for each. Returns the execution result per project.
    pub async fn create_session(
        &self,
        name: &str,
        projects: &[ProjectRegistration],
        user_rules: &std::collections::BTreeMap<String, RuleDefinition>,
        master_key: Option<[u8; 32]>,
    ) -> Result<(crate::identifiers::SessionId, Vec<(String, ExecutionResult)>)> {
        let id = self
            .store
            .create(CreateSessionInput {
                name: name.to_string(),
                tags: Vec::new(),
                ..Default::default()
            })
            .await?;

        let session_dir = self.sessions_root.join(name);
        std::fs::create_dir_all(&session_dir).map_err(Error::Io)?;

        let _lock = SessionLock::acquire(&session_dir, &self.agent_id, lock::default_ttl())?;

        let mut worktrees = std::collections::BTreeMap::new();
        let mut results = Vec::new();

        for project in projects {
            let worktree_path = session_dir.join(&project.name);
            let branch = format!("{}-{name}", project.name);

            let mut worktree_allowed = vec!["git".to_string()];
            worktree_allowed.extend(self.allowed_commands.clone());
            let executor = CommandExecutor::new(project.path.clone(), worktree_allowed);
            let worktree_arg = worktree_path.to_string_lossy().into_owned();
            let argv = vec![
                "git".to_string(),
                "worktree".to_string(),
                "add".to_string(),
                "-b".to_string(),
                branch.clone(),
                worktree_arg,
                project.default_branch.clone(),
            ];
            let add_result = executor.execute(&argv, ExecOptions::default()).await?;
            if !add_result.success {
                return Err(Error::CommandFailed {
                    argv,
                    code: add_result.exit_code,
                    stdout: add_result.stdout,
                    stderr: add_result.stderr,
                });
            }

            worktrees.insert(
                project.name.clone(),
                WorktreeDescriptor {
                    project_name: project.name.clone(),
                    path: worktree_path.to_string_lossy().into_owned(),
                    branch: branch.clone(),
                    created_at: chrono::Utc::now(),
                },
            );

            let detection = detector::detect(&project.path);
            let mut merged_rules = user_rules.clone();
            for (rule_name, config) in detector::suggest_default_rules(detection.project_type) {
                merged_rules.entry(rule_name.clone()).or_insert_with(|| RuleDefinition {
                    name: rule_name,
                    config,
                    dependencies: Vec::new(),
                });
            }

            if merged_rules.is_empty() {
                results.push((
                    project.name.clone(),
                    ExecutionResult {
                        outcome: crate::rules::types::ExecutionOutcome::Success,
                        applied: Vec::new(),
                        failed: Vec::new(),
                        skipped: Vec::new(),
                        total_wall_time: Duration::ZERO,
                        rule_outcomes: std::collections::BTreeMap::new(),
                    },
                ));
                continue;
            }

            let rule_executor = CommandExecutor::new(worktree_path.clone(), self.allowed_commands.clone());
            let copier = FileCopier::new();
            let worktree_path_str = worktree_path.to_string_lossy().into_owned();
            let project_type_str = detection.project_type.to_string();
            let namespace = VariableNamespace::builder()
                .project(&project.name, &worktree_path_str, &project_type_str)
                .build(&rule_executor, &worktree_path)
                .await;

            let ctx = RuleContext {
                session_root: &worktree_path,
                source_root: &project.path,
                executor: &rule_executor,
                copier: &copier,
                master_key,
                session_salt: id.as_str().as_bytes().to_vec(),
                namespace: &namespace,
                project_type: detection.project_type,
            };

            let result = RulesEngine::apply(&merged_rules, &ctx, false, None).await?;
            results.push((project.name.clone(), result));
        }

        self.store
            .update(
                &id,
                &crate::store::session::SessionChanges {
                    worktrees: Some(worktrees.clone()),
                    projects: Some(projects.iter().map(|p| p.name.clone()).collect()),
                    ..Default::default()
                },
                None,
            )
            .await?;

        Ok((id, results))
    }

    /// Remove a session's worktrees and directory tree, then delete its
    /// record (cascading to its worktree/file rows).
    pub async fn remove_session(&self, name: &str, registry: &[ProjectRegistration]) -> Result<()> {
        let record = self
            .store
            .get_by_name(name)
            .await?
            .ok_or_else(|| Error::SessionNotFound { id: name.to_string() })?;

        for descriptor in record.worktrees.values() {
            if let Some(project) = registry.iter().find(|p| p.name == descriptor.project_name) {
                let executor = CommandExecutor::new(project.path.clone(), vec!["git".to_string()]);
                if let Err(e) = executor
                    .execute(
                        &[
                            "git".to_string(),
                            "worktree".to_string(),
                            "remove".to_string(),
                            "--force".to_string(),
                            descriptor.path.clone(),
                        ],
                        ExecOptions::default(),
                    )
                    .await
                {
                    tracing::warn!(
                        project = %descriptor.project_name,
                        path = %descriptor.path,
                        error = %e,
                        "git worktree remove failed"
                    );
                }
            }
        }

        let session_dir = self.sessions_root.join(name);
        if session_dir.exists() {
            std::fs::remove_dir_all(&session_dir).map_err(Error::Io)?;
        }

        self.store.delete(&record.id, true).await
    }

    #[must_use]
    pub fn session_dir(&self, name: &str) -> PathBuf {
        self.sessions_root.join(name)
    }

    #[must_use]
    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }
}
