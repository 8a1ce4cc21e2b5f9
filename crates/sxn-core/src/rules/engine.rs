//! Validates, schedules, executes, and rolls back a batch of rules.

use std::collections::BTreeMap;
use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::error::{Error, Result};

use super::graph::{self, Scheduler};
use super::types::{AppliedChange, ExecutionOutcome, ExecutionResult, RuleDefinition, RuleOutcome, RuleState};
use super::{build_rule, RuleContext};

const UPSTREAM_FAILURE_REASON: &str = "upstream failure";

/// Fill in `stdout`/`stderr`/`exit_code` from the last command a rule ran, if
/// any — copy_files and template rules leave these `None`, per "where
/// applicable" in the execution result contract.
fn fill_command_output(outcome: &mut RuleOutcome, changes: &[AppliedChange]) {
    if let Some(AppliedChange::CommandExecuted { stdout, stderr, exit_code, .. }) =
        changes.iter().rev().find(|c| matches!(c, AppliedChange::CommandExecuted { .. }))
    {
        outcome.stdout = Some(stdout.clone());
        outcome.stderr = Some(stderr.clone());
        outcome.exit_code = *exit_code;
    }
}

/// Same, but pulled from the error a failed rule returned rather than from
/// its (discarded) applied changes.
fn fill_command_output_from_error(outcome: &mut RuleOutcome, error: &Error) {
    if let Error::CommandFailed { code, stdout, stderr, .. } = error {
        outcome.stdout = Some(stdout.clone());
        outcome.stderr = Some(stderr.clone());
        outcome.exit_code = *code;
    }
}

pub struct RulesEngine;

impl RulesEngine {
    /// Each entry's config must be internally valid and every dependency
    /// must name a key present in `rules`; the induced graph must be acyclic.
    pub fn validate(rules: &BTreeMap<String, RuleDefinition>) -> Result<()> {
        for def in rules.values() {
            build_rule(&def.config).validate()?;
        }
        graph::validate_acyclic(rules)
    }

    pub async fn apply(
        rules: &BTreeMap<String, RuleDefinition>,
        ctx: &RuleContext<'_>,
        parallel: bool,
        max_parallelism: Option<usize>,
    ) -> Result<ExecutionResult> {
        Self::validate(rules)?;

        let start = Instant::now();
        let mut outcomes: BTreeMap<String, RuleOutcome> =
            rules.keys().map(|name| (name.clone(), RuleOutcome::default())).collect();
        let mut applied_order: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut aborted = false;

        if parallel {
            Self::apply_parallel(
                rules,
                ctx,
                max_parallelism,
                &mut outcomes,
                &mut applied_order,
                &mut failed,
                &mut skipped,
                &mut aborted,
            )
            .await;
        } else {
            Self::apply_serial(rules, ctx, &mut outcomes, &mut applied_order, &mut failed, &mut skipped, &mut aborted)
                .await;
        }

        for name in rules.keys() {
            if matches!(outcomes[name].state, RuleState::Pending) {
                skipped.push(name.clone());
                outcomes.get_mut(name).expect("known key").state = RuleState::Skipped;
            }
        }

        if aborted {
            Self::rollback_all(rules, ctx, &applied_order, &mut outcomes);
            applied_order.clear();
        }

        let outcome = if aborted {
            ExecutionOutcome::Failed
        } else if failed.is_empty() && skipped.is_empty() {
            ExecutionOutcome::Success
        } else {
            ExecutionOutcome::Partial
        };

        Ok(ExecutionResult {
            outcome,
            applied: applied_order,
            failed,
            skipped,
            total_wall_time: start.elapsed(),
            rule_outcomes: outcomes,
        })
    }

    async fn apply_serial(
        rules: &BTreeMap<String, RuleDefinition>,
        ctx: &RuleContext<'_>,
        outcomes: &mut BTreeMap<String, RuleOutcome>,
        applied_order: &mut Vec<String>,
        failed: &mut Vec<String>,
        skipped: &mut Vec<String>,
        aborted: &mut bool,
    ) {
        let order = match graph::topological_order(rules) {
            Ok(order) => order,
            Err(_) => return,
        };

        let mut upstream_failed: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        for name in order {
            if *aborted {
                skipped.push(name.clone());
                outcomes.get_mut(&name).expect("known key").state = RuleState::Skipped;
                continue;
            }

            if upstream_failed.contains(&name) {
                let outcome = outcomes.get_mut(&name).expect("known key");
                outcome.state = RuleState::Skipped;
                outcome.error = Some(UPSTREAM_FAILURE_REASON.to_string());
                skipped.push(name.clone());
                continue;
            }

            let def = &rules[&name];
            let rule = build_rule(&def.config);
            let rule_start = Instant::now();
            outcomes.get_mut(&name).expect("known key").state = RuleState::Running;

            match rule.perform(ctx).await {
                Ok(changes) => {
                    let outcome = outcomes.get_mut(&name).expect("known key");
                    outcome.state = RuleState::Applied;
                    outcome.duration = rule_start.elapsed();
                    fill_command_output(outcome, &changes);
                    outcome.changes = changes;
                    applied_order.push(name.clone());
                }
                Err(e) => {
                    let outcome = outcomes.get_mut(&name).expect("known key");
                    outcome.state = RuleState::Failed;
                    outcome.duration = rule_start.elapsed();
                    fill_command_output_from_error(outcome, &e);
                    outcome.error = Some(e.to_string());
                    failed.push(name.clone());
                    if def.config.continue_on_failure() {
                        if let Ok(dependents) = graph::transitive_dependents(rules, &name) {
                            for dependent in dependents {
                                if upstream_failed.insert(dependent.clone()) {
                                    let outcome = outcomes.get_mut(&dependent).expect("known key");
                                    outcome.state = RuleState::Skipped;
                                    outcome.error = Some(UPSTREAM_FAILURE_REASON.to_string());
                                }
                            }
                        }
                    } else {
                        *aborted = true;
                    }
                }
            }
        }
    }

    async fn apply_parallel(
        rules: &BTreeMap<String, RuleDefinition>,
        ctx: &RuleContext<'_>,
        max_parallelism: Option<usize>,
        outcomes: &mut BTreeMap<String, RuleOutcome>,
        applied_order: &mut Vec<String>,
        failed: &mut Vec<String>,
        skipped: &mut Vec<String>,
        aborted: &mut bool,
    ) {
        let mut scheduler = match Scheduler::new(rules) {
            Ok(scheduler) => scheduler,
            Err(_) => return,
        };
        let max = max_parallelism.unwrap_or_else(|| num_cpus::get().min(4)).max(1);
        let mut ready = scheduler.initially_ready();
        let mut in_flight = FuturesUnordered::new();
        let mut upstream_failed: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

        loop {
            while !*aborted && in_flight.len() < max && !ready.is_empty() {
                let name = ready.remove(0);
                let def = &rules[&name];
                let rule = build_rule(&def.config);
                let name_owned = name.clone();
                in_flight.push(async move {
                    let start = Instant::now();
                    let result = rule.perform(ctx).await;
                    (name_owned, result, start.elapsed())
                });
                outcomes.get_mut(&name).expect("known key").state = RuleState::Running;
            }

            if in_flight.is_empty() {
                break;
            }

            if let Some((name, result, duration)) = in_flight.next().await {
                match result {
                    Ok(changes) => {
                        let outcome = outcomes.get_mut(&name).expect("known key");
                        outcome.state = RuleState::Applied;
                        outcome.duration = duration;
                        fill_command_output(outcome, &changes);
                        outcome.changes = changes;
                        applied_order.push(name.clone());
                        let mut newly_ready = scheduler.complete(&name);
                        newly_ready.retain(|n| !upstream_failed.contains(n));
                        ready.append(&mut newly_ready);
                        ready.sort();
                    }
                    Err(e) => {
                        let def = &rules[&name];
                        let outcome = outcomes.get_mut(&name).expect("known key");
                        outcome.state = RuleState::Failed;
                        outcome.duration = duration;
                        fill_command_output_from_error(outcome, &e);
                        outcome.error = Some(e.to_string());
                        failed.push(name.clone());
                        if def.config.continue_on_failure() {
                            if let Ok(dependents) = graph::transitive_dependents(rules, &name) {
                                for dependent in dependents {
                                    if upstream_failed.insert(dependent.clone()) {
                                        let outcome = outcomes.get_mut(&dependent).expect("known key");
                                        outcome.state = RuleState::Skipped;
                                        outcome.error = Some(UPSTREAM_FAILURE_REASON.to_string());
                                        skipped.push(dependent);
                                    }
                                }
                            }
                            let mut newly_ready = scheduler.complete(&name);
                            newly_ready.retain(|n| !upstream_failed.contains(n));
                            ready.append(&mut newly_ready);
                            ready.sort();
                        } else {
                            *aborted = true;
                        }
                    }
                }
            }
        }
    }

    fn rollback_all(
        rules: &BTreeMap<String, RuleDefinition>,
        ctx: &RuleContext<'_>,
        applied_order: &[String],
        outcomes: &mut BTreeMap<String, RuleOutcome>,
    ) {
        for name in applied_order.iter().rev() {
            let def = &rules[name];
            let rule = build_rule(&def.config);
            let changes = outcomes[name].changes.clone();
            match rule.rollback(ctx, &changes) {
                Ok(()) => {
                    outcomes.get_mut(name).expect("known key").state = RuleState::RolledBack;
                }
                Err(e) => {
                    tracing::warn!(rule = %name, error = %e, "rollback failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::FileCopier;
    use crate::detector::ProjectType;
    use crate::exec::CommandExecutor;
    use crate::rules::types::{CommandSpec, CopyFileSpec, RuleConfig, SetupCommandsConfig};
    use crate::template::VariableNamespace;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn namespace() -> VariableNamespace {
        VariableNamespace {
            session: json!({}),
            project: json!({}),
            git: json!({}),
            user: json!({}),
            environment: json!({}),
            timestamp: json!({}),
            custom: json!({}),
        }
    }

    #[tokio::test]
    async fn every_rule_ends_up_applied_failed_or_skipped() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");
        fs::write(source_dir.path().join("a.txt"), b"a").expect("write");

        let mut rules = BTreeMap::new();
        rules.insert(
            "copy_a".to_string(),
            RuleDefinition {
                name: "copy_a".to_string(),
                config: RuleConfig::CopyFiles {
                    files: vec![CopyFileSpec {
                        source: "a.txt".into(),
                        destination: None,
                        strategy: None,
                        permissions: None,
                        encrypt: false,
                        required: true,
                    }],
                },
                dependencies: vec![],
            },
        );

        let executor = CommandExecutor::new(session_dir.path().to_path_buf(), vec![]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");
        assert_eq!(result.applied.len() + result.failed.len() + result.skipped.len(), rules.len());
        assert!(result.success());
    }

    #[tokio::test]
    async fn failure_triggers_rollback_of_dependency() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");
        fs::write(source_dir.path().join("a.txt"), b"a").expect("write");

        let mut rules = BTreeMap::new();
        rules.insert(
            "a".to_string(),
            RuleDefinition {
                name: "a".to_string(),
                config: RuleConfig::CopyFiles {
                    files: vec![CopyFileSpec {
                        source: "a.txt".into(),
                        destination: None,
                        strategy: None,
                        permissions: None,
                        encrypt: false,
                        required: true,
                    }],
                },
                dependencies: vec![],
            },
        );
        rules.insert(
            "b".to_string(),
            RuleDefinition {
                name: "b".to_string(),
                config: RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![CommandSpec {
                        command: vec!["false".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: None,
                        working_directory: None,
                        required: true,
                    }],
                    continue_on_failure: false,
                }),
                dependencies: vec!["a".to_string()],
            },
        );

        let executor = CommandExecutor::new(session_dir.path().to_path_buf(), vec!["false".into()]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");
        assert!(!result.success());
        assert!(result.applied.is_empty());
        assert!(result.failed.contains(&"b".to_string()));
        assert!(!session_dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn parallel_apply_runs_independent_rules() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(source_dir.path().join(name), b"x").expect("write");
        }

        let mut rules = BTreeMap::new();
        for name in ["a", "b", "c"] {
            rules.insert(
                name.to_string(),
                RuleDefinition {
                    name: name.to_string(),
                    config: RuleConfig::CopyFiles {
                        files: vec![CopyFileSpec {
                            source: format!("{name}.txt"),
                            destination: None,
                            strategy: None,
                            permissions: None,
                            encrypt: false,
                            required: true,
                        }],
                    },
                    dependencies: vec![],
                },
            );
        }

        let executor = CommandExecutor::new(session_dir.path().to_path_buf(), vec![]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, true, Some(3)).await.expect("apply ok");
        assert_eq!(result.applied.len(), 3);
        assert_eq!(result.failed.len(), 0);
    }

    fn continue_on_failure_rules(source_dir: &std::path::Path) -> BTreeMap<String, RuleDefinition> {
        fs::write(source_dir.join("c.txt"), b"c").expect("write");
        let mut rules = BTreeMap::new();
        rules.insert(
            "a".to_string(),
            RuleDefinition {
                name: "a".to_string(),
                config: RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![CommandSpec {
                        command: vec!["false".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: None,
                        working_directory: None,
                        required: true,
                    }],
                    continue_on_failure: true,
                }),
                dependencies: vec![],
            },
        );
        rules.insert(
            "b".to_string(),
            RuleDefinition {
                name: "b".to_string(),
                config: RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![CommandSpec {
                        command: vec!["echo".into(), "hi".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: None,
                        working_directory: None,
                        required: true,
                    }],
                    continue_on_failure: false,
                }),
                dependencies: vec!["a".to_string()],
            },
        );
        rules.insert(
            "c".to_string(),
            RuleDefinition {
                name: "c".to_string(),
                config: RuleConfig::CopyFiles {
                    files: vec![CopyFileSpec {
                        source: "c.txt".into(),
                        destination: None,
                        strategy: None,
                        permissions: None,
                        encrypt: false,
                        required: true,
                    }],
                },
                dependencies: vec![],
            },
        );
        rules
    }

    #[tokio::test]
    async fn continue_on_failure_skips_only_downstream_dependents_serial() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");
        let rules = continue_on_failure_rules(source_dir.path());

        let executor =
            CommandExecutor::new(session_dir.path().to_path_buf(), vec!["false".into(), "echo".into()]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");
        assert!(result.failed.contains(&"a".to_string()));
        assert_eq!(result.rule_outcomes["a"].state, RuleState::Failed);
        assert_eq!(result.rule_outcomes["b"].state, RuleState::Skipped);
        assert_eq!(result.rule_outcomes["b"].error.as_deref(), Some("upstream failure"));
        assert!(!result.failed.contains(&"b".to_string()));
        assert!(result.applied.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn continue_on_failure_skips_only_downstream_dependents_parallel() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");
        let rules = continue_on_failure_rules(source_dir.path());

        let executor =
            CommandExecutor::new(session_dir.path().to_path_buf(), vec!["false".into(), "echo".into()]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, true, Some(2)).await.expect("apply ok");
        assert!(result.failed.contains(&"a".to_string()));
        assert_eq!(result.rule_outcomes["b"].state, RuleState::Skipped);
        assert_eq!(result.rule_outcomes["b"].error.as_deref(), Some("upstream failure"));
        assert!(result.applied.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn rule_outcome_carries_command_output_on_success_and_failure() {
        let source_dir = tempdir().expect("tempdir");
        let session_dir = tempdir().expect("tempdir");

        let mut rules = BTreeMap::new();
        rules.insert(
            "ok".to_string(),
            RuleDefinition {
                name: "ok".to_string(),
                config: RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![CommandSpec {
                        command: vec!["echo".into(), "hello".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: None,
                        working_directory: None,
                        required: true,
                    }],
                    continue_on_failure: false,
                }),
                dependencies: vec![],
            },
        );
        rules.insert(
            "broken".to_string(),
            RuleDefinition {
                name: "broken".to_string(),
                config: RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![CommandSpec {
                        command: vec!["false".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: None,
                        working_directory: None,
                        required: true,
                    }],
                    continue_on_failure: true,
                }),
                dependencies: vec![],
            },
        );

        let executor =
            CommandExecutor::new(session_dir.path().to_path_buf(), vec!["echo".into(), "false".into()]);
        let copier = FileCopier::new();
        let ns = namespace();
        let ctx = RuleContext {
            session_root: session_dir.path(),
            source_root: source_dir.path(),
            executor: &executor,
            copier: &copier,
            master_key: None,
            session_salt: vec![],
            namespace: &ns,
            project_type: ProjectType::Unknown,
        };

        let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");

        let ok_outcome = &result.rule_outcomes["ok"];
        assert_eq!(ok_outcome.state, RuleState::Applied);
        assert_eq!(String::from_utf8_lossy(ok_outcome.stdout.as_ref().expect("stdout set")).trim(), "hello");
        assert_eq!(ok_outcome.exit_code, Some(0));

        let broken_outcome = &result.rule_outcomes["broken"];
        assert_eq!(broken_outcome.state, RuleState::Failed);
        assert!(broken_outcome.stdout.is_some());
        assert_eq!(broken_outcome.exit_code, Some(1));
    }
}
