//! End-to-end scenarios exercising the Rules Engine and Session Store
//! together, without the git-worktree step the Orchestrator adds on top.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use serde_json::json;
use sxn_core::detector::ProjectType;
use sxn_core::rules::engine::RulesEngine;
use sxn_core::rules::types::{
    CommandSpec, CopyFileSpec, RuleConfig, RuleDefinition, SetupCommandsConfig,
};
use sxn_core::rules::RuleContext;
use sxn_core::store::session::CreateSessionInput;
use sxn_core::store::SessionStore;
use sxn_core::template::VariableNamespace;
use sxn_core::{copier::FileCopier, exec::CommandExecutor};
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
async fn rails_defaults_copy_master_key_with_secret_mode() {
    let project_dir = tempdir().expect("tempdir");
    let session_dir = tempdir().expect("tempdir");
    fs::write(project_dir.path().join("Gemfile"), "").expect("write");
    fs::create_dir_all(project_dir.path().join("config")).expect("mkdir");
    fs::write(project_dir.path().join("config/application.rb"), "").expect("write");
    fs::write(project_dir.path().join("config/master.key"), b"topsecret").expect("write");

    let detection = sxn_core::detector::detect(project_dir.path());
    assert_eq!(detection.project_type, ProjectType::Rails);

    let mut rules = BTreeMap::new();
    for (name, config) in sxn_core::detector::suggest_default_rules(detection.project_type) {
        rules.insert(name.clone(), RuleDefinition { name, config, dependencies: vec![] });
    }

    let executor = CommandExecutor::new(session_dir.path().to_path_buf(), vec!["bundle".into(), "bin/rails".into()]);
    let copier = FileCopier::new();
    let ns = namespace();
    let ctx = RuleContext {
        session_root: session_dir.path(),
        source_root: project_dir.path(),
        executor: &executor,
        copier: &copier,
        master_key: None,
        session_salt: b"salt".to_vec(),
        namespace: &ns,
        project_type: detection.project_type,
    };

    let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");
    assert!(result.applied.contains(&"copy_secrets".to_string()));

    let copied = session_dir.path().join("config/master.key");
    assert!(copied.exists());
    let mode = fs::metadata(&copied).expect("metadata").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[tokio::test]
async fn parallel_independent_copies_finish_faster_than_serial_sum() {
    let source_dir = tempdir().expect("tempdir");
    let session_dir = tempdir().expect("tempdir");
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(source_dir.path().join(name), vec![0_u8; 1024]).expect("write");
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
    for name in ["a.txt", "b.txt", "c.txt"] {
        assert!(session_dir.path().join(name).exists());
    }
}

#[tokio::test]
async fn setup_command_failure_rolls_back_its_dependency() {
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
async fn conditional_commands_run_only_when_their_condition_holds() {
    let session_dir = tempdir().expect("tempdir");
    fs::write(session_dir.path().join("Gemfile.lock"), b"").expect("write");

    let mut rules = BTreeMap::new();
    rules.insert(
        "setup".to_string(),
        RuleDefinition {
            name: "setup".to_string(),
            config: RuleConfig::SetupCommands(SetupCommandsConfig {
                commands: vec![
                    CommandSpec {
                        command: vec!["echo".into(), "first".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: Some("file_exists:Gemfile.lock".into()),
                        working_directory: None,
                        required: true,
                    },
                    CommandSpec {
                        command: vec!["echo".into(), "second".into()],
                        env: Default::default(),
                        timeout: None,
                        condition: Some("file_missing:Gemfile.lock".into()),
                        working_directory: None,
                        required: true,
                    },
                ],
                continue_on_failure: false,
            }),
            dependencies: vec![],
        },
    );

    let executor = CommandExecutor::new(session_dir.path().to_path_buf(), vec!["echo".into()]);
    let copier = FileCopier::new();
    let ns = namespace();
    let ctx = RuleContext {
        session_root: session_dir.path(),
        source_root: session_dir.path(),
        executor: &executor,
        copier: &copier,
        master_key: None,
        session_salt: vec![],
        namespace: &ns,
        project_type: ProjectType::Unknown,
    };

    let result = RulesEngine::apply(&rules, &ctx, false, None).await.expect("apply ok");
    assert!(result.success());
    let outcome = &result.rule_outcomes["setup"];
    assert_eq!(outcome.changes.len(), 1);
}

#[tokio::test]
async fn optimistic_lock_conflict_only_one_writer_wins() {
    let store = SessionStore::open_in_memory().await.expect("open in-memory store");
    let id = store
        .create(CreateSessionInput { name: "racer".into(), ..Default::default() })
        .await
        .expect("create ok");
    let v1 = store
        .get(&id)
        .await
        .expect("get ok")
        .updated_at
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    let changes_a = sxn_core::store::session::SessionChanges {
        description: Some(Some("writer-a".into())),
        ..Default::default()
    };
    let changes_b = sxn_core::store::session::SessionChanges {
        description: Some(Some("writer-b".into())),
        ..Default::default()
    };

    let a = store.update(&id, &changes_a, Some(&v1)).await;
    let b = store.update(&id, &changes_b, Some(&v1)).await;

    assert!(a.is_ok() ^ b.is_ok());
    let current = store.get(&id).await.expect("get ok");
    assert_ne!(current.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true), v1);
}

#[tokio::test]
async fn migration_from_pre_v2_schema_synthesizes_version_one() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect("sqlite::memory:")
        .await
        .expect("connect");

    sqlx::query(
        "CREATE TABLE sessions (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE,
            created_at TEXT,
            updated_at TEXT,
            status TEXT,
            linear_task TEXT,
            description TEXT,
            tags TEXT
        )",
    )
    .execute(&pool)
    .await
    .expect("create legacy table");

    sqlx::query(
        "INSERT INTO sessions (id, name, created_at, updated_at, status, tags) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind("a".repeat(32))
    .bind("legacy")
    .bind("2025-01-01T00:00:00Z")
    .bind("2025-01-01T00:00:00Z")
    .bind("active")
    .bind("[]")
    .execute(&pool)
    .await
    .expect("insert legacy row");

    sxn_core::store::schema::migrate(&pool).await.expect("migrate ok");

    let version: (i64,) = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_one(&pool)
        .await
        .expect("read version");
    assert!(version.0 >= 2);

    let worktrees: (String,) = sqlx::query_as("SELECT worktrees FROM sessions WHERE name = 'legacy'")
        .fetch_one(&pool)
        .await
        .expect("read worktrees");
    assert_eq!(worktrees.0, "{}");
}
