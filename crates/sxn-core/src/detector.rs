//! Project type detection: a non-recursive scan for signature files, used to
//! seed a session's rule set with sensible defaults before user overrides.

use std::path::Path;

use serde_json::Value;

use crate::rules::types::{CommandSpec, CopyFileSpec, RuleConfig, SetupCommandsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProjectType {
    Rails,
    Ruby,
    NextJs,
    React,
    TypeScript,
    JavaScript,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PackageManager {
    Bundler,
    Npm,
    Yarn,
    Pnpm,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub project_type: ProjectType,
    pub framework: Option<String>,
    pub package_manager: Option<PackageManager>,
    pub markers: Vec<String>,
}

fn exists(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

fn has_glob_suffix(dir: &Path, suffix: &str) -> bool {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
}

fn read_package_json(dir: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Inspect `dir` non-recursively for a fixed set of signature files.
#[must_use]
pub fn detect(dir: &Path) -> Detection {
    let mut markers = Vec::new();

    let has_gemfile = exists(dir, "Gemfile");
    let has_rails_app = exists(dir, "config/application.rb");
    let has_gemspec = has_glob_suffix(dir, ".gemspec");

    if has_gemfile {
        markers.push("Gemfile".to_string());
    }
    if has_rails_app {
        markers.push("config/application.rb".to_string());
    }

    if has_gemfile && has_rails_app {
        return Detection {
            project_type: ProjectType::Rails,
            framework: Some("rails".to_string()),
            package_manager: exists(dir, "Gemfile.lock").then_some(PackageManager::Bundler),
            markers,
        };
    }

    if has_gemfile || has_gemspec {
        return Detection {
            project_type: ProjectType::Ruby,
            framework: None,
            package_manager: exists(dir, "Gemfile.lock").then_some(PackageManager::Bundler),
            markers,
        };
    }

    if let Some(package_json) = read_package_json(dir) {
        markers.push("package.json".to_string());
        let deps = package_json.get("dependencies").cloned().unwrap_or(Value::Null);
        let has_dep = |name: &str| deps.get(name).is_some();

        let package_manager = if exists(dir, "pnpm-lock.yaml") {
            Some(PackageManager::Pnpm)
        } else if exists(dir, "yarn.lock") {
            Some(PackageManager::Yarn)
        } else if exists(dir, "package-lock.json") {
            Some(PackageManager::Npm)
        } else {
            None
        };

        let project_type = if has_dep("next") {
            ProjectType::NextJs
        } else if has_dep("react") {
            ProjectType::React
        } else if exists(dir, "tsconfig.json") {
            ProjectType::TypeScript
        } else {
            ProjectType::JavaScript
        };

        return Detection {
            project_type,
            framework: (project_type == ProjectType::NextJs).then(|| "next".to_string()),
            package_manager,
            markers,
        };
    }

    Detection {
        project_type: ProjectType::Unknown,
        framework: None,
        package_manager: None,
        markers,
    }
}

/// Default rule set for a detected project type. Callers merge this with
/// user-declared rules; user rules of the same name win.
#[must_use]
pub fn suggest_default_rules(project_type: ProjectType) -> Vec<(String, RuleConfig)> {
    match project_type {
        ProjectType::Rails => vec![
            (
                "copy_secrets".to_string(),
                RuleConfig::CopyFiles {
                    files: vec![
                        CopyFileSpec {
                            source: "config/master.key".into(),
                            destination: None,
                            strategy: None,
                            permissions: None,
                            encrypt: false,
                            required: true,
                        },
                        CopyFileSpec {
                            source: "config/credentials/*.key".into(),
                            destination: None,
                            strategy: None,
                            permissions: None,
                            encrypt: false,
                            required: false,
                        },
                        CopyFileSpec {
                            source: ".env".into(),
                            destination: None,
                            strategy: None,
                            permissions: None,
                            encrypt: false,
                            required: false,
                        },
                    ],
                },
            ),
            (
                "setup_rails".to_string(),
                RuleConfig::SetupCommands(SetupCommandsConfig {
                    commands: vec![
                        CommandSpec {
                            command: vec!["bundle".into(), "install".into()],
                            env: Default::default(),
                            timeout: None,
                            condition: None,
                            working_directory: None,
                            required: true,
                        },
                        CommandSpec {
                            command: vec!["bin/rails".into(), "db:create".into()],
                            env: Default::default(),
                            timeout: None,
                            condition: Some("db_not_exists".to_string()),
                            working_directory: None,
                            required: true,
                        },
                        CommandSpec {
                            command: vec!["bin/rails".into(), "db:migrate".into()],
                            env: Default::default(),
                            timeout: None,
                            condition: None,
                            working_directory: None,
                            required: true,
                        },
                    ],
                    continue_on_failure: false,
                }),
            ),
        ],
        _ => Vec::new(),
    }
}
