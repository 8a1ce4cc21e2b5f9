//! `template` rule: render a source template file against the variable
//! namespace and write it to a destination inside the session.

use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::path_validator::PathValidator;
use crate::template;

use super::types::{AppliedChange, TemplateConfig};
use super::{RuleContext, RuleImpl};

pub struct TemplateRule {
    config: TemplateConfig,
}

impl TemplateRule {
    #[must_use]
    pub fn new(config: TemplateConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl RuleImpl for TemplateRule {
    fn validate(&self) -> Result<()> {
        for spec in &self.config.templates {
            if spec.source.trim().is_empty() || spec.destination.trim().is_empty() {
                return Err(Error::Validation {
                    message: "template entry requires both source and destination".into(),
                });
            }
        }
        Ok(())
    }

    async fn perform(&self, ctx: &RuleContext<'_>) -> Result<Vec<AppliedChange>> {
        let validator = PathValidator::default();
        let mut changes = Vec::new();

        for spec in &self.config.templates {
            let source_path = validator.validate(ctx.source_root, Path::new(&spec.source))?;
            if !source_path.exists() {
                if spec.required {
                    return Err(Error::TemplateMissing { path: source_path });
                }
                continue;
            }

            let destination_path = validator.validate(ctx.session_root, Path::new(&spec.destination))?;
            if destination_path.exists() && !spec.overwrite {
                continue;
            }

            let text = fs::read_to_string(&source_path).map_err(Error::Io)?;

            let mut namespace = ctx.namespace.clone();
            if !spec.variables.is_empty() {
                let mut custom = namespace.custom.as_object().cloned().unwrap_or_default();
                for (k, v) in &spec.variables {
                    custom.insert(k.clone(), v.clone());
                }
                namespace.custom = Value::Object(custom);
            }

            let rendered = template::render(&text, &namespace)?;

            let prior_content = destination_path.exists().then(|| fs::read(&destination_path)).transpose().map_err(Error::Io)?;

            if let Some(parent) = destination_path.parent() {
                fs::create_dir_all(parent).map_err(Error::Io)?;
            }
            fs::write(&destination_path, rendered).map_err(Error::Io)?;

            changes.push(AppliedChange::TemplateWrite {
                destination: destination_path,
                prior_content,
            });
        }

        Ok(changes)
    }

    fn rollback(&self, _ctx: &RuleContext<'_>, changes: &[AppliedChange]) -> Result<()> {
        for change in changes.iter().rev() {
            if let AppliedChange::TemplateWrite { destination, prior_content } = change {
                match prior_content {
                    Some(content) => fs::write(destination, content).map_err(Error::Io)?,
                    None => {
                        if destination.exists() {
                            fs::remove_file(destination).map_err(Error::Io)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
