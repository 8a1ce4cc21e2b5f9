//! Safe template rendering: field lookups, conditionals, iteration, and a
//! whitelisted filter set. No arbitrary code, no file reads, no network —
//! minijinja's expression language is already a safe subset of full Jinja,
//! and we additionally strip down to the filters the rule schema allows.

pub mod variables;

use minijinja::value::{Value as MiniValue, ValueKind};
use minijinja::{Environment, UndefinedBehavior};

use crate::error::{Error, Result};
pub use variables::{VariableNamespace, VariableNamespaceBuilder};

const ALLOWED_FILTERS: &[&str] = &["upcase", "downcase", "default", "date", "json", "escape"];

/// `Environment::empty()` registers none of minijinja's built-in filters, so
/// the filter set actually callable from a template is exactly `ALLOWED_FILTERS`.
fn build_environment() -> Environment<'static> {
    let mut env = Environment::empty();
    // Unknown top-level names evaluate to empty rather than raising.
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_filter("upcase", |s: String| s.to_uppercase());
    env.add_filter("downcase", |s: String| s.to_lowercase());
    env.add_filter("default", |v: MiniValue, fallback: MiniValue| -> MiniValue {
        match v.kind() {
            ValueKind::Undefined | ValueKind::None => fallback,
            _ => v,
        }
    });
    env.add_filter("json", |v: MiniValue| -> Result<String, minijinja::Error> {
        serde_json::to_string(&v)
            .map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))
    });
    env.add_filter("escape", |s: String| -> String {
        s.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
            .replace('"', "&quot;")
            .replace('\'', "&#39;")
    });
    env.add_filter("date", |s: String, fmt: String| -> String {
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.format(&fmt).to_string())
            .unwrap_or(s)
    });
    env
}

/// `render(template_text, variable_namespace) -> rendered_text`. Pure: identical
/// inputs always produce identical output.
pub fn render(template_text: &str, namespace: &VariableNamespace) -> Result<String> {
    let env = build_environment();
    let template = env.template_from_str(template_text).map_err(|e| Error::TemplateSyntax {
        message: e.to_string(),
    })?;
    let value = MiniValue::from_serializable(namespace);
    template.render(value).map_err(|e| Error::TemplateRender {
        message: e.to_string(),
    })
}

/// Validate a template's syntax without rendering it, used to fail fast before
/// any I/O, per the template-processor contract.
pub fn validate_syntax(template_text: &str) -> Result<()> {
    let env = build_environment();
    env.template_from_str(template_text)
        .map(|_| ())
        .map_err(|e| Error::TemplateSyntax { message: e.to_string() })
}

#[must_use]
pub fn allowed_filters() -> &'static [&'static str] {
    ALLOWED_FILTERS
}
