//! Template engine with Go-template-style placeholders
//!
//! Uses minijinja with strict undefined handling. Leading dots on value
//! paths (`.Spec.Image`) are stripped before rendering, so `{{ .Spec.Image }}`
//! and `{{ Spec.Image }}` are equivalent.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use super::error::TemplateError;
use super::filters;

/// Template engine for child manifests
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        env.add_filter("b64enc", filters::b64enc);
        env.add_filter("b64dec", filters::b64dec);
        env.add_filter("quote", filters::quote);
        env.add_filter("required", filters::required);

        Self { env }
    }

    /// Render a template with the given values
    ///
    /// `values` must serialize to a map; its keys become the top-level names
    /// (`.Name`, `.Spec`, ...).
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if the syntax is invalid, a referenced value is
    /// undefined, or a filter fails.
    pub fn render<S: Serialize>(&self, template: &str, values: &S) -> Result<String, TemplateError> {
        let ctx = serde_json::to_value(values).map_err(|e| TemplateError::Context(e.to_string()))?;
        if !ctx.is_object() {
            return Err(TemplateError::Context(
                "template values must serialize to an object".to_string(),
            ));
        }
        let normalized = normalize_go_paths(template);
        Ok(self
            .env
            .render_str(&normalized, minijinja::Value::from_serialize(&ctx))?)
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{") || s.contains("{%")
    }
}

/// Strip the leading dot of value paths inside `{{ }}` and `{% %}` tags.
fn normalize_go_paths(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    loop {
        let next = [remaining.find("{{"), remaining.find("{%")]
            .into_iter()
            .flatten()
            .min();
        let Some(start) = next else {
            break;
        };
        let close = if remaining[start..].starts_with("{{") {
            "}}"
        } else {
            "%}"
        };

        result.push_str(&remaining[..start + 2]);
        remaining = &remaining[start + 2..];

        match remaining.find(close) {
            Some(end) => {
                result.push_str(&strip_path_dots(&remaining[..end]));
                result.push_str(close);
                remaining = &remaining[end + 2..];
            }
            None => {
                result.push_str(remaining);
                remaining = "";
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Remove a `.` that starts a value path, leaving member access, numbers
/// and quoted strings alone.
fn strip_path_dots(expr: &str) -> String {
    let mut result = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                result.push(ch);
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                result.push(ch);
            }
            '.' if !in_single_quote && !in_double_quote => {
                let continues_path = result
                    .chars()
                    .last()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == ')' || c == ']');
                let starts_ident = chars
                    .peek()
                    .is_some_and(|c| c.is_alphabetic() || *c == '_');
                if continues_path || !starts_ident {
                    result.push('.');
                }
            }
            _ => result.push(ch),
        }
    }

    result
}
