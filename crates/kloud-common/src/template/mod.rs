//! Go-template-style rendering of child manifests
//!
//! Templates use `{{ .Path.To.Value }}` placeholders so manifests read the
//! way cluster operators are used to. Control flow uses minijinja blocks:
//!
//! ```text
//! {% if .Spec.Https %}
//! tls:
//!   - hosts: {{ .Spec.Domains | tojson }}
//! {% endif %}
//! ```
//!
//! Filters: `b64enc`, `b64dec`, `quote`, `required`, plus the minijinja
//! builtins (`default`, `tojson`, `indent`, `lower`, `upper`, ...).

mod engine;
mod error;
mod filters;

pub use engine::TemplateEngine;
pub use error::TemplateError;
