//! Common types for kloud: the reconciliation engine's building blocks, CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod apply;
pub mod condition;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod job_tracker;
pub mod kind_registry;
pub mod kube_utils;
pub mod metrics;
pub mod notifier;
pub mod reconcile;
pub mod retry;
pub mod telemetry;
pub mod template;
pub mod watch_graph;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label stamped on every object a kloud controller creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kloud";

/// Label naming the owning Project (on the Project and its Namespace)
pub const PROJECT_NAME_LABEL: &str = "kloud.dev/project.name";

/// Label naming the owning App (on the App, its Deployment, pods and jobs)
pub const APP_NAME_LABEL: &str = "kloud.dev/app.name";

/// Label naming the owning Router
pub const ROUTER_NAME_LABEL: &str = "kloud.dev/router.name";

/// Label naming the owning ManagedService
pub const MSVC_NAME_LABEL: &str = "kloud.dev/msvc.name";

/// Label naming the owning ManagedResource
pub const MRES_NAME_LABEL: &str = "kloud.dev/mres.name";

/// Label holding the owner generation a child was created for
pub const GENERATION_LABEL: &str = "kloud.dev/generation";
