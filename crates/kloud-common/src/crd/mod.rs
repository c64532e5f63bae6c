//! Custom Resource Definitions for kloud
//!
//! All resources share [`ResourceStatus`] and implement [`ManagedObject`],
//! which is what the generic controller loop works against.

mod app;
mod database;
mod managed;
mod project;
mod router;
mod status;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use app::{App, AppSpec, PreDeployJob, DEFAULT_APP_PORT};
pub use database::{Database, DatabaseSpec};
pub use managed::{
    ManagedResource, ManagedResourceSpec, ManagedService, ManagedServiceSpec, MsvcRef,
    ResourceTemplate,
};
pub use project::{Project, ProjectSpec};
pub use router::{Route, Router, RouterSpec};
pub use status::{ManagedObject, ResourceStatus};

use status::managed_object;

/// apiVersion of the core kloud resources
pub const API_VERSION: &str = "crds.kloud.dev/v1";

/// apiVersion of the MongoDB service resources
pub const MONGODB_API_VERSION: &str = "mongodb.msvc.kloud.dev/v1";

managed_object!(App, Database, ManagedResource, ManagedService, Project, Router);

/// Every CRD the operator installs
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Project::crd(),
        App::crd(),
        Router::crd(),
        ManagedService::crd(),
        ManagedResource::crd(),
        Database::crd(),
    ]
}
