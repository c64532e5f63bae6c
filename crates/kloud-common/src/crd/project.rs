//! Project: a tenant namespace

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceStatus;

/// A project owns exactly one namespace
///
/// Cluster-scoped. The namespace is named after the project unless
/// `targetNamespace` says otherwise.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crds.kloud.dev",
    version = "v1",
    kind = "Project",
    plural = "projects",
    shortname = "proj",
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.displayVars.namespace"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Namespace to create, defaults to the project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Human-friendly name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Project {
    /// Namespace this project should own
    pub fn namespace_name(&self) -> String {
        self.spec
            .target_namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_defaults_to_project_name() {
        let project = Project::new("acme", ProjectSpec::default());
        assert_eq!(project.namespace_name(), "acme");

        let project = Project::new(
            "acme",
            ProjectSpec {
                target_namespace: Some("acme-prod".into()),
                display_name: None,
            },
        );
        assert_eq!(project.namespace_name(), "acme-prod");
    }
}
