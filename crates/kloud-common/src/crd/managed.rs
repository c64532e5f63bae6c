//! ManagedService and ManagedResource: backing services and what is provisioned inside them

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ResourceStatus;

/// Template for a child object of an arbitrary kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    /// apiVersion of the child
    pub api_version: String,
    /// Kind of the child
    pub kind: String,
    /// Spec of the child
    #[serde(default)]
    pub spec: BTreeMap<String, Value>,
}

impl ResourceTemplate {
    /// Render the child manifest named `name` in `namespace`
    pub fn manifest(&self, name: &str, namespace: &str) -> Value {
        json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "metadata": {"name": name, "namespace": namespace},
            "spec": self.spec,
        })
    }
}

/// Reference to a ManagedService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MsvcRef {
    /// ManagedService name
    pub name: String,
    /// ManagedService namespace, the referrer's namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl MsvcRef {
    /// Namespace of the referenced service, falling back to `default_ns`
    pub fn namespace_or<'a>(&'a self, default_ns: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_ns)
    }
}

/// A backing service (database, cache) provisioned from a template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crds.kloud.dev",
    version = "v1",
    kind = "ManagedService",
    plural = "managedservices",
    shortname = "msvc",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.serviceTemplate.kind"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServiceSpec {
    /// The backing service object
    pub service_template: ResourceTemplate,
}

/// Something provisioned inside a ManagedService (a database, a user)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crds.kloud.dev",
    version = "v1",
    kind = "ManagedResource",
    plural = "managedresources",
    shortname = "mres",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.msvcRef.name"}"#,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.resourceTemplate.kind"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// The owning service
    pub msvc_ref: MsvcRef,
    /// The object to provision
    pub resource_template: ResourceTemplate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_a_full_manifest() {
        let template = ResourceTemplate {
            api_version: "mongodb.msvc.kloud.dev/v1".into(),
            kind: "Database".into(),
            spec: BTreeMap::from([("databaseName".to_string(), json!("orders"))]),
        };
        let manifest = template.manifest("orders-db", "acme");
        assert_eq!(manifest["kind"], "Database");
        assert_eq!(manifest["metadata"]["namespace"], "acme");
        assert_eq!(manifest["spec"]["databaseName"], "orders");
    }

    #[test]
    fn msvc_ref_defaults_to_referrer_namespace() {
        let r = MsvcRef {
            name: "mongo".into(),
            namespace: None,
        };
        assert_eq!(r.namespace_or("acme"), "acme");
    }
}
