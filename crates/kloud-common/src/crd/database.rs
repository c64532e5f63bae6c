//! MongoDB Database: a scoped database user inside a MongoDB managed service

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{MsvcRef, ResourceStatus};

/// A database and its owning user
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mongodb.msvc.kloud.dev",
    version = "v1",
    kind = "Database",
    plural = "databases",
    shortname = "mdb",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.msvcRef.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// MongoDB managed service hosting the database
    pub msvc_ref: MsvcRef,

    /// Database name, defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
}

impl Database {
    /// Effective database name
    pub fn database_name(&self) -> String {
        self.spec
            .database_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }
}
