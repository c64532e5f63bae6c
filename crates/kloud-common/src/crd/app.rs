//! App: a long-running workload

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceStatus;

/// Default container port
pub const DEFAULT_APP_PORT: i32 = 80;

/// Job run to completion before each new generation is rolled out
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreDeployJob {
    /// Image, defaults to the app image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Command to run
    #[serde(default)]
    pub command: Vec<String>,
}

/// A Deployment rendered from a small spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crds.kloud.dev",
    version = "v1",
    kind = "App",
    plural = "apps",
    shortname = "app",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Container image
    pub image: String,

    /// Replica count, 1 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Container arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Plain environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Job gating every rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_deploy_job: Option<PreDeployJob>,
}

impl AppSpec {
    /// Effective replica count
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Effective container port
    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_APP_PORT)
    }
}
