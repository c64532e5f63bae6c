//! Kind -> schema registry for unstructured child objects
//!
//! Controllers that apply arbitrary kinds (a ManagedService's backing store,
//! a ManagedResource's provisioned resource) read child status through this
//! registry instead of hardcoded structs. A schema names the REST mapping
//! and where the kind keeps its conditions, so conditions can be lifted off
//! any CRD by JSON pointer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::api::GroupVersionKind;
use kube::discovery::{ApiResource, Scope};
use kube::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::condition::{Condition, ConditionStatus};
use crate::kube_utils::{build_api_resource, parse_api_version};
use crate::Error;

/// Default location of conditions on custom resources
pub const DEFAULT_CONDITIONS_PATH: &str = "/status/conditions";

/// How a kind signals that it is ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadySignal {
    /// A condition of this type is `True`
    Condition(String),
    /// A boolean field at this JSON pointer is `true`
    Flag(String),
    /// `status.readyReplicas` has caught up with `spec.replicas`
    ReplicasReady,
    /// The object existing is enough
    Exists,
}

/// REST mapping plus status layout for one kind
#[derive(Clone, Debug)]
pub struct KindSchema {
    /// Resolved REST mapping
    pub api_resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
    /// JSON pointer to the conditions array
    pub conditions_path: String,
    /// Readiness signal
    pub ready: ReadySignal,
}

impl KindSchema {
    /// Schema for a namespaced kind with conditions at the default path
    pub fn namespaced(api_version: &str, kind: &str, ready: ReadySignal) -> Self {
        Self {
            api_resource: build_api_resource(api_version, kind),
            namespaced: true,
            conditions_path: DEFAULT_CONDITIONS_PATH.to_string(),
            ready,
        }
    }

    /// Lift conditions off an object of this kind, prefixed with the kind name
    pub fn conditions(&self, obj: &Value) -> Vec<Condition> {
        crate::condition::with_prefix(
            &self.api_resource.kind,
            extract_conditions(obj, &self.conditions_path),
        )
    }

    /// Whether an object of this kind reports ready
    pub fn is_ready(&self, obj: &Value) -> bool {
        match &self.ready {
            ReadySignal::Condition(type_) => extract_conditions(obj, &self.conditions_path)
                .iter()
                .any(|c| &c.type_ == type_ && c.is_true()),
            ReadySignal::Flag(pointer) => obj
                .pointer(pointer)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ReadySignal::ReplicasReady => {
                let wanted = obj
                    .pointer("/spec/replicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                let ready = obj
                    .pointer("/status/readyReplicas")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                ready >= wanted
            }
            ReadySignal::Exists => true,
        }
    }

    /// The condition type reported for this kind's readiness after prefixing
    pub fn ready_condition_type(&self) -> String {
        format!("{}Ready", self.api_resource.kind)
    }
}

/// Read a Kubernetes-style conditions array at `pointer`
///
/// Entries without a `type` are skipped. Missing arrays yield no conditions.
pub fn extract_conditions(obj: &Value, pointer: &str) -> Vec<Condition> {
    let Some(items) = obj.pointer(pointer).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let type_ = item.get("type")?.as_str()?;
            let text = |key: &str| {
                item.get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            Some(Condition {
                type_: type_.to_string(),
                status: ConditionStatus::parse(&text("status")),
                reason: text("reason"),
                message: text("message"),
                last_transition_time: item
                    .get("lastTransitionTime")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
                observed_generation: item.get("observedGeneration").and_then(Value::as_i64),
            })
        })
        .collect()
}

fn key(group: &str, kind: &str) -> (String, String) {
    (group.to_string(), kind.to_string())
}

/// Cache of kind schemas, keyed by (group, kind)
///
/// Built once in the composition root and shared via `Arc<KindRegistry>`.
/// Kinds missing from the cache are resolved through API discovery on first
/// use and cached afterwards.
pub struct KindRegistry {
    client: Option<Client>,
    entries: DashMap<(String, String), KindSchema>,
}

impl KindRegistry {
    /// Registry with the built-in schemas and discovery for everything else
    pub fn new(client: Client) -> Self {
        let registry = Self::with_builtins();
        Self {
            client: Some(client),
            entries: registry.entries,
        }
    }

    /// Registry with only the built-in schemas and no discovery
    pub fn with_builtins() -> Self {
        let entries = DashMap::new();
        for schema in builtin_schemas() {
            entries.insert(
                key(&schema.api_resource.group, &schema.api_resource.kind),
                schema,
            );
        }
        Self {
            client: None,
            entries,
        }
    }

    /// Add or replace a schema
    pub fn register(&self, schema: KindSchema) {
        self.entries.insert(
            key(&schema.api_resource.group, &schema.api_resource.kind),
            schema,
        );
    }

    /// Cached schema, if any
    pub fn get(&self, api_version: &str, kind: &str) -> Option<KindSchema> {
        let (group, _) = parse_api_version(api_version);
        self.entries.get(&key(&group, kind)).map(|s| s.clone())
    }

    /// Resolve a schema, running discovery for unknown kinds
    ///
    /// Discovered kinds get the default conditions path and a `Ready`
    /// condition as their readiness signal.
    pub async fn resolve(&self, api_version: &str, kind: &str) -> Result<KindSchema, Error> {
        if let Some(schema) = self.get(api_version, kind) {
            return Ok(schema);
        }

        let Some(client) = &self.client else {
            return Err(Error::internal_with_context(
                "kind-registry",
                format!("no schema registered for {api_version}/{kind}"),
            ));
        };

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        info!(api_version, kind, "Resolving unknown kind through API discovery");
        let (api_resource, caps) = kube::discovery::pinned_kind(client, &gvk)
            .await
            .map_err(|e| {
                warn!(api_version, kind, error = %e, "Kind discovery failed");
                Error::from(e)
            })?;

        let schema = KindSchema {
            api_resource,
            namespaced: caps.scope == Scope::Namespaced,
            conditions_path: DEFAULT_CONDITIONS_PATH.to_string(),
            ready: ReadySignal::Condition("Ready".to_string()),
        };
        self.register(schema.clone());
        Ok(schema)
    }
}

fn builtin_schemas() -> Vec<KindSchema> {
    let own = |kind: &str| {
        KindSchema::namespaced(
            crate::crd::API_VERSION,
            kind,
            ReadySignal::Flag("/status/isReady".to_string()),
        )
    };
    vec![
        KindSchema::namespaced(
            "apps/v1",
            "Deployment",
            ReadySignal::Condition("Available".to_string()),
        ),
        KindSchema::namespaced("apps/v1", "StatefulSet", ReadySignal::ReplicasReady),
        KindSchema::namespaced("networking.k8s.io/v1", "Ingress", ReadySignal::Exists),
        KindSchema::namespaced(
            "batch/v1",
            "Job",
            ReadySignal::Condition("Complete".to_string()),
        ),
        own("App"),
        own("Router"),
        own("ManagedService"),
        own("ManagedResource"),
        KindSchema::namespaced(
            crate::crd::MONGODB_API_VERSION,
            "Database",
            ReadySignal::Flag("/status/isReady".to_string()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(available: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "status": {
                "conditions": [
                    {"type": "Available", "status": available, "reason": "MinimumReplicasAvailable",
                     "lastTransitionTime": "2026-01-02T03:04:05Z"},
                    {"type": "Progressing", "status": "True"},
                    {"status": "True"}
                ]
            }
        })
    }

    #[test]
    fn extracts_conditions_by_pointer() {
        let conds = extract_conditions(&deployment("True"), DEFAULT_CONDITIONS_PATH);
        assert_eq!(conds.len(), 2);
        assert_eq!(conds[0].type_, "Available");
        assert!(conds[0].is_true());
        assert!(conds[0].last_transition_time.is_some());
        assert_eq!(conds[1].reason, "");
    }

    #[test]
    fn missing_conditions_array_is_empty() {
        assert!(extract_conditions(&json!({"status": {}}), DEFAULT_CONDITIONS_PATH).is_empty());
    }

    #[test]
    fn builtin_deployment_schema_prefixes_and_reads_readiness() {
        let registry = KindRegistry::with_builtins();
        let schema = registry.get("apps/v1", "Deployment").unwrap();

        let conds = schema.conditions(&deployment("True"));
        assert_eq!(conds[0].type_, "DeploymentAvailable");
        assert!(schema.is_ready(&deployment("True")));
        assert!(!schema.is_ready(&deployment("False")));
    }

    #[test]
    fn replica_and_flag_signals() {
        let registry = KindRegistry::with_builtins();
        let sts = registry.get("apps/v1", "StatefulSet").unwrap();
        assert!(sts.is_ready(&json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 2}})));
        assert!(!sts.is_ready(&json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 1}})));

        let db = registry
            .get(crate::crd::MONGODB_API_VERSION, "Database")
            .unwrap();
        assert!(db.is_ready(&json!({"status": {"isReady": true}})));
        assert!(!db.is_ready(&json!({})));
    }

    #[tokio::test]
    async fn unknown_kind_without_discovery_is_an_error() {
        let registry = KindRegistry::with_builtins();
        let err = registry.resolve("example.com/v1", "Widget").await.unwrap_err();
        assert!(err.to_string().contains("example.com/v1/Widget"));
    }

    #[tokio::test]
    async fn registered_schemas_resolve_from_cache() {
        let registry = KindRegistry::with_builtins();
        registry.register(KindSchema::namespaced(
            "example.com/v1",
            "Widget",
            ReadySignal::Exists,
        ));
        let schema = registry.resolve("example.com/v1", "Widget").await.unwrap();
        assert_eq!(schema.api_resource.plural, "widgets");
        assert_eq!(schema.ready_condition_type(), "WidgetReady");
    }
}
