//! Small Kubernetes helpers shared by the apply layer and the controllers

use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::discovery::ApiResource;
use serde_json::{Map, Value};

/// Well-known kind -> plural mappings that don't follow simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("ingress", "ingresses"),
    ("ingressclass", "ingressclasses"),
    ("networkpolicy", "networkpolicies"),
    ("endpoints", "endpoints"),
];

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use kloud_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), ("".to_string(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an `ApiResource` without discovery
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Labels from `desired` that are missing or different on the object
///
/// Returns `None` when the object already carries every desired label.
pub fn missing_labels(
    meta: &ObjectMeta,
    desired: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, String>> {
    let current = meta.labels.as_ref();
    let missing: BTreeMap<String, String> = desired
        .iter()
        .filter(|(k, v)| current.and_then(|l| l.get(*k)) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (!missing.is_empty()).then_some(missing)
}

/// `namespace/name`, or `name` for cluster-scoped objects
pub fn object_key(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// JSON merge patch (RFC 7386) that turns `current` into `desired`
///
/// Keys missing from `desired` are sent as `null` so the server drops them.
/// Arrays and scalars are replaced whole.
pub fn merge_patch_between(current: &Value, desired: &Value) -> Value {
    let (Value::Object(current), Value::Object(desired)) = (current, desired) else {
        return desired.clone();
    };
    let mut patch = Map::new();
    for (key, value) in desired {
        match current.get(key) {
            Some(existing) if existing == value => {}
            Some(existing @ Value::Object(_)) if value.is_object() => {
                patch.insert(key.clone(), merge_patch_between(existing, value));
            }
            _ => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    for key in current.keys().filter(|k| !desired.contains_key(*k)) {
        patch.insert(key.clone(), Value::Null);
    }
    Value::Object(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("Deployment", "deployments")]
    #[case("Ingress", "ingresses")]
    #[case("Policy", "policies")]
    #[case("Gateway", "gateways")]
    #[case("Database", "databases")]
    #[case("ManagedService", "managedservices")]
    fn pluralizes_kinds(#[case] kind: &str, #[case] plural: &str) {
        assert_eq!(pluralize_kind(kind), plural);
    }

    #[test]
    fn builds_core_and_grouped_resources() {
        let ar = build_api_resource("v1", "Secret");
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "secrets");

        let ar = build_api_resource("mongodb.msvc.kloud.dev/v1", "Database");
        assert_eq!(ar.group, "mongodb.msvc.kloud.dev");
        assert_eq!(ar.version, "v1");
    }

    #[test]
    fn missing_labels_only_reports_differences() {
        let meta = ObjectMeta {
            labels: Some(BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "old".to_string()),
            ])),
            ..Default::default()
        };
        let desired = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "new".to_string()),
        ]);
        let missing = missing_labels(&meta, &desired).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["b"], "new");

        let satisfied = BTreeMap::from([("a".to_string(), "1".to_string())]);
        assert!(missing_labels(&meta, &satisfied).is_none());
    }

    #[test]
    fn merge_patch_nulls_cleared_fields() {
        let current = json!({
            "isReady": false,
            "message": "DeploymentAvailable: 0/1",
            "conditions": [{"type": "DeploymentAvailable", "status": "False"}],
            "displayVars": {"loadBalancerIPs": "203.0.113.10", "namespace": "acme"},
        });
        let desired = json!({
            "isReady": true,
            "displayVars": {"namespace": "acme"},
        });

        let patch = merge_patch_between(&current, &desired);
        assert_eq!(
            patch,
            json!({
                "isReady": true,
                "message": null,
                "conditions": null,
                "displayVars": {"loadBalancerIPs": null},
            })
        );

        let mut live = current.clone();
        json_patch::merge(&mut live, &patch);
        assert_eq!(live, desired);
    }

    #[test]
    fn merge_patch_of_equal_documents_is_empty() {
        let doc = json!({"isReady": true, "conditions": [{"type": "Ready"}]});
        assert_eq!(merge_patch_between(&doc, &doc), json!({}));
    }

    #[test]
    fn object_keys_include_namespace_when_present() {
        let mut meta = ObjectMeta {
            name: Some("api".into()),
            ..Default::default()
        };
        assert_eq!(object_key(&meta), "api");
        meta.namespace = Some("acme".into());
        assert_eq!(object_key(&meta), "acme/api");
    }
}
