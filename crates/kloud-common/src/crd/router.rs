//! Router: HTTP ingress for apps

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourceStatus;

/// One path routed to an app
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Path prefix
    pub path: String,
    /// App (Service) receiving the traffic
    pub app: String,
    /// Service port, the app's default port when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Routes a set of domains to apps in the same namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "crds.kloud.dev",
    version = "v1",
    kind = "Router",
    plural = "routers",
    shortname = "rt",
    namespaced,
    status = "ResourceStatus",
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".status.displayVars.loadBalancerIPs"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.isReady"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// Hostnames served
    pub domains: Vec<String>,

    /// Path routes, applied to every domain
    pub routes: Vec<Route>,

    /// Ingress class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,

    /// TLS secret covering all domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

impl RouterSpec {
    /// Reject specs that cannot render an Ingress
    pub fn validate(&self) -> Result<(), String> {
        if self.domains.is_empty() {
            return Err("at least one domain is required".to_string());
        }
        if self.routes.is_empty() {
            return Err("at least one route is required".to_string());
        }
        if let Some((i, _)) = self
            .routes
            .iter()
            .enumerate()
            .find(|(_, r)| r.app.is_empty() || !r.path.starts_with('/'))
        {
            return Err(format!(
                "routes[{i}] needs an app and a path starting with '/'"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_requires_domains_and_well_formed_routes() {
        let mut spec = RouterSpec::default();
        assert!(spec.validate().is_err());

        spec.domains = vec!["acme.example.com".into()];
        spec.routes = vec![Route {
            path: "/".into(),
            app: "api".into(),
            port: None,
        }];
        assert!(spec.validate().is_ok());

        spec.routes[0].path = "api".into();
        assert!(spec.validate().unwrap_err().contains("routes[0]"));
    }
}
