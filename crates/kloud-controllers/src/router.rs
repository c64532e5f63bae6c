//! Router controller: renders an Ingress and reports its load-balancer addresses

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;

use kloud_common::apply::{Applier, ObjectId};
use kloud_common::condition::{self, Condition};
use kloud_common::crd::{Router, DEFAULT_APP_PORT};
use kloud_common::template::TemplateEngine;
use kloud_common::watch_graph::{any_child, ParentMapping, WatchGraph};
use kloud_common::{Error, ROUTER_NAME_LABEL};

use crate::children::{apply_all, render_owned};
use crate::engine::{ApplyOutcome, Observation, Reconciler};

/// Finalizer held by the router controller
pub const ROUTER_FINALIZER: &str = "finalizers.kloud.dev/router";

/// Readiness condition
pub const INGRESS_CREATED: &str = "IngressCreated";

/// `displayVars` key holding the load-balancer addresses
pub const LOAD_BALANCER_IPS_VAR: &str = "loadBalancerIPs";

const INGRESS_TEMPLATE: &str = include_str!("../templates/ingress.yaml");

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct IngressValues<'a> {
    name: String,
    namespace: String,
    ingress_class: Option<&'a str>,
    tls_secret: Option<&'a str>,
    domains: &'a [String],
    routes: Vec<RouteValues<'a>>,
}

#[derive(Serialize)]
struct RouteValues<'a> {
    path: &'a str,
    app: &'a str,
    port: i32,
}

/// Addresses published in the Ingress status, IPs and hostnames alike
pub fn load_balancer_addresses(ingress: &Value) -> Vec<String> {
    ingress
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            entry
                .get("ip")
                .or_else(|| entry.get("hostname"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

/// Reconciles [`Router`]s
pub struct RouterReconciler {
    applier: Arc<dyn Applier>,
    templates: TemplateEngine,
}

impl RouterReconciler {
    /// Create a reconciler
    pub fn new(applier: Arc<dyn Applier>) -> Self {
        Self {
            applier,
            templates: TemplateEngine::new(),
        }
    }

    /// Ingress events map back through the owner reference
    pub fn watch_graph() -> WatchGraph<Router> {
        WatchGraph::namespaced().edge::<Ingress>(ParentMapping::ControllerOwner, any_child)
    }

    fn render(&self, router: &Router) -> Result<Vec<Value>, Error> {
        let spec = &router.spec;
        let values = IngressValues {
            name: router.name_any(),
            namespace: router.namespace().unwrap_or_default(),
            ingress_class: spec.ingress_class.as_deref(),
            tls_secret: spec.tls_secret.as_deref(),
            domains: &spec.domains,
            routes: spec
                .routes
                .iter()
                .map(|r| RouteValues {
                    path: &r.path,
                    app: &r.app,
                    port: r.port.unwrap_or(DEFAULT_APP_PORT),
                })
                .collect(),
        };
        render_owned(&self.templates, INGRESS_TEMPLATE, &values, router)
    }

    fn ingress_id(router: &Router) -> ObjectId {
        ObjectId::namespaced(
            "networking.k8s.io/v1",
            "Ingress",
            router.namespace().unwrap_or_default(),
            router.name_any(),
        )
    }
}

#[async_trait]
impl Reconciler for RouterReconciler {
    type Resource = Router;
    const NAME: &'static str = "router";
    const FINALIZER: &'static str = ROUTER_FINALIZER;

    fn labels(&self, router: &Router) -> BTreeMap<String, String> {
        BTreeMap::from([(ROUTER_NAME_LABEL.to_string(), router.name_any())])
    }

    async fn apply(&self, router: &Router) -> Result<ApplyOutcome, Error> {
        router
            .spec
            .validate()
            .map_err(|msg| Error::validation_for(router.name_any(), msg))?;
        apply_all(self.applier.as_ref(), &self.render(router)?).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, router: &Router) -> Result<Observation, Error> {
        let Some(ingress) = self.applier.get_object(&Self::ingress_id(router)).await? else {
            return Ok(Observation::conditions(vec![Condition::failed(
                INGRESS_CREATED,
                "NotFound",
                format!("ingress {} does not exist", router.name_any()),
            )]));
        };
        let addresses = load_balancer_addresses(&ingress);
        Ok(Observation {
            conditions: vec![Condition::ok(INGRESS_CREATED)],
            display_vars: BTreeMap::from([(
                LOAD_BALANCER_IPS_VAR.to_string(),
                addresses.join(","),
            )]),
        })
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::is_true(conditions, INGRESS_CREATED)
    }

    async fn child_exists(&self, router: &Router) -> Result<bool, Error> {
        Ok(self.applier.get_object(&Self::ingress_id(router)).await?.is_some())
    }
}
