//! ManagedService controller
//!
//! Applies the backing store described by `spec.serviceTemplate` and, once
//! it is ready, re-publishes its output secret as `msvc-<name>` for the
//! resources provisioned inside the service.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::debug;

use kloud_common::apply::{Applier, ObjectId};
use kloud_common::condition::{self, Condition};
use kloud_common::crd::ManagedService;
use kloud_common::kind_registry::KindRegistry;
use kloud_common::watch_graph::{any_child, owner_reference, ParentMapping, WatchGraph};
use kloud_common::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MSVC_NAME_LABEL};

use crate::children::child_conditions;
use crate::engine::{ApplyOutcome, Observation, Reconciler};
use crate::secrets::{owned_secret, SecretClient};

/// Finalizer held by the managed service controller
pub const MSVC_FINALIZER: &str = "finalizers.kloud.dev/managed-service";

/// The backing store reports ready
pub const SERVICE_READY: &str = "ServiceReady";

/// The output secret was re-published
pub const SECRET_PUBLISHED: &str = "SecretPublished";

/// `displayVars` key naming the published secret
pub const SECRET_VAR: &str = "secret";

/// Secret the backing store writes its connection details to
pub fn output_secret_name(msvc: &str) -> String {
    format!("{msvc}-output")
}

/// Secret consumers of the service read
pub fn published_secret_name(msvc: &str) -> String {
    format!("msvc-{msvc}")
}

/// Reconciles [`ManagedService`]s
pub struct ManagedServiceReconciler {
    applier: Arc<dyn Applier>,
    secrets: Arc<dyn SecretClient>,
    registry: Arc<KindRegistry>,
}

impl ManagedServiceReconciler {
    /// Create a reconciler
    pub fn new(
        applier: Arc<dyn Applier>,
        secrets: Arc<dyn SecretClient>,
        registry: Arc<KindRegistry>,
    ) -> Self {
        Self {
            applier,
            secrets,
            registry,
        }
    }

    /// Typed children map back through their owner
    ///
    /// Backing stores of other kinds are picked up by the not-ready requeue.
    pub fn watch_graph() -> WatchGraph<ManagedService> {
        WatchGraph::namespaced()
            .edge::<StatefulSet>(ParentMapping::ControllerOwner, any_child)
            .edge::<Deployment>(ParentMapping::ControllerOwner, any_child)
            .edge::<Secret>(ParentMapping::ControllerOwner, any_child)
    }

    fn child_id(msvc: &ManagedService) -> ObjectId {
        let template = &msvc.spec.service_template;
        ObjectId::namespaced(
            &template.api_version,
            &template.kind,
            msvc.namespace().unwrap_or_default(),
            msvc.name_any(),
        )
    }

    fn manifest(msvc: &ManagedService) -> Result<Value, Error> {
        let reference = owner_reference(msvc)
            .ok_or_else(|| Error::internal_with_context("managed-service", "no uid yet"))?;
        let mut manifest = msvc
            .spec
            .service_template
            .manifest(&msvc.name_any(), &msvc.namespace().unwrap_or_default());
        manifest["metadata"]["labels"] = json!({
            MSVC_NAME_LABEL: msvc.name_any(),
            MANAGED_BY_LABEL: MANAGED_BY_VALUE,
        });
        manifest["metadata"]["ownerReferences"] = json!([reference]);
        Ok(manifest)
    }

    async fn publish_secret(&self, msvc: &ManagedService) -> Result<Condition, Error> {
        let namespace = msvc.namespace().unwrap_or_default();
        let name = msvc.name_any();
        let output = output_secret_name(&name);
        let Some(secret) = self.secrets.get_secret(&namespace, &output).await? else {
            return Ok(Condition::failed(
                SECRET_PUBLISHED,
                "OutputSecretMissing",
                format!("waiting for secret {output}"),
            ));
        };
        let published = owned_secret(
            msvc,
            published_secret_name(&name),
            BTreeMap::from([(MSVC_NAME_LABEL.to_string(), name.clone())]),
            secret.data.unwrap_or_default(),
        )?;
        self.secrets.apply_secret(&published).await?;
        debug!(msvc = %name, secret = %published.name_any(), "Published output secret");
        Ok(Condition::ok(SECRET_PUBLISHED))
    }
}

#[async_trait]
impl Reconciler for ManagedServiceReconciler {
    type Resource = ManagedService;
    const NAME: &'static str = "managed-service";
    const FINALIZER: &'static str = MSVC_FINALIZER;

    fn labels(&self, msvc: &ManagedService) -> BTreeMap<String, String> {
        BTreeMap::from([(MSVC_NAME_LABEL.to_string(), msvc.name_any())])
    }

    async fn apply(&self, msvc: &ManagedService) -> Result<ApplyOutcome, Error> {
        let template = &msvc.spec.service_template;
        if template.api_version.is_empty() || template.kind.is_empty() {
            return Err(Error::validation_for_field(
                msvc.name_any(),
                "spec.serviceTemplate",
                "apiVersion and kind are required",
            ));
        }
        self.applier.apply_object(&Self::manifest(msvc)?).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, msvc: &ManagedService) -> Result<Observation, Error> {
        let mut conditions = child_conditions(
            self.applier.as_ref(),
            &self.registry,
            &Self::child_id(msvc),
            SERVICE_READY,
        )
        .await?;

        let mut display_vars = BTreeMap::new();
        if condition::is_true(&conditions, SERVICE_READY) {
            let published = self.publish_secret(msvc).await?;
            if published.is_true() {
                display_vars.insert(SECRET_VAR.to_string(), published_secret_name(&msvc.name_any()));
            }
            conditions.push(published);
        } else {
            conditions.push(Condition::failed(
                SECRET_PUBLISHED,
                "ServiceNotReady",
                "waiting for the service to become ready",
            ));
        }
        Ok(Observation {
            conditions,
            display_vars,
        })
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::all_true(conditions, &[SERVICE_READY, SECRET_PUBLISHED])
    }

    async fn child_exists(&self, msvc: &ManagedService) -> Result<bool, Error> {
        Ok(self.applier.get_object(&Self::child_id(msvc)).await?.is_some())
    }
}
