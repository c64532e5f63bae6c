//! ManagedResource controller
//!
//! Waits for the referenced ManagedService, then applies the resource
//! described by `spec.resourceTemplate` with `spec.msvcRef` pointing at
//! that service. Deleting the ManagedResource deletes the child, and the
//! foreground finalizer holds until the child is gone.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::info;

use kloud_common::apply::{Applier, ObjectId};
use kloud_common::condition::{self, Condition};
use kloud_common::crd::{Database, ManagedResource, MsvcRef, API_VERSION};
use kloud_common::kind_registry::KindRegistry;
use kloud_common::watch_graph::{any_child, owner_reference, ParentMapping, WatchGraph};
use kloud_common::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MRES_NAME_LABEL};

use crate::children::child_conditions;
use crate::engine::{ApplyOutcome, Observation, Reconciler};

/// Finalizer held by the managed resource controller
pub const MRES_FINALIZER: &str = "finalizers.kloud.dev/managed-resource";

/// The referenced ManagedService is ready
pub const MANAGED_SERVICE_READY: &str = "ManagedServiceReady";

/// The provisioned resource reports ready
pub const RESOURCE_READY: &str = "ResourceReady";

/// Readiness of the ManagedService named by `msvc_ref`, as a dependency condition
///
/// The reference defaults to the referrer's namespace.
pub async fn managed_service_dependency(
    applier: &dyn Applier,
    registry: &KindRegistry,
    msvc_ref: &MsvcRef,
    referrer_namespace: &str,
) -> Result<Condition, Error> {
    let namespace = msvc_ref.namespace_or(referrer_namespace);
    let id = ObjectId::namespaced(API_VERSION, "ManagedService", namespace, &msvc_ref.name);
    let Some(msvc) = applier.get_object(&id).await? else {
        return Ok(Condition::failed(
            MANAGED_SERVICE_READY,
            "NotFound",
            format!("managed service {namespace}/{} does not exist", msvc_ref.name),
        ));
    };
    let schema = registry.resolve(API_VERSION, "ManagedService").await?;
    Ok(if schema.is_ready(&msvc) {
        Condition::ok(MANAGED_SERVICE_READY)
    } else {
        Condition::failed(
            MANAGED_SERVICE_READY,
            "NotReady",
            format!("managed service {namespace}/{} is not ready", msvc_ref.name),
        )
    })
}

/// A kind that depends on a ManagedService through `spec.msvcRef`
pub trait MsvcReferrer: Resource<DynamicType = ()> {
    /// The referenced ManagedService
    fn msvc_ref(&self) -> &MsvcRef;
}

impl MsvcReferrer for ManagedResource {
    fn msvc_ref(&self) -> &MsvcRef {
        &self.spec.msvc_ref
    }
}

impl MsvcReferrer for Database {
    fn msvc_ref(&self) -> &MsvcRef {
        &self.spec.msvc_ref
    }
}

/// Reconcile requests for every candidate referring to the ManagedService `service`
pub fn service_referrers<K: MsvcReferrer>(
    service: &ObjectMeta,
    candidates: &[Arc<K>],
) -> Vec<ObjectRef<K>> {
    let (Some(name), Some(namespace)) = (service.name.as_deref(), service.namespace.as_deref())
    else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter(|k| {
            let msvc_ref = k.msvc_ref();
            let referrer_ns = k.meta().namespace.as_deref().unwrap_or_default();
            msvc_ref.name == name && msvc_ref.namespace_or(referrer_ns) == namespace
        })
        .map(|k| ObjectRef::from_obj(k.as_ref()))
        .collect()
}

/// Reconciles [`ManagedResource`]s
pub struct ManagedResourceReconciler {
    applier: Arc<dyn Applier>,
    registry: Arc<KindRegistry>,
}

impl ManagedResourceReconciler {
    /// Create a reconciler
    pub fn new(applier: Arc<dyn Applier>, registry: Arc<KindRegistry>) -> Self {
        Self { applier, registry }
    }

    /// Typed children map back through their owner reference
    ///
    /// Children of other kinds are re-read by the not-ready requeue; the
    /// referenced ManagedService maps through [`service_referrers`].
    pub fn watch_graph() -> WatchGraph<ManagedResource> {
        WatchGraph::namespaced().edge::<Database>(ParentMapping::ControllerOwner, any_child)
    }

    fn child_id(mres: &ManagedResource) -> ObjectId {
        let template = &mres.spec.resource_template;
        ObjectId::namespaced(
            &template.api_version,
            &template.kind,
            mres.namespace().unwrap_or_default(),
            mres.name_any(),
        )
    }

    fn manifest(mres: &ManagedResource) -> Result<Value, Error> {
        let reference = owner_reference(mres)
            .ok_or_else(|| Error::internal_with_context("managed-resource", "no uid yet"))?;
        let namespace = mres.namespace().unwrap_or_default();
        let msvc_ref = &mres.spec.msvc_ref;

        let mut manifest = mres
            .spec
            .resource_template
            .manifest(&mres.name_any(), &namespace);
        manifest["metadata"]["labels"] = json!({
            MRES_NAME_LABEL: mres.name_any(),
            MANAGED_BY_LABEL: MANAGED_BY_VALUE,
        });
        manifest["metadata"]["ownerReferences"] = json!([reference]);
        manifest["spec"]["msvcRef"] = json!({
            "name": msvc_ref.name,
            "namespace": msvc_ref.namespace_or(&namespace),
        });
        Ok(manifest)
    }
}

#[async_trait]
impl Reconciler for ManagedResourceReconciler {
    type Resource = ManagedResource;
    const NAME: &'static str = "managed-resource";
    const FINALIZER: &'static str = MRES_FINALIZER;

    fn labels(&self, mres: &ManagedResource) -> BTreeMap<String, String> {
        BTreeMap::from([(MRES_NAME_LABEL.to_string(), mres.name_any())])
    }

    async fn dependencies(&self, mres: &ManagedResource) -> Result<Vec<Condition>, Error> {
        let dependency = managed_service_dependency(
            self.applier.as_ref(),
            &self.registry,
            &mres.spec.msvc_ref,
            &mres.namespace().unwrap_or_default(),
        )
        .await?;
        Ok(vec![dependency])
    }

    async fn apply(&self, mres: &ManagedResource) -> Result<ApplyOutcome, Error> {
        let template = &mres.spec.resource_template;
        if template.api_version.is_empty() || template.kind.is_empty() {
            return Err(Error::validation_for_field(
                mres.name_any(),
                "spec.resourceTemplate",
                "apiVersion and kind are required",
            ));
        }
        if mres.spec.msvc_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                mres.name_any(),
                "spec.msvcRef.name",
                "a managed service is required",
            ));
        }
        self.applier.apply_object(&Self::manifest(mres)?).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, mres: &ManagedResource) -> Result<Observation, Error> {
        let conditions = child_conditions(
            self.applier.as_ref(),
            &self.registry,
            &Self::child_id(mres),
            RESOURCE_READY,
        )
        .await?;
        Ok(Observation::conditions(conditions))
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::all_true(conditions, &[MANAGED_SERVICE_READY, RESOURCE_READY])
    }

    async fn cleanup(&self, mres: &ManagedResource) -> Result<(), Error> {
        let id = Self::child_id(mres);
        self.applier.delete_object(&id).await?;
        info!(kind = %id.kind, name = %id.name, "Deleted managed resource child");
        Ok(())
    }

    async fn child_exists(&self, mres: &ManagedResource) -> Result<bool, Error> {
        Ok(self.applier.get_object(&Self::child_id(mres)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kloud_common::apply::MockApplier;
    use kloud_common::crd::{ManagedResourceSpec, ResourceTemplate, MONGODB_API_VERSION};
    use kloud_common::finalizer::FOREGROUND_FINALIZER;
    use kloud_common::notifier::MockStatusNotifier;
    use kloud_common::reconcile::ReconcileOutcome;
    use mockall::Sequence;

    use crate::engine::{run, Context, ObjectKey};
    use crate::testing::FakeStore;

    fn mres() -> ManagedResource {
        let mut mres = ManagedResource::new(
            "orders",
            ManagedResourceSpec {
                msvc_ref: MsvcRef {
                    name: "mongo".into(),
                    namespace: None,
                },
                resource_template: ResourceTemplate {
                    api_version: MONGODB_API_VERSION.into(),
                    kind: "Database".into(),
                    spec: BTreeMap::new(),
                },
            },
        );
        mres.metadata.namespace = Some("acme".into());
        mres.metadata.uid = Some("uid-1".into());
        mres
    }

    fn msvc_id() -> ObjectId {
        ObjectId::namespaced(API_VERSION, "ManagedService", "acme", "mongo")
    }

    fn reconciler(applier: MockApplier) -> ManagedResourceReconciler {
        ManagedResourceReconciler::new(Arc::new(applier), Arc::new(KindRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn dependency_reports_missing_and_unready_services() {
        let mut applier = MockApplier::new();
        let mut seq = Sequence::new();
        applier
            .expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        applier
            .expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(json!({"status": {"isReady": false}}))));
        applier
            .expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(json!({"status": {"isReady": true}}))));
        let r = reconciler(applier);

        let reasons: Vec<String> = [
            r.dependencies(&mres()).await.unwrap(),
            r.dependencies(&mres()).await.unwrap(),
            r.dependencies(&mres()).await.unwrap(),
        ]
        .into_iter()
        .map(|c| c[0].reason.clone())
        .collect();
        assert_eq!(reasons[0], "NotFound");
        assert_eq!(reasons[1], "NotReady");
        assert!(reasons[2].is_empty());
    }

    #[tokio::test]
    async fn child_gets_the_service_reference_injected() {
        let mut applier = MockApplier::new();
        applier
            .expect_apply_object()
            .withf(|doc| {
                doc["kind"] == "Database"
                    && doc["spec"]["msvcRef"] == json!({"name": "mongo", "namespace": "acme"})
                    && doc["metadata"]["ownerReferences"][0]["name"] == "orders"
            })
            .times(1)
            .returning(|doc| ObjectId::from_value(doc));
        let r = reconciler(applier);
        assert_eq!(r.apply(&mres()).await.unwrap(), ApplyOutcome::Applied);
    }

    fn referring(name: &str, namespace: &str, msvc_namespace: Option<&str>) -> Arc<ManagedResource> {
        let mut mres = mres();
        mres.metadata.name = Some(name.into());
        mres.metadata.namespace = Some(namespace.into());
        mres.spec.msvc_ref.namespace = msvc_namespace.map(str::to_string);
        Arc::new(mres)
    }

    #[test]
    fn service_events_map_to_the_resources_that_reference_it() {
        let service = ObjectMeta {
            name: Some("mongo".into()),
            namespace: Some("acme".into()),
            ..Default::default()
        };
        let candidates = vec![
            referring("orders", "acme", None),
            referring("billing", "billing", Some("acme")),
            referring("elsewhere", "billing", None),
        ];

        let requests = service_referrers(&service, &candidates);
        assert_eq!(
            requests,
            vec![
                ObjectRef::<ManagedResource>::new("orders").within("acme"),
                ObjectRef::<ManagedResource>::new("billing").within("billing"),
            ]
        );
    }

    #[test]
    fn service_events_map_to_referencing_databases() {
        let mut db = Database::new(
            "orders",
            kloud_common::crd::DatabaseSpec {
                msvc_ref: MsvcRef {
                    name: "mongo".into(),
                    namespace: None,
                },
                database_name: None,
            },
        );
        db.metadata.namespace = Some("acme".into());
        let databases = [Arc::new(db)];
        let service = ObjectMeta {
            name: Some("mongo".into()),
            namespace: Some("acme".into()),
            ..Default::default()
        };
        assert_eq!(
            service_referrers(&service, &databases),
            vec![ObjectRef::<Database>::new("orders").within("acme")]
        );

        let other = ObjectMeta {
            name: Some("postgres".into()),
            ..service
        };
        assert!(service_referrers(&other, &databases).is_empty());
    }

    #[test]
    fn typed_database_children_map_to_their_owner() {
        let graph = ManagedResourceReconciler::watch_graph();
        let child = ObjectMeta {
            name: Some("orders".into()),
            namespace: Some("acme".into()),
            owner_references: owner_reference(&mres()).map(|r| vec![r]),
            ..Default::default()
        };
        assert_eq!(
            graph.requests_for("Database", &child),
            vec![ObjectRef::<ManagedResource>::new("orders").within("acme")]
        );
    }

    /// Story: nothing is provisioned until the service is ready
    #[tokio::test]
    async fn story_resource_waits_for_its_service() {
        let mut applier = MockApplier::new();
        applier
            .expect_get_object()
            .withf(|id| *id == msvc_id())
            .returning(|_| Ok(Some(json!({"status": {"isReady": false}}))));
        applier.expect_apply_object().never();

        let mut notifier = MockStatusNotifier::new();
        notifier.expect_notify().returning(|_, _| ());
        let store = Arc::new(FakeStore::default());
        let key = store.insert(mres());
        let ctx = Context::new(
            reconciler(applier),
            store.clone(),
            Arc::new(notifier),
            tracing::Span::none(),
        );

        run(&key, &ctx).await;
        let outcome = run(&key, &ctx).await;
        assert!(matches!(outcome, ReconcileOutcome::Retry(_)));

        let stored = store.object(&key).unwrap();
        let status = stored.status.unwrap();
        assert!(!status.is_ready);
        let dependency = condition::find(&status.conditions, MANAGED_SERVICE_READY).unwrap();
        assert_eq!(dependency.reason, "NotReady");
        assert_eq!(status.observed_generation, None);
    }

    /// Story: deleting the resource deletes the child, and the foreground
    /// finalizer holds until the child is gone
    #[tokio::test]
    async fn story_teardown_waits_for_the_child() {
        let mut applier = MockApplier::new();
        let mut seq = Sequence::new();
        applier
            .expect_delete_object()
            .withf(|id| id.kind == "Database" && id.name == "orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        applier
            .expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(json!({}))));
        applier
            .expect_get_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));

        let mut notifier = MockStatusNotifier::new();
        notifier.expect_notify().returning(|_, _| ());
        let store = Arc::new(FakeStore::default());
        let mut obj = mres();
        obj.metadata.finalizers = Some(vec![
            MRES_FINALIZER.to_string(),
            FOREGROUND_FINALIZER.to_string(),
        ]);
        let key: ObjectKey = store.insert(obj);
        store.request_deletion(&key);
        let ctx = Context::new(
            reconciler(applier),
            store.clone(),
            Arc::new(notifier),
            tracing::Span::none(),
        );

        run(&key, &ctx).await;
        let finalizers = store.object(&key).unwrap().metadata.finalizers.unwrap();
        assert_eq!(finalizers, vec![FOREGROUND_FINALIZER.to_string()]);

        run(&key, &ctx).await;
        assert!(store.object(&key).is_some(), "child still exists");

        run(&key, &ctx).await;
        assert!(store.object(&key).is_none());
    }
}
