//! Generic controller loop
//!
//! Every kind runs the same pass:
//!
//! ```text
//! Fetch -> Finalize? -> EnsureLabels -> Dependencies -> NewGeneration? -> Apply
//!       -> Observe -> MergeConditions -> PersistStatus? -> Notify -> OK | Retry
//! ```
//!
//! A kind plugs in through [`Reconciler`]: which labels it owns, how it
//! renders and applies children, how it reads their status back, and when it
//! is ready. Persistence of the primary object goes through [`ObjectStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use kloud_common::condition::{self, Condition};
use kloud_common::crd::{ManagedObject, ResourceStatus};
use kloud_common::finalizer::{self, FinalizerHooks};
use kloud_common::kube_utils::{merge_patch_between, missing_labels};
use kloud_common::metrics::{self, ReconcileResult};
use kloud_common::notifier::{StatusNotifier, StatusTarget, StatusUpdate};
use kloud_common::reconcile::{error_policy_action, ReconcileOutcome, DEFAULT_RETRY};
use kloud_common::Error;

/// Condition reported when the spec cannot be rendered
pub const SPEC_VALID_CONDITION: &str = "SpecValid";

/// Identity of a primary object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Key of an object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Metadata edits on the primary object, written in one patch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataPatch {
    /// Replacement finalizer list
    pub finalizers: Option<Vec<String>>,
    /// Labels to merge
    pub labels: Option<BTreeMap<String, String>>,
}

/// Reads and writes of the primary object
///
/// Writes carry the object's `resourceVersion`, so a concurrent writer
/// produces a conflict instead of a lost update.
#[async_trait]
pub trait ObjectStore<K: ManagedObject>: Send + Sync {
    /// Current object, `None` if it is gone
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error>;

    /// Patch finalizers and labels
    async fn patch_metadata(&self, obj: &K, patch: MetadataPatch) -> Result<(), Error>;

    /// Write `status` as the whole status subresource
    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<(), Error>;
}

type ApiFactory<K> = dyn Fn(Option<&str>) -> Api<K> + Send + Sync;

/// [`ObjectStore`] backed by the Kubernetes API
pub struct KubeObjectStore<K> {
    api: Box<ApiFactory<K>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjectStore<K>
where
    K: ManagedObject + Resource<Scope = NamespaceResourceScope>,
{
    /// Store for a namespaced kind
    pub fn namespaced(client: Client) -> Self {
        Self {
            api: Box::new(move |ns| match ns {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            }),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeObjectStore<K>
where
    K: ManagedObject + Resource<Scope = ClusterResourceScope>,
{
    /// Store for a cluster-scoped kind
    pub fn cluster(client: Client) -> Self {
        Self {
            api: Box::new(move |_| Api::all(client.clone())),
            _kind: PhantomData,
        }
    }
}

/// `metadata` stub carrying the object's resourceVersion for optimistic concurrency
fn versioned_metadata<K: Resource>(obj: &K) -> serde_json::Value {
    match &obj.meta().resource_version {
        Some(rv) => json!({ "resourceVersion": rv }),
        None => json!({}),
    }
}

/// Merge patch body turning the object's current status into `status`
///
/// Fields cleared since the last write are sent as explicit nulls.
pub(crate) fn status_patch<K: ManagedObject>(
    obj: &K,
    status: &ResourceStatus,
) -> Result<serde_json::Value, Error> {
    let current = serde_json::to_value(obj.status().cloned().unwrap_or_default())?;
    let desired = serde_json::to_value(status)?;
    Ok(json!({
        "metadata": versioned_metadata(obj),
        "status": merge_patch_between(&current, &desired),
    }))
}

#[async_trait]
impl<K: ManagedObject> ObjectStore<K> for KubeObjectStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        Ok((self.api)(key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn patch_metadata(&self, obj: &K, patch: MetadataPatch) -> Result<(), Error> {
        let key = ObjectKey::of(obj);
        let mut metadata = versioned_metadata(obj);
        if let Some(finalizers) = patch.finalizers {
            metadata["finalizers"] = json!(finalizers);
        }
        if let Some(labels) = patch.labels {
            metadata["labels"] = json!(labels);
        }
        (self.api)(key.namespace.as_deref())
            .patch(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": metadata })),
            )
            .await?;
        Ok(())
    }

    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<(), Error> {
        let key = ObjectKey::of(obj);
        let body = status_patch(obj, status)?;
        (self.api)(key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(body))
            .await?;
        Ok(())
    }
}

/// Result of the apply step
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    /// Children were rendered and applied for the current generation
    Applied,
    /// Apply cannot happen yet; the conditions say why
    Blocked(Vec<Condition>),
}

/// Child status read back after apply
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Conditions derived from children, prefixed by source
    pub conditions: Vec<Condition>,
    /// Values to publish in `status.displayVars`
    pub display_vars: BTreeMap<String, String>,
}

impl Observation {
    /// Observation carrying only conditions
    pub fn conditions(conditions: Vec<Condition>) -> Self {
        Self {
            conditions,
            display_vars: BTreeMap::new(),
        }
    }
}

/// Kind-specific parts of the controller loop
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// The primary kind
    type Resource: ManagedObject;

    /// Short name used in logs and metrics
    const NAME: &'static str;

    /// Resource-specific finalizer
    const FINALIZER: &'static str;

    /// Labels this controller owns on the primary object
    fn labels(&self, _obj: &Self::Resource) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Re-render even though the generation was already observed
    fn needs_resync(&self, _obj: &Self::Resource) -> bool {
        false
    }

    /// Conditions on things this object depends on, checked every pass
    ///
    /// Any non-`True` dependency skips apply and observe for this pass.
    async fn dependencies(&self, _obj: &Self::Resource) -> Result<Vec<Condition>, Error> {
        Ok(Vec::new())
    }

    /// Render and apply children for the current generation
    async fn apply(&self, obj: &Self::Resource) -> Result<ApplyOutcome, Error>;

    /// Read child status
    async fn observe(&self, obj: &Self::Resource) -> Result<Observation, Error>;

    /// Readiness predicate over the merged conditions
    fn is_ready(&self, conditions: &[Condition]) -> bool;

    /// Resource-specific teardown run before the finalizer is removed
    async fn cleanup(&self, _obj: &Self::Resource) -> Result<(), Error> {
        Ok(())
    }

    /// Whether the child guarded by the foreground finalizer still exists
    async fn child_exists(&self, _obj: &Self::Resource) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Everything a controller needs, built at the composition root
pub struct Context<R: Reconciler> {
    /// Kind-specific logic
    pub reconciler: R,
    /// Primary object persistence
    pub store: Arc<dyn ObjectStore<R::Resource>>,
    /// Status publisher
    pub notifier: Arc<dyn StatusNotifier>,
    /// Parent span for every reconcile pass of this controller
    pub span: Span,
    /// Requeue delay while not ready
    pub retry_after: Duration,
}

impl<R: Reconciler> Context<R> {
    /// Create a context with the default not-ready delay
    pub fn new(
        reconciler: R,
        store: Arc<dyn ObjectStore<R::Resource>>,
        notifier: Arc<dyn StatusNotifier>,
        span: Span,
    ) -> Self {
        Self {
            reconciler,
            store,
            notifier,
            span,
            retry_after: DEFAULT_RETRY,
        }
    }

    /// Override the not-ready delay
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }
}

struct Hooks<'a, R: Reconciler> {
    ctx: &'a Context<R>,
    obj: &'a R::Resource,
}

#[async_trait]
impl<R: Reconciler> FinalizerHooks for Hooks<'_, R> {
    async fn set_finalizers(&self, finalizers: Vec<String>) -> Result<(), Error> {
        // Labels ride along with the first finalizer write.
        let labels = if finalizer::is_deleting(self.obj.meta()) {
            None
        } else {
            missing_labels(self.obj.meta(), &self.ctx.reconciler.labels(self.obj))
        };
        self.ctx
            .store
            .patch_metadata(
                self.obj,
                MetadataPatch {
                    finalizers: Some(finalizers),
                    labels,
                },
            )
            .await
    }

    async fn cleanup(&self) -> Result<(), Error> {
        self.ctx.reconciler.cleanup(self.obj).await
    }

    async fn child_exists(&self) -> Result<bool, Error> {
        self.ctx.reconciler.child_exists(self.obj).await
    }
}

/// kube-rs reconcile entry point
pub async fn reconcile<R: Reconciler>(
    obj: Arc<R::Resource>,
    ctx: Arc<Context<R>>,
) -> Result<Action, Error> {
    let key = ObjectKey::of(obj.as_ref());
    let span = info_span!(parent: &ctx.span, "reconcile", object = %key);
    let started = Instant::now();

    let outcome = run(&key, &ctx).instrument(span).await;

    let result = match &outcome {
        ReconcileOutcome::Done => ReconcileResult::Ok,
        ReconcileOutcome::Retry(_) => ReconcileResult::Retry,
        ReconcileOutcome::RetryWithError(..) => ReconcileResult::Error,
    };
    metrics::record_reconcile(R::NAME, result, started.elapsed().as_secs_f64());
    outcome.into_action()
}

/// kube-rs error policy
pub fn error_policy<R: Reconciler>(
    _obj: Arc<R::Resource>,
    err: &Error,
    _ctx: Arc<Context<R>>,
) -> Action {
    error_policy_action(err)
}

/// One pass of the loop for `key`
pub async fn run<R: Reconciler>(key: &ObjectKey, ctx: &Context<R>) -> ReconcileOutcome {
    let obj = match ctx.store.get(key).await {
        Ok(Some(obj)) => obj,
        Ok(None) => {
            debug!("Object is gone, nothing to do");
            return ReconcileOutcome::ok();
        }
        Err(e) if e.is_not_found() => return ReconcileOutcome::ok(),
        Err(e) => return ReconcileOutcome::failed(e),
    };

    let hooks = Hooks { ctx, obj: &obj };
    if let Some(outcome) = finalizer::drive(obj.meta(), R::FINALIZER, &hooks).await {
        return outcome;
    }

    if let Some(labels) = missing_labels(obj.meta(), &ctx.reconciler.labels(&obj)) {
        info!(count = labels.len(), "Stamping labels");
        let patch = MetadataPatch {
            finalizers: None,
            labels: Some(labels),
        };
        return match ctx.store.patch_metadata(&obj, patch).await {
            Ok(()) => ReconcileOutcome::retry(Duration::ZERO),
            Err(e) => ReconcileOutcome::failed(e),
        };
    }

    match converge(&obj, ctx).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "Conflict, retrying from fetch");
            ReconcileOutcome::retry(Duration::ZERO)
        }
        Err(e) => ReconcileOutcome::failed(e),
    }
}

async fn converge<R: Reconciler>(
    obj: &R::Resource,
    ctx: &Context<R>,
) -> Result<ReconcileOutcome, Error> {
    let reconciler = &ctx.reconciler;
    let generation = obj.generation();
    let mut status = obj.status().cloned().unwrap_or_default();
    let mut observed_generation = status.observed_generation;

    let dependencies = reconciler.dependencies(obj).await?;
    let mut conditions = dependencies.clone();
    let mut display_vars = BTreeMap::new();

    if dependencies.iter().all(Condition::is_true) {
        // Children of the last applied generation are read even when apply stalls.
        let mut observable = status.observed_generation.is_some();
        let stale = generation > obj.observed_generation() || reconciler.needs_resync(obj);
        if stale {
            debug!(generation, observed = obj.observed_generation(), "Rendering children");
            match reconciler.apply(obj).await {
                Ok(ApplyOutcome::Applied) => {
                    observed_generation = Some(generation);
                    observable = true;
                }
                Ok(ApplyOutcome::Blocked(blocked)) => conditions.extend(blocked),
                Err(e @ Error::Validation { .. }) => {
                    warn!(error = %e, "Spec cannot be applied");
                    conditions.push(Condition::failed(
                        SPEC_VALID_CONDITION,
                        "ValidationFailed",
                        e.to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        } else {
            observable = true;
        }

        if observable {
            let observation = reconciler.observe(obj).await?;
            conditions.extend(observation.conditions);
            display_vars = observation.display_vars;
        }
    } else {
        // Children are not read while a dependency is unmet; keep what they last reported.
        let carried: Vec<Condition> = status
            .conditions
            .iter()
            .filter(|c| !conditions.iter().any(|d| d.type_ == c.type_))
            .cloned()
            .collect();
        conditions.extend(carried);
        display_vars = status.display_vars.clone();
    }

    let (mut merged, changed) = condition::patch(&status.conditions, &conditions);
    for c in &mut merged {
        c.observed_generation = Some(generation);
    }
    let ready = reconciler.is_ready(&merged);
    let next = ResourceStatus {
        is_ready: ready,
        observed_generation,
        message: condition::failure_summary(&merged),
        conditions: merged,
        display_vars,
    };

    if changed || next != status {
        ctx.store.patch_status(obj, &next).await?;
        debug!(ready, "Status updated");
    }
    status = next;

    let key = ObjectKey::of(obj);
    let target = StatusTarget {
        kind: <R::Resource as Resource>::kind(&()).into_owned(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
    };
    let update = StatusUpdate {
        key: target.key(),
        conditions: status.conditions,
        status: ready,
    };
    ctx.notifier.notify(&target, &update).await;

    Ok(if ready {
        ReconcileOutcome::ok()
    } else {
        ReconcileOutcome::retry(ctx.retry_after)
    })
}
