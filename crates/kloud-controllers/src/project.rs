//! Project controller
//!
//! A Project owns one Namespace. The namespace is labelled with the project
//! name so events on it map back to the project, and it is deleted when the
//! project is. A namespace labelled for another project is never adopted
//! or deleted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use kloud_common::apply::{create_or_update, Applied};
use kloud_common::condition::{self, Condition};
use kloud_common::crd::Project;
use kloud_common::watch_graph::{any_child, ParentMapping, WatchGraph};
use kloud_common::{Error, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PROJECT_NAME_LABEL};

use crate::engine::{ApplyOutcome, Observation, Reconciler};

/// Finalizer held by the project controller
pub const PROJECT_FINALIZER: &str = "finalizers.kloud.dev/project";

/// Readiness condition
pub const NAMESPACE_EXISTS: &str = "namespace-exists";

/// `displayVars` key holding the namespace name
pub const NAMESPACE_VAR: &str = "namespace";

/// Namespace operations used by the project controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Get a namespace, `None` if missing
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create the namespace or merge `labels` into it
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete a namespace; missing namespaces are fine
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;
}

/// [`NamespaceClient`] backed by the Kubernetes API
pub struct KubeNamespaceClient {
    api: Api<Namespace>,
}

impl KubeNamespaceClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let (_, applied) = create_or_update(&self.api, name, |ns: &mut Namespace| {
            ns.labels_mut().extend(labels.clone());
        })
        .await?;
        if applied == Applied::Created {
            info!(namespace = %name, "Created namespace");
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "Deleted namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validate a namespace name (RFC 1123 label)
fn validate_namespace_name(name: &str) -> Result<(), String> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if name.is_empty() || name.len() > 63 || !valid_chars {
        return Err(format!(
            "namespace {name:?} must be 1-63 lowercase alphanumeric characters or '-'"
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("namespace {name:?} must start and end with an alphanumeric character"));
    }
    Ok(())
}

/// Reconciles [`Project`]s
pub struct ProjectReconciler {
    namespaces: Arc<dyn NamespaceClient>,
}

impl ProjectReconciler {
    /// Create a reconciler
    pub fn new(namespaces: Arc<dyn NamespaceClient>) -> Self {
        Self { namespaces }
    }

    /// Namespace events map back to the project named in their label
    pub fn watch_graph() -> WatchGraph<Project> {
        WatchGraph::cluster().edge::<Namespace>(ParentMapping::Label(PROJECT_NAME_LABEL), any_child)
    }

    fn namespace_labels(project: &Project) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PROJECT_NAME_LABEL.to_string(), project.name_any()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    fn recorded_namespace(project: &Project) -> Option<&str> {
        project
            .status
            .as_ref()
            .and_then(|s| s.display_vars.get(NAMESPACE_VAR))
            .map(String::as_str)
    }

    /// Namespace torn down with the project: the recorded one, else the target
    fn owned_namespace_name(project: &Project) -> String {
        Self::recorded_namespace(project)
            .map(str::to_string)
            .unwrap_or_else(|| project.namespace_name())
    }

    fn claimed_by_other(ns: &Namespace, project: &Project) -> bool {
        ns.labels()
            .get(PROJECT_NAME_LABEL)
            .is_some_and(|owner| *owner != project.name_any())
    }

    fn owned_by(ns: &Namespace, project: &Project) -> bool {
        ns.labels().get(PROJECT_NAME_LABEL) == Some(&project.name_any())
    }

    fn claimed_elsewhere(namespace: &str) -> Condition {
        Condition::failed(
            NAMESPACE_EXISTS,
            "OwnedByAnotherProject",
            format!("namespace {namespace} belongs to another project"),
        )
    }

    /// The owned namespace, if it still exists and still carries this project's label
    async fn owned_namespace(&self, project: &Project) -> Result<Option<String>, Error> {
        let name = Self::owned_namespace_name(project);
        Ok(self
            .namespaces
            .get_namespace(&name)
            .await?
            .filter(|ns| Self::owned_by(ns, project))
            .map(|_| name))
    }
}

#[async_trait]
impl Reconciler for ProjectReconciler {
    type Resource = Project;
    const NAME: &'static str = "project";
    const FINALIZER: &'static str = PROJECT_FINALIZER;

    fn labels(&self, project: &Project) -> BTreeMap<String, String> {
        BTreeMap::from([(PROJECT_NAME_LABEL.to_string(), project.name_any())])
    }

    fn needs_resync(&self, project: &Project) -> bool {
        Self::recorded_namespace(project) != Some(project.namespace_name().as_str())
    }

    async fn apply(&self, project: &Project) -> Result<ApplyOutcome, Error> {
        let namespace = project.namespace_name();
        validate_namespace_name(&namespace).map_err(|msg| {
            Error::validation_for_field(project.name_any(), "spec.targetNamespace", msg)
        })?;
        if let Some(ns) = self.namespaces.get_namespace(&namespace).await? {
            if Self::claimed_by_other(&ns, project) {
                warn!(namespace = %namespace, "Namespace belongs to another project, not adopting");
                return Ok(ApplyOutcome::Blocked(vec![Self::claimed_elsewhere(&namespace)]));
            }
        }
        self.namespaces
            .ensure_namespace(&namespace, &Self::namespace_labels(project))
            .await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, project: &Project) -> Result<Observation, Error> {
        let namespace = project.namespace_name();
        let condition = match self.namespaces.get_namespace(&namespace).await? {
            None => Condition::failed(
                NAMESPACE_EXISTS,
                "NotFound",
                format!("namespace {namespace} does not exist"),
            ),
            Some(ns) if !Self::owned_by(&ns, project) => Self::claimed_elsewhere(&namespace),
            Some(_) => Condition::ok(NAMESPACE_EXISTS),
        };
        let mut display_vars = BTreeMap::new();
        if condition.is_true() {
            display_vars.insert(NAMESPACE_VAR.to_string(), namespace);
        }
        Ok(Observation {
            conditions: vec![condition],
            display_vars,
        })
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::is_true(conditions, NAMESPACE_EXISTS)
    }

    async fn cleanup(&self, project: &Project) -> Result<(), Error> {
        match self.owned_namespace(project).await? {
            Some(namespace) => self.namespaces.delete_namespace(&namespace).await,
            None => {
                info!(
                    namespace = %Self::owned_namespace_name(project),
                    "Namespace missing or owned elsewhere, leaving it"
                );
                Ok(())
            }
        }
    }

    async fn child_exists(&self, project: &Project) -> Result<bool, Error> {
        Ok(self.owned_namespace(project).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{run, Context, ObjectKey};
    use crate::testing::FakeStore;
    use kloud_common::crd::{ManagedObject, ProjectSpec};
    use kloud_common::finalizer::FOREGROUND_FINALIZER;
    use kloud_common::notifier::NoopStatusNotifier;
    use kloud_common::reconcile::ReconcileOutcome;
    use std::sync::Mutex;
    use tracing::Span;

    type Namespaces = Arc<Mutex<BTreeMap<String, Namespace>>>;

    /// Mock whose namespace calls operate on a shared map
    fn cluster_namespaces(state: &Namespaces) -> MockNamespaceClient {
        let mut client = MockNamespaceClient::new();
        let s = state.clone();
        client
            .expect_get_namespace()
            .returning(move |name| Ok(s.lock().unwrap().get(name).cloned()));
        let s = state.clone();
        client.expect_ensure_namespace().returning(move |name, labels| {
            let mut map = s.lock().unwrap();
            let ns = map.entry(name.to_string()).or_insert_with(|| {
                let mut ns = Namespace::default();
                ns.metadata.name = Some(name.to_string());
                ns
            });
            ns.labels_mut().extend(labels.clone());
            Ok(())
        });
        let s = state.clone();
        client.expect_delete_namespace().returning(move |name| {
            s.lock().unwrap().remove(name);
            Ok(())
        });
        client
    }

    fn context(store: Arc<FakeStore<Project>>, namespaces: MockNamespaceClient) -> Context<ProjectReconciler> {
        Context::new(
            ProjectReconciler::new(Arc::new(namespaces)),
            store,
            Arc::new(NoopStatusNotifier),
            Span::none(),
        )
    }

    /// Story: the full lifecycle of the "acme" project
    #[tokio::test]
    async fn story_acme_project_lifecycle() {
        let state = Namespaces::default();
        let store = Arc::new(FakeStore::default());
        let key = store.insert(Project::new("acme", ProjectSpec::default()));
        let ctx = context(store.clone(), cluster_namespaces(&state));

        // First pass: finalizer added, requeue
        let outcome = run(&key, &ctx).await;
        assert!(matches!(outcome, ReconcileOutcome::Retry(_)));
        let project = store.object(&key).unwrap();
        assert_eq!(project.metadata.finalizers, Some(vec![PROJECT_FINALIZER.to_string()]));
        assert!(state.lock().unwrap().is_empty());

        // Second pass: namespace created, condition set, generation observed
        assert!(run(&key, &ctx).await.is_done());
        assert!(state.lock().unwrap().contains_key("acme"));
        let project = store.object(&key).unwrap();
        let status = project.status.clone().unwrap();
        assert!(status.is_ready);
        assert_eq!(status.observed_generation, Some(1));
        let cond = condition::find(&status.conditions, NAMESPACE_EXISTS).unwrap();
        assert!(cond.is_true());
        assert_eq!(status.display_vars[NAMESPACE_VAR], "acme");

        // Steady state: no writes
        let writes = (store.metadata_writes(), store.status_writes());
        assert!(run(&key, &ctx).await.is_done());
        assert!(run(&key, &ctx).await.is_done());
        assert_eq!((store.metadata_writes(), store.status_writes()), writes);
        assert_eq!(
            condition::find(store.object(&key).unwrap().conditions(), NAMESPACE_EXISTS)
                .unwrap()
                .last_transition_time,
            cond.last_transition_time
        );

        // Deletion: namespace removed, finalizer released, object gone
        store.request_deletion(&key);
        assert!(run(&key, &ctx).await.is_done());
        assert!(state.lock().unwrap().is_empty());
        assert!(store.object(&key).is_none());
    }

    /// Story: foreground deletion waits for the namespace to disappear
    #[tokio::test]
    async fn story_foreground_finalizer_waits_for_namespace() {
        let state = Namespaces::default();
        let store = Arc::new(FakeStore::default());
        let key = store.insert(Project::new("acme", ProjectSpec::default()));

        // Namespace deletion is asynchronous: delete only marks it
        let mut namespaces = MockNamespaceClient::new();
        let s = state.clone();
        namespaces
            .expect_get_namespace()
            .returning(move |name| Ok(s.lock().unwrap().get(name).cloned()));
        let s = state.clone();
        namespaces.expect_ensure_namespace().returning(move |name, labels| {
            let mut ns = Namespace::default();
            ns.metadata.name = Some(name.to_string());
            ns.metadata.labels = Some(labels.clone());
            s.lock().unwrap().insert(name.to_string(), ns);
            Ok(())
        });
        namespaces.expect_delete_namespace().returning(|_| Ok(()));
        let ctx = context(store.clone(), namespaces);

        run(&key, &ctx).await;
        run(&key, &ctx).await;
        store.add_finalizer(&key, FOREGROUND_FINALIZER);
        store.request_deletion(&key);

        // Project finalizer removed after cleanup, foreground marker kept
        assert!(run(&key, &ctx).await.is_done());
        let project = store.object(&key).unwrap();
        assert_eq!(
            project.metadata.finalizers,
            Some(vec![FOREGROUND_FINALIZER.to_string()])
        );

        // Namespace still present: keep waiting
        assert!(matches!(run(&key, &ctx).await, ReconcileOutcome::Retry(_)));
        assert!(store.object(&key).is_some());

        // Namespace gone: marker released and the object disappears
        state.lock().unwrap().clear();
        assert!(run(&key, &ctx).await.is_done());
        assert!(store.object(&key).is_none());
    }

    fn targeting(name: &str, namespace: &str) -> Project {
        Project::new(
            name,
            ProjectSpec {
                target_namespace: Some(namespace.into()),
                display_name: None,
            },
        )
    }

    /// Story: two projects name the same namespace; the second neither
    /// adopts it nor deletes it
    #[tokio::test]
    async fn story_shared_target_namespace_stays_with_its_first_owner() {
        let state = Namespaces::default();
        let store = Arc::new(FakeStore::default());
        let acme = store.insert(targeting("acme", "shared"));
        let beta = store.insert(targeting("beta", "shared"));
        let ctx = context(store.clone(), cluster_namespaces(&state));

        run(&acme, &ctx).await;
        assert!(run(&acme, &ctx).await.is_done());

        run(&beta, &ctx).await;
        let outcome = run(&beta, &ctx).await;
        assert!(matches!(outcome, ReconcileOutcome::Retry(_)));
        let status = store.object(&beta).unwrap().status.unwrap();
        assert!(!status.is_ready);
        assert_eq!(
            condition::find(&status.conditions, NAMESPACE_EXISTS).unwrap().reason,
            "OwnedByAnotherProject"
        );
        assert!(status.display_vars.is_empty());
        assert_eq!(
            state.lock().unwrap()["shared"].labels()[PROJECT_NAME_LABEL],
            "acme"
        );

        // Deleting the second project leaves the namespace alone
        store.request_deletion(&beta);
        assert!(run(&beta, &ctx).await.is_done());
        assert!(store.object(&beta).is_none());
        assert!(state.lock().unwrap().contains_key("shared"));
        assert!(run(&acme, &ctx).await.is_done());

        // Deleting its owner removes it
        store.request_deletion(&acme);
        assert!(run(&acme, &ctx).await.is_done());
        assert!(state.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreground_wait_tracks_the_recorded_namespace() {
        let state = Namespaces::default();
        let store = Arc::new(FakeStore::default());
        let key = store.insert(Project::new("acme", ProjectSpec::default()));
        let ctx = context(store.clone(), cluster_namespaces(&state));
        run(&key, &ctx).await;
        run(&key, &ctx).await;

        // Retargeted but not yet applied: the recorded namespace is the child
        let mut project = store.object(&key).unwrap();
        project.spec.target_namespace = Some("acme-prod".into());
        assert!(ctx.reconciler.child_exists(&project).await.unwrap());

        state.lock().unwrap().remove("acme");
        assert!(!ctx.reconciler.child_exists(&project).await.unwrap());
    }

    #[tokio::test]
    async fn changed_target_namespace_resyncs() {
        let state = Namespaces::default();
        let store = Arc::new(FakeStore::default());
        let key = store.insert(Project::new("acme", ProjectSpec::default()));
        let ctx = context(store.clone(), cluster_namespaces(&state));

        run(&key, &ctx).await;
        run(&key, &ctx).await;

        let mut project = store.object(&key).unwrap();
        project.spec.target_namespace = Some("acme-prod".into());
        assert!(ctx.reconciler.needs_resync(&project));
        assert!(!ctx.reconciler.needs_resync(&store.object(&key).unwrap()));
    }

    #[tokio::test]
    async fn namespace_owned_by_another_project_is_not_ready() {
        let mut namespaces = MockNamespaceClient::new();
        namespaces.expect_get_namespace().returning(|_| {
            let mut ns = Namespace::default();
            ns.metadata.labels = Some(BTreeMap::from([(
                PROJECT_NAME_LABEL.to_string(),
                "other".to_string(),
            )]));
            Ok(Some(ns))
        });
        let reconciler = ProjectReconciler::new(Arc::new(namespaces));

        let observation = reconciler
            .observe(&Project::new("acme", ProjectSpec::default()))
            .await
            .unwrap();
        assert_eq!(observation.conditions[0].reason, "OwnedByAnotherProject");
        assert!(!reconciler.is_ready(&observation.conditions));
    }

    #[tokio::test]
    async fn invalid_target_namespace_is_a_validation_error() {
        let reconciler = ProjectReconciler::new(Arc::new(MockNamespaceClient::new()));
        let project = Project::new(
            "acme",
            ProjectSpec {
                target_namespace: Some("Acme_Prod".into()),
                display_name: None,
            },
        );
        let err = reconciler.apply(&project).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn namespace_events_map_to_the_labelled_project() {
        let graph = ProjectReconciler::watch_graph();
        let mut ns = Namespace::default();
        ns.metadata.name = Some("acme-prod".into());
        ns.metadata.labels = Some(BTreeMap::from([(
            PROJECT_NAME_LABEL.to_string(),
            "acme".to_string(),
        )]));
        let requests = graph.requests_for("Namespace", &ns.metadata);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].name, "acme");
    }

    #[test]
    fn namespace_names_are_validated() {
        assert!(validate_namespace_name("acme-prod").is_ok());
        assert!(validate_namespace_name("-acme").is_err());
        assert!(validate_namespace_name("").is_err());
        assert!(validate_namespace_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn object_keys_of_cluster_scoped_projects_have_no_namespace() {
        let project = Project::new("acme", ProjectSpec::default());
        assert_eq!(ObjectKey::of(&project).to_string(), "acme");
    }
}
