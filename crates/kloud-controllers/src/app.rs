//! App controller
//!
//! Renders a Deployment and a Service from the App spec. When the App
//! declares a pre-deploy job, each new generation is rolled out only after
//! that generation's job succeeded. Status is read back from the
//! Deployment, the app's pods and their containers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use kube::api::{Api, ListParams, ObjectMeta};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use tracing::info;

use kloud_common::apply::{Applier, ObjectId};
use kloud_common::condition::{self, Condition, ConditionStatus};
use kloud_common::crd::{App, ManagedObject};
use kloud_common::job_tracker::{track_job, JobClient, JobPhase, JobTracking};
use kloud_common::kind_registry::KindRegistry;
use kloud_common::template::TemplateEngine;
use kloud_common::watch_graph::{any_child, owner_reference, ParentMapping, WatchGraph};
use kloud_common::{Error, APP_NAME_LABEL, GENERATION_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

use crate::children::{apply_all, render_owned};
use crate::engine::{ApplyOutcome, Observation, Reconciler};

/// Finalizer held by the app controller
pub const APP_FINALIZER: &str = "finalizers.kloud.dev/app";

/// Condition gating rollout on the pre-deploy job
pub const PRE_DEPLOY_JOB_CONDITION: &str = "PreDeployJobSucceeded";

const DEPLOYMENT_READY: &str = "DeploymentAvailable";
const CONTAINER_PREFIX: &str = "Container";
const APP_TEMPLATE: &str = include_str!("../templates/app.yaml");

/// Name of the pre-deploy job of an app
pub fn pre_deploy_job_name(app: &str) -> String {
    format!("{app}-pre-deploy")
}

/// Pod listing used to read app status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;
}

/// [`PodClient`] backed by the Kubernetes API
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AppValues<'a> {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    image: &'a str,
    replicas: i32,
    port: i32,
    args: &'a [String],
    env: Vec<EnvVar<'a>>,
}

#[derive(Serialize)]
struct EnvVar<'a> {
    name: &'a str,
    value: &'a str,
}

/// Reconciles [`App`]s
pub struct AppReconciler {
    applier: Arc<dyn Applier>,
    jobs: Arc<dyn JobClient>,
    pods: Arc<dyn PodClient>,
    registry: Arc<KindRegistry>,
    templates: TemplateEngine,
}

impl AppReconciler {
    /// Create a reconciler
    pub fn new(
        applier: Arc<dyn Applier>,
        jobs: Arc<dyn JobClient>,
        pods: Arc<dyn PodClient>,
        registry: Arc<KindRegistry>,
    ) -> Self {
        Self {
            applier,
            jobs,
            pods,
            registry,
            templates: TemplateEngine::new(),
        }
    }

    /// Deployments and jobs map back through their owner, pods through their label
    pub fn watch_graph() -> WatchGraph<App> {
        WatchGraph::namespaced()
            .edge::<Deployment>(ParentMapping::ControllerOwner, any_child)
            .edge::<Job>(ParentMapping::ControllerOwner, any_child)
            .edge::<Pod>(ParentMapping::Label(APP_NAME_LABEL), any_child)
    }

    fn child_labels(app: &App) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_NAME_LABEL.to_string(), app.name_any()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ])
    }

    fn render(&self, app: &App) -> Result<Vec<serde_json::Value>, Error> {
        let values = AppValues {
            name: app.name_any(),
            namespace: app.namespace().unwrap_or_default(),
            labels: Self::child_labels(app),
            image: &app.spec.image,
            replicas: app.spec.replicas(),
            port: app.spec.port(),
            args: &app.spec.args,
            env: app
                .spec
                .env
                .iter()
                .map(|(name, value)| EnvVar { name, value })
                .collect(),
        };
        render_owned(&self.templates, APP_TEMPLATE, &values, app)
    }

    /// Track the pre-deploy job of the current generation
    ///
    /// Returns `None` when rollout may proceed.
    async fn pre_deploy_gate(&self, app: &App) -> Result<Option<Condition>, Error> {
        let Some(spec) = &app.spec.pre_deploy_job else {
            return Ok(None);
        };
        let namespace = app.namespace().unwrap_or_default();
        let name = pre_deploy_job_name(&app.name_any());
        let generation = app.generation().to_string();
        let is_target =
            move |job: &Job| job.labels().get(GENERATION_LABEL) == Some(&generation);

        let blocked = |reason: &str, message: String| {
            Some(Condition::failed(PRE_DEPLOY_JOB_CONDITION, reason, message))
        };
        Ok(match track_job(self.jobs.as_ref(), &namespace, &name, &is_target).await? {
            JobTracking::Absent => {
                let job = build_pre_deploy_job(app, spec.image.as_deref(), &spec.command)?;
                self.jobs.create_job(&namespace, &job).await?;
                info!(job = %name, generation = app.generation(), "Created pre-deploy job");
                blocked("Pending", format!("pre-deploy job {name} created"))
            }
            JobTracking::Current(record) => match record.phase {
                JobPhase::Succeeded => None,
                JobPhase::Failed => blocked(
                    "Failed",
                    record
                        .message
                        .unwrap_or_else(|| format!("pre-deploy job {name} failed")),
                ),
                phase => blocked(&phase.to_string(), format!("pre-deploy job {name} is {phase}")),
            },
            JobTracking::WaitingForPrevious(record) => blocked(
                "WaitingForPrevious",
                record.message.unwrap_or_default(),
            ),
            JobTracking::PreviousCleared => blocked(
                "PreviousCleared",
                "previous pre-deploy job deleted, starting a new one".to_string(),
            ),
        })
    }
}

/// Build the pre-deploy job for the app's current generation
fn build_pre_deploy_job(app: &App, image: Option<&str>, command: &[String]) -> Result<Job, Error> {
    let owner = owner_reference(app)
        .ok_or_else(|| Error::internal_with_context("app", "app has no uid yet"))?;
    let mut labels = AppReconciler::child_labels(app);
    labels.insert(GENERATION_LABEL.to_string(), app.generation().to_string());

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(pre_deploy_job_name(&app.name_any())),
            namespace: app.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "pre-deploy".to_string(),
                        image: Some(image.unwrap_or(&app.spec.image).to_string()),
                        command: (!command.is_empty()).then(|| command.to_vec()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Collapse per-pod conditions of one type into a single condition
///
/// True only when every pod reports True; messages name the failing pods.
fn aggregate(type_: String, entries: Vec<(String, bool, String)>) -> Condition {
    let failing: Vec<String> = entries
        .iter()
        .filter(|(_, ok, _)| !ok)
        .map(|(pod, _, msg)| {
            if msg.is_empty() {
                pod.clone()
            } else {
                format!("{pod}: {msg}")
            }
        })
        .collect();
    if failing.is_empty() {
        Condition::ok(type_)
    } else {
        Condition::failed(type_, "NotReady", failing.join("; "))
    }
}

/// Conditions derived from the app's pods
///
/// Pod conditions become `Pod<Type>`, container readiness becomes
/// `Container<Name>Ready`.
pub fn pod_conditions(pods: &[Pod]) -> Vec<Condition> {
    let mut by_type: BTreeMap<String, Vec<(String, bool, String)>> = BTreeMap::new();
    for pod in pods {
        let name = pod.name_any();
        let Some(status) = &pod.status else {
            continue;
        };
        for c in status.conditions.iter().flatten() {
            by_type.entry(format!("Pod{}", c.type_)).or_default().push((
                name.clone(),
                ConditionStatus::parse(&c.status) == ConditionStatus::True,
                c.message.clone().unwrap_or_default(),
            ));
        }
        for cs in status.container_statuses.iter().flatten() {
            let waiting = cs
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone())
                .unwrap_or_default();
            by_type
                .entry(format!("{CONTAINER_PREFIX}{}Ready", cs.name))
                .or_default()
                .push((name.clone(), cs.ready, waiting));
        }
    }
    by_type
        .into_iter()
        .map(|(type_, entries)| aggregate(type_, entries))
        .collect()
}

#[async_trait]
impl Reconciler for AppReconciler {
    type Resource = App;
    const NAME: &'static str = "app";
    const FINALIZER: &'static str = APP_FINALIZER;

    fn labels(&self, app: &App) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_NAME_LABEL.to_string(), app.name_any())])
    }

    async fn apply(&self, app: &App) -> Result<ApplyOutcome, Error> {
        if app.spec.image.is_empty() {
            return Err(Error::validation_for_field(
                app.name_any(),
                "spec.image",
                "image is required",
            ));
        }
        if let Some(gate) = self.pre_deploy_gate(app).await? {
            return Ok(ApplyOutcome::Blocked(vec![gate]));
        }
        let docs = self.render(app)?;
        apply_all(self.applier.as_ref(), &docs).await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn observe(&self, app: &App) -> Result<Observation, Error> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let schema = self.registry.resolve("apps/v1", "Deployment").await?;

        let mut conditions =
            match self
                .applier
                .get_object(&ObjectId::namespaced("apps/v1", "Deployment", &namespace, &name))
                .await?
            {
                Some(deployment) => schema.conditions(&deployment),
                None => vec![Condition::failed(
                    DEPLOYMENT_READY,
                    "NotFound",
                    format!("deployment {name} does not exist"),
                )],
            };

        let selector = format!("{APP_NAME_LABEL}={name}");
        let pods = self.pods.list_pods(&namespace, &selector).await?;
        conditions.extend(pod_conditions(&pods));
        Ok(Observation::conditions(conditions))
    }

    fn is_ready(&self, conditions: &[Condition]) -> bool {
        condition::is_true(conditions, DEPLOYMENT_READY)
            && conditions
                .iter()
                .filter(|c| c.type_.starts_with(CONTAINER_PREFIX))
                .all(Condition::is_true)
    }

    async fn child_exists(&self, app: &App) -> Result<bool, Error> {
        let id = ObjectId::namespaced(
            "apps/v1",
            "Deployment",
            app.namespace().unwrap_or_default(),
            app.name_any(),
        );
        Ok(self.applier.get_object(&id).await?.is_some())
    }
}
