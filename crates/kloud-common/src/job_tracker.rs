//! Batch job lifecycle tracking
//!
//! The phase of a job is never stored; it is derived on every call from the
//! live Job's conditions, so re-observing a job mid-transition self-heals.
//! A job that is not the caller's current target ("stale") is left alone
//! while it runs, and deleted once finished so that a fresh job can start.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PropagationPolicy};
use kube::Client;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Error;

/// Lifecycle phase of a batch job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    /// Not started, suspended, or waiting for a previous job
    #[default]
    Pending,
    /// At least one pod is active
    Running,
    /// Job reported `Complete=True`
    Succeeded,
    /// Job reported `Failed=True`
    Failed,
}

impl JobPhase {
    /// Whether the phase is terminal
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of a job derived from its live object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    /// Job namespace
    pub namespace: String,
    /// Job name
    pub name: String,
    /// Derived phase
    pub phase: JobPhase,
    /// Message from the deciding condition, if any
    pub message: Option<String>,
}

fn true_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a k8s_openapi::api::batch::v1::JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Derive the phase of a job from its conditions and active pod count
pub fn job_phase(job: &Job) -> JobPhase {
    if true_condition(job, "Complete").is_some() {
        JobPhase::Succeeded
    } else if true_condition(job, "Failed").is_some() {
        JobPhase::Failed
    } else if true_condition(job, "Suspended").is_some() {
        JobPhase::Pending
    } else if job
        .status
        .as_ref()
        .and_then(|s| s.active)
        .is_some_and(|active| active > 0)
    {
        JobPhase::Running
    } else {
        JobPhase::Pending
    }
}

/// Build a [`JobRecord`] for a live job
pub fn job_record(job: &Job) -> JobRecord {
    let phase = job_phase(job);
    let message = match phase {
        JobPhase::Failed => true_condition(job, "Failed").and_then(|c| c.message.clone()),
        JobPhase::Succeeded => true_condition(job, "Complete").and_then(|c| c.message.clone()),
        JobPhase::Pending => true_condition(job, "Suspended").and_then(|c| c.message.clone()),
        JobPhase::Running => None,
    };
    JobRecord {
        namespace: job.metadata.namespace.clone().unwrap_or_default(),
        name: job.metadata.name.clone().unwrap_or_default(),
        phase,
        message,
    }
}

/// What the tracker observed for a job name
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobTracking {
    /// No job exists under that name; the caller may create the target job
    Absent,
    /// The target job exists; its phase is authoritative
    Current(JobRecord),
    /// A previous job is still running and must finish first
    WaitingForPrevious(JobRecord),
    /// A finished previous job was deleted; wait for a fresh job to start
    PreviousCleared,
}

impl JobTracking {
    /// The phase reported to the owner of the job
    pub fn phase(&self) -> JobPhase {
        match self {
            Self::Current(record) => record.phase,
            _ => JobPhase::Pending,
        }
    }
}

/// Job access needed by the tracker
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Get a job, `None` if it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// Delete a job together with its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;
}

/// [`JobClient`] backed by the Kubernetes API
pub struct KubeJobClient {
    client: Client,
}

impl KubeJobClient {
    /// Create a job client for the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&Default::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Observe the job `namespace/name`
///
/// `is_target` decides whether an existing job is the one the caller wants
/// right now (for example, the job for the current generation).
pub async fn track_job(
    client: &dyn JobClient,
    namespace: &str,
    name: &str,
    is_target: &(dyn Fn(&Job) -> bool + Send + Sync),
) -> Result<JobTracking, Error> {
    let Some(job) = client.get_job(namespace, name).await? else {
        return Ok(JobTracking::Absent);
    };

    let record = job_record(&job);
    if is_target(&job) {
        return Ok(JobTracking::Current(record));
    }

    if !record.phase.is_finished() {
        info!(job = %name, namespace = %namespace, phase = %record.phase, "Waiting for previous job to finish");
        return Ok(JobTracking::WaitingForPrevious(JobRecord {
            phase: JobPhase::Pending,
            message: Some("waiting for previous jobs to finish".to_string()),
            ..record
        }));
    }

    info!(job = %name, namespace = %namespace, phase = %record.phase, "Deleting finished previous job");
    client.delete_job(namespace, name).await?;
    Ok(JobTracking::PreviousCleared)
}
