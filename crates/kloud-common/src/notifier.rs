//! Status notifications to the message bus
//!
//! After every reconcile pass the controller publishes the object's condition
//! snapshot so downstream consumers can show live status. Publishing is
//! **fire-and-forget**: failures are logged and counted, never propagated.
//! The next reconcile pass republishes the latest snapshot.

use async_trait::async_trait;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::condition::Condition;
use crate::metrics;
use crate::Error;

/// Subject segment used for cluster-scoped objects
pub const CLUSTER_SCOPE: &str = "_";

/// Condition snapshot published for one object
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// `namespace/name` (or `name` for cluster-scoped objects)
    pub key: String,
    /// Current conditions
    pub conditions: Vec<Condition>,
    /// Whether the object is ready
    pub status: bool,
}

/// Where an update is published
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusTarget {
    /// Object kind, e.g. "Project"
    pub kind: String,
    /// Object namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl StatusTarget {
    /// Message key for this object
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Bus subject under `prefix`: `<prefix>.<namespace>.<kind>.<name>`
    pub fn subject(&self, prefix: &str) -> String {
        format!(
            "{prefix}.{}.{}.{}",
            self.namespace.as_deref().unwrap_or(CLUSTER_SCOPE),
            self.kind.to_lowercase(),
            self.name
        )
    }
}

/// Publishes status snapshots
///
/// Implementations never return errors to the reconcile loop.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Publish the snapshot for `target`
    async fn notify(&self, target: &StatusTarget, update: &StatusUpdate);
}

/// [`StatusNotifier`] publishing JSON to NATS
pub struct NatsStatusNotifier {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsStatusNotifier {
    /// Connect to NATS at `url`
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self, Error> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::notification(format!("failed to connect to {url}: {e}")))?;
        Ok(Self::new(client, subject_prefix))
    }

    /// Wrap an existing NATS client
    pub fn new(client: async_nats::Client, subject_prefix: impl Into<String>) -> Self {
        Self {
            client,
            subject_prefix: subject_prefix.into(),
        }
    }

    async fn publish(&self, target: &StatusTarget, update: &StatusUpdate) -> Result<(), Error> {
        let payload = serde_json::to_vec(update)?;
        let subject = target.subject(&self.subject_prefix);
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| Error::notification(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl StatusNotifier for NatsStatusNotifier {
    async fn notify(&self, target: &StatusTarget, update: &StatusUpdate) {
        match self.publish(target, update).await {
            Ok(()) => debug!(key = %update.key, ready = update.status, "Published status"),
            Err(e) => {
                metrics::NOTIFICATION_FAILURES.add(
                    1,
                    &[opentelemetry::KeyValue::new("kind", target.kind.clone())],
                );
                warn!(key = %update.key, error = %e, "Failed to publish status update");
            }
        }
    }
}

/// No-op notifier for tests and for running without a message bus
pub struct NoopStatusNotifier;

#[async_trait]
impl StatusNotifier for NoopStatusNotifier {
    async fn notify(&self, _target: &StatusTarget, _update: &StatusUpdate) {}
}
