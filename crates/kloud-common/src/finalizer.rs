//! Two-phase finalizer protocol
//!
//! A managed object carries its resource-specific finalizer for its whole
//! life. On deletion the resource-specific cleanup runs first, and the
//! finalizer is removed only once cleanup succeeded. If the object was
//! deleted with foreground propagation, the `foregroundDeletion` marker is
//! released only after the dependent child is gone.

use async_trait::async_trait;
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use kube::api::ObjectMeta;
use tracing::{info, warn};

use crate::reconcile::{ReconcileOutcome, DEFAULT_RETRY};
use crate::Error;

/// Finalizer the API server uses for foreground cascading deletion
pub const FOREGROUND_FINALIZER: &str = "foregroundDeletion";

/// What the finalizer protocol requires for the current object state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerStep {
    /// Not deleting and the resource finalizer is missing: add it and requeue
    Add,
    /// Not deleting and the resource finalizer is present: continue reconciling
    Proceed,
    /// Deleting and the resource finalizer is present: run cleanup, then remove it
    Cleanup,
    /// Deleting with only the foreground marker left: wait for the child to disappear
    AwaitChildren,
    /// Deleting with nothing left to release
    Released,
}

/// Whether deletion has been requested for the object
pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Whether the object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// The object's finalizers with `finalizer` appended if missing
pub fn with_finalizer(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|s| s == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// The object's finalizers with `finalizer` removed
pub fn without_finalizer(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default()
}

/// Decide the protocol step for the object's current metadata
pub fn plan(meta: &ObjectMeta, finalizer: &str) -> FinalizerStep {
    if !is_deleting(meta) {
        return if has_finalizer(meta, finalizer) {
            FinalizerStep::Proceed
        } else {
            FinalizerStep::Add
        };
    }
    if has_finalizer(meta, finalizer) {
        FinalizerStep::Cleanup
    } else if has_finalizer(meta, FOREGROUND_FINALIZER) {
        FinalizerStep::AwaitChildren
    } else {
        FinalizerStep::Released
    }
}

/// Side effects the protocol needs from the owning controller
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait FinalizerHooks: Send + Sync {
    /// Replace the object's finalizer list
    async fn set_finalizers(&self, finalizers: Vec<String>) -> Result<(), Error>;

    /// Resource-specific teardown (drop a database user, delete a namespace)
    async fn cleanup(&self) -> Result<(), Error>;

    /// Whether the dependent child guarded by the foreground marker still exists
    async fn child_exists(&self) -> Result<bool, Error>;
}

/// Run the finalizer protocol for one pass
///
/// Returns `None` when the object is live and already finalized, meaning
/// the caller should continue with the rest of the reconcile loop.
pub async fn drive(
    meta: &ObjectMeta,
    finalizer: &str,
    hooks: &dyn FinalizerHooks,
) -> Option<ReconcileOutcome> {
    let name = meta.name.as_deref().unwrap_or_default();
    match plan(meta, finalizer) {
        FinalizerStep::Proceed => None,
        FinalizerStep::Add => {
            info!(object = %name, finalizer, "Adding finalizer");
            Some(match hooks.set_finalizers(with_finalizer(meta, finalizer)).await {
                Ok(()) => ReconcileOutcome::retry(std::time::Duration::ZERO),
                Err(e) => ReconcileOutcome::failed(e),
            })
        }
        FinalizerStep::Cleanup => {
            if let Err(e) = hooks.cleanup().await {
                warn!(object = %name, error = %e, "Finalizer cleanup failed");
                return Some(ReconcileOutcome::retry_with_error(DEFAULT_RETRY, e));
            }
            info!(object = %name, finalizer, "Cleanup complete, removing finalizer");
            Some(
                match hooks
                    .set_finalizers(without_finalizer(meta, finalizer))
                    .await
                {
                    Ok(()) => ReconcileOutcome::ok(),
                    Err(e) => ReconcileOutcome::retry_with_error(DEFAULT_RETRY, e),
                },
            )
        }
        FinalizerStep::AwaitChildren => Some(match hooks.child_exists().await {
            Ok(true) => {
                info!(object = %name, "Waiting for dependent child to be deleted");
                ReconcileOutcome::retry_soon()
            }
            Ok(false) => {
                info!(object = %name, "Dependent child gone, releasing foreground finalizer");
                match hooks
                    .set_finalizers(without_finalizer(meta, FOREGROUND_FINALIZER))
                    .await
                {
                    Ok(()) => ReconcileOutcome::ok(),
                    Err(e) => ReconcileOutcome::retry_with_error(DEFAULT_RETRY, e),
                }
            }
            Err(e) => ReconcileOutcome::retry_with_error(DEFAULT_RETRY, e),
        }),
        FinalizerStep::Released => Some(ReconcileOutcome::ok()),
    }
}
