//! Reconcile outcomes and the shared controller error policy
//!
//! Every reconcile step returns a [`ReconcileOutcome`]. The outcome is
//! converted into a kube-rs [`Action`] (or an error that the error policy
//! turns into a delayed requeue) at the controller boundary.

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{error, warn};

use crate::Error;

/// Requeue delay for "not ready yet, check again soon"
pub const DEFAULT_RETRY: Duration = Duration::from_secs(2);

/// Requeue delay for retryable errors without an explicit hint
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Result of one reconcile step
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next watch event
    Done,
    /// Not converged yet; reconcile again after the delay
    Retry(Duration),
    /// Failed; reconcile again after the delay and surface the error
    RetryWithError(Duration, Error),
}

impl ReconcileOutcome {
    /// Converged
    pub fn ok() -> Self {
        Self::Done
    }

    /// Requeue after `after` with no error
    pub fn retry(after: Duration) -> Self {
        Self::Retry(after)
    }

    /// Requeue after [`DEFAULT_RETRY`]
    pub fn retry_soon() -> Self {
        Self::Retry(DEFAULT_RETRY)
    }

    /// Requeue after `after` and surface `err`
    pub fn retry_with_error(after: Duration, err: Error) -> Self {
        Self::RetryWithError(after, err)
    }

    /// Requeue after [`ERROR_REQUEUE`] and surface `err`
    pub fn failed(err: Error) -> Self {
        Self::RetryWithError(ERROR_REQUEUE, err)
    }

    /// Whether this outcome ends the pass without further work
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Convert into the kube-rs reconcile return value
    ///
    /// Errors keep their delay as a requeue hint that [`error_policy_action`] honours.
    pub fn into_action(self) -> Result<Action, Error> {
        match self {
            Self::Done => Ok(Action::await_change()),
            Self::Retry(after) => Ok(Action::requeue(after)),
            Self::RetryWithError(after, err) => Err(err.retry_after(after)),
        }
    }
}

impl From<Result<(), Error>> for ReconcileOutcome {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::Done,
            Err(e) => Self::failed(e),
        }
    }
}

/// Error policy shared by all controllers
///
/// Honours an explicit requeue hint, retries transient errors after
/// [`ERROR_REQUEUE`], and waits for a spec change otherwise.
pub fn error_policy_action(err: &Error) -> Action {
    if let Some(after) = err.requeue_hint() {
        warn!(error = %err, retry_in = ?after, "Reconcile failed, retrying");
        return Action::requeue(after);
    }
    if err.is_retryable() {
        error!(error = %err, "Reconcile failed with retryable error");
        Action::requeue(ERROR_REQUEUE)
    } else {
        error!(error = %err, "Reconcile failed, waiting for spec change");
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;

    #[test]
    fn done_waits_for_change() {
        assert_eq!(
            ReconcileOutcome::ok().into_action().unwrap(),
            Action::await_change()
        );
    }

    #[test]
    fn retry_requeues_without_error() {
        let action = ReconcileOutcome::retry(Duration::from_secs(5))
            .into_action()
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[test]
    fn retry_with_error_surfaces_the_error_with_its_delay() {
        let err = ReconcileOutcome::retry_with_error(
            Duration::from_secs(7),
            Error::database_for("orders", "boom"),
        )
        .into_action()
        .unwrap_err();

        assert_eq!(err.requeue_hint(), Some(Duration::from_secs(7)));
        assert_eq!(
            error_policy_action(&err),
            Action::requeue(Duration::from_secs(7))
        );
    }

    #[test]
    fn error_policy_distinguishes_retryable_errors() {
        assert_eq!(
            error_policy_action(&Error::from(api_error(500))),
            Action::requeue(ERROR_REQUEUE)
        );
        assert_eq!(
            error_policy_action(&Error::validation("bad spec")),
            Action::await_change()
        );
    }

    #[test]
    fn results_convert_into_outcomes() {
        assert!(ReconcileOutcome::from(Ok(())).is_done());
        assert!(matches!(
            ReconcileOutcome::from(Err(Error::internal("x"))),
            ReconcileOutcome::RetryWithError(ERROR_REQUEUE, _)
        ));
    }
}
