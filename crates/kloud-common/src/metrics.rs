//! OpenTelemetry instruments for the operator
//!
//! Instruments are created lazily on the global meter, so recording before
//! [`crate::telemetry::init_telemetry`] is harmless (it goes to a no-op provider).

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("kloud"));

/// Reconcile passes
///
/// Labels:
/// - `controller`: project, app, router, ...
/// - `result`: ok, retry, error
pub static RECONCILES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kloud_reconciles_total")
        .with_description("Total number of reconcile passes")
        .with_unit("{reconciles}")
        .build()
});

/// Reconcile pass duration
///
/// Labels:
/// - `controller`
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kloud_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Status updates that could not be published
///
/// Labels:
/// - `kind`
pub static NOTIFICATION_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kloud_status_notification_failures_total")
        .with_description("Total number of status notifications that failed to publish")
        .with_unit("{notifications}")
        .build()
});

/// Admission requests handled by the webhook
///
/// Labels:
/// - `kind`: Pod, Service
/// - `operation`: CREATE, DELETE, ...
/// - `result`: patched, allowed, denied, error
pub static ADMISSION_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kloud_admission_requests_total")
        .with_description("Total number of admission requests")
        .with_unit("{requests}")
        .build()
});

/// Label value for a reconcile result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Converged
    Ok,
    /// Not ready yet, requeued
    Retry,
    /// Failed with an error
    Error,
}

impl ReconcileResult {
    /// Metric label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

/// Record one reconcile pass
pub fn record_reconcile(controller: &str, result: ReconcileResult, seconds: f64) {
    RECONCILES_TOTAL.add(
        1,
        &[
            KeyValue::new("controller", controller.to_string()),
            KeyValue::new("result", result.as_str()),
        ],
    );
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("controller", controller.to_string())]);
}

/// Record one admission request
pub fn record_admission(kind: &str, operation: &str, result: &'static str) {
    ADMISSION_REQUESTS.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_provider_is_harmless() {
        record_reconcile("project", ReconcileResult::Retry, 0.01);
        record_admission("Pod", "CREATE", "patched");
        assert_eq!(ReconcileResult::Error.as_str(), "error");
    }
}
