//! Readiness conditions and the condition merge algorithm
//!
//! Conditions follow Kubernetes API conventions: at most one entry per
//! `type`, and `lastTransitionTime` only moves when the status, reason or
//! message actually change. Periodic re-evaluation of an unchanged child
//! must never bump the transition time, otherwise every reconcile would
//! produce a status write.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reason stored when a condition source did not provide one
pub const REASON_NOT_SPECIFIED: &str = "NotSpecified";

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Parse a Kubernetes status string; anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "namespace-exists", "DeploymentAvailable")
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned; `None` until the merge assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Generation of the owning object when this condition was computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a condition without a transition time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    /// A `True` condition with no reason or message
    pub fn ok(type_: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, "", "")
    }

    /// A `False` condition carrying why it is not satisfied
    pub fn failed(
        type_: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(type_, ConditionStatus::False, reason, message)
    }

    /// Whether the status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    fn normalized_reason(&self) -> &str {
        if self.reason.is_empty() {
            REASON_NOT_SPECIFIED
        } else {
            &self.reason
        }
    }

    fn normalized(mut self) -> Self {
        if self.reason.is_empty() {
            self.reason = REASON_NOT_SPECIFIED.to_string();
        }
        self
    }

    fn differs_from(&self, other: &Condition) -> bool {
        self.status != other.status
            || self.normalized_reason() != other.normalized_reason()
            || self.message != other.message
    }
}

/// Merge `source` into `destination` using the current time for new transitions.
///
/// See [`patch_at`].
pub fn patch(destination: &[Condition], source: &[Condition]) -> (Vec<Condition>, bool) {
    patch_at(destination, source, Utc::now())
}

/// Merge `source` into `destination`, returning the merged set and whether it changed.
///
/// - types missing from `source` are dropped
/// - types present in both are replaced only when status, reason or message
///   differ; the replacement keeps its own transition time or gets `now`
/// - types only in `source` are appended, stamped with `now` if unset
///
/// Empty reasons are normalised to [`REASON_NOT_SPECIFIED`] before comparison,
/// so an empty reason and `NotSpecified` are the same reason.
pub fn patch_at(
    destination: &[Condition],
    source: &[Condition],
    now: DateTime<Utc>,
) -> (Vec<Condition>, bool) {
    let mut changed = false;
    let mut merged = Vec::with_capacity(source.len());

    for existing in destination {
        match source.iter().find(|c| c.type_ == existing.type_) {
            None => changed = true,
            Some(incoming) if incoming.differs_from(existing) => {
                let mut next = incoming.clone().normalized();
                next.last_transition_time.get_or_insert(now);
                merged.push(next);
                changed = true;
            }
            Some(_) => merged.push(existing.clone().normalized()),
        }
    }

    for incoming in source {
        if destination.iter().any(|c| c.type_ == incoming.type_) {
            continue;
        }
        if merged.iter().any(|c: &Condition| c.type_ == incoming.type_) {
            continue;
        }
        let mut next = incoming.clone().normalized();
        next.last_transition_time.get_or_insert(now);
        merged.push(next);
        changed = true;
    }

    (merged, changed)
}

/// Find a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and is `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(Condition::is_true)
}

/// Whether every listed condition type exists and is `True`
pub fn all_true(conditions: &[Condition], types: &[&str]) -> bool {
    types.iter().all(|t| is_true(conditions, t))
}

/// Prefix every condition type with the name of the source that reported it
///
/// Keeps conditions from different child kinds apart (`Available` from a
/// Deployment becomes `DeploymentAvailable`).
pub fn with_prefix(prefix: &str, conditions: Vec<Condition>) -> Vec<Condition> {
    conditions
        .into_iter()
        .map(|mut c| {
            c.type_ = format!("{prefix}{}", c.type_);
            c
        })
        .collect()
}

/// Collect messages from every non-`True` condition, for a status summary line
pub fn failure_summary(conditions: &[Condition]) -> Option<String> {
    let parts: Vec<String> = conditions
        .iter()
        .filter(|c| !c.is_true())
        .map(|c| {
            if c.message.is_empty() {
                format!("{}: {}", c.type_, c.normalized_reason())
            } else {
                format!("{}: {}", c.type_, c.message)
            }
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn stamped(type_: &str, status: ConditionStatus, reason: &str, at: i64) -> Condition {
        Condition {
            last_transition_time: Some(t(at)),
            ..Condition::new(type_, status, reason, "")
        }
    }

    #[test]
    fn patching_a_set_with_itself_is_a_no_op() {
        let d = vec![
            stamped("namespace-exists", ConditionStatus::True, "Created", 10),
            stamped("DeploymentAvailable", ConditionStatus::False, "MinimumReplicasUnavailable", 20),
        ];

        let (merged, changed) = patch_at(&d, &d, t(99));

        assert!(!changed);
        assert_eq!(merged, d);
    }

    #[test]
    fn empty_reason_matches_not_specified() {
        let dest = vec![stamped("Ready", ConditionStatus::True, REASON_NOT_SPECIFIED, 10)];
        let source = vec![Condition::ok("Ready")];

        let (merged, changed) = patch_at(&dest, &source, t(99));

        assert!(!changed);
        assert_eq!(merged[0].last_transition_time, Some(t(10)));
        assert_eq!(merged[0].reason, REASON_NOT_SPECIFIED);
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let dest = vec![stamped("PodReady", ConditionStatus::True, "Ok", 10)];
        let source = vec![Condition::new("PodReady", ConditionStatus::True, "Ok", "")];

        let (merged, changed) = patch_at(&dest, &source, t(50));

        assert!(!changed);
        assert_eq!(merged[0].last_transition_time, Some(t(10)));
    }

    #[test]
    fn status_flip_replaces_and_stamps_now() {
        let dest = vec![stamped("PodReady", ConditionStatus::False, "Starting", 10)];
        let source = vec![Condition::ok("PodReady")];

        let (merged, changed) = patch_at(&dest, &source, t(50));

        assert!(changed);
        assert!(merged[0].is_true());
        assert_eq!(merged[0].last_transition_time, Some(t(50)));
        assert_eq!(merged[0].reason, REASON_NOT_SPECIFIED);
    }

    #[test]
    fn source_transition_time_wins_when_present() {
        let dest = vec![stamped("JobComplete", ConditionStatus::False, "Running", 10)];
        let source = vec![stamped("JobComplete", ConditionStatus::True, "Done", 42)];

        let (merged, changed) = patch_at(&dest, &source, t(99));

        assert!(changed);
        assert_eq!(merged[0].last_transition_time, Some(t(42)));
    }

    #[test]
    fn message_change_counts_as_a_change() {
        let dest = vec![stamped("Ready", ConditionStatus::False, "Waiting", 10)];
        let mut next = dest[0].clone();
        next.message = "0/1 replicas available".into();
        next.last_transition_time = None;

        let (merged, changed) = patch_at(&dest, &[next], t(30));

        assert!(changed);
        assert_eq!(merged[0].message, "0/1 replicas available");
        assert_eq!(merged[0].last_transition_time, Some(t(30)));
    }

    #[test]
    fn types_missing_from_source_are_dropped() {
        let dest = vec![
            stamped("PodReady", ConditionStatus::True, "Ok", 10),
            stamped("ContainerappReady", ConditionStatus::True, "Ok", 10),
        ];
        let source = vec![Condition::new("PodReady", ConditionStatus::True, "Ok", "")];

        let (merged, changed) = patch_at(&dest, &source, t(50));

        assert!(changed);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].type_, "PodReady");
    }

    #[test]
    fn new_types_are_appended_in_source_order() {
        let dest = vec![stamped("A", ConditionStatus::True, "Ok", 10)];
        let source = vec![
            Condition::new("A", ConditionStatus::True, "Ok", ""),
            Condition::ok("C"),
            Condition::failed("B", "NotFound", "child missing"),
        ];

        let (merged, changed) = patch_at(&dest, &source, t(50));

        assert!(changed);
        let types: Vec<_> = merged.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["A", "C", "B"]);
        assert_eq!(merged[1].last_transition_time, Some(t(50)));
        assert_eq!(merged[0].last_transition_time, Some(t(10)));
    }

    #[test]
    fn duplicate_source_types_collapse_to_the_first() {
        let source = vec![Condition::ok("Ready"), Condition::failed("Ready", "x", "y")];
        let (merged, changed) = patch_at(&[], &source, t(1));
        assert!(changed);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_true());
    }

    #[test]
    fn readiness_helpers() {
        let conds = vec![
            Condition::ok("namespace-exists"),
            Condition::failed("IngressCreated", "NotFound", "ingress missing"),
        ];
        assert!(is_true(&conds, "namespace-exists"));
        assert!(!is_true(&conds, "IngressCreated"));
        assert!(!is_true(&conds, "missing"));
        assert!(all_true(&conds, &["namespace-exists"]));
        assert!(!all_true(&conds, &["namespace-exists", "IngressCreated"]));
        assert_eq!(
            failure_summary(&conds).as_deref(),
            Some("IngressCreated: ingress missing")
        );
    }

    #[test]
    fn prefixing_keeps_sources_apart() {
        let conds = with_prefix("Deployment", vec![Condition::ok("Available")]);
        assert_eq!(conds[0].type_, "DeploymentAvailable");
    }

    #[test]
    fn status_serializes_with_kubernetes_field_names() {
        let c = stamped("Ready", ConditionStatus::True, "Ok", 0);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
        assert!(json.get("observedGeneration").is_none());
    }
}
