//! Pod and Service admission mutation
//!
//! On create, the object is registered with the gateway and stamped with
//! binding labels; pods additionally get a tunnel sidecar booted from the
//! gateway's peer config. On delete, the binding labels of the old object
//! name the binding to release. Gateway failures never block admission.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use kloud_common::metrics;

use crate::gateway::{Binding, GatewayClient, PodRegistration};

/// Label holding the overlay IP bound to the object
pub const BINDING_IP_LABEL: &str = "kloud.dev/gateway.ip";

/// Label holding the gateway binding id
pub const BINDING_UID_LABEL: &str = "kloud.dev/gateway.uid";

/// Name of the injected tunnel container
pub const SIDECAR_NAME: &str = "kloud-tunnel";

/// Environment variable carrying the base64 peer config to the sidecar
pub const PEER_CONFIG_ENV: &str = "TUNNEL_PEER_CONFIG";

/// Shared state of the admission handlers
pub struct WebhookState {
    /// Gateway admin API
    pub gateway: Arc<dyn GatewayClient>,
    /// Image of the tunnel sidecar
    pub sidecar_image: String,
}

/// What a request amounted to, for metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handled {
    Mutated,
    Released,
    Skipped,
    FailedOpen,
}

impl Handled {
    fn as_str(self) -> &'static str {
        match self {
            Self::Mutated => "mutated",
            Self::Released => "released",
            Self::Skipped => "skipped",
            Self::FailedOpen => "failed_open",
        }
    }
}

fn operation_name(op: &Operation) -> &'static str {
    match op {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        _ => "connect",
    }
}

/// The binding recorded in an object's labels, if complete
pub fn binding_from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<Binding> {
    let labels = labels?;
    Some(Binding {
        ip: labels.get(BINDING_IP_LABEL)?.clone(),
        uid: labels.get(BINDING_UID_LABEL)?.clone(),
    })
}

/// Patch operations stamping the binding labels
pub fn label_operations(
    labels: Option<&BTreeMap<String, String>>,
    binding: &Binding,
) -> Vec<PatchOperation> {
    let pairs = [
        (BINDING_IP_LABEL, binding.ip.as_str()),
        (BINDING_UID_LABEL, binding.uid.as_str()),
    ];
    if labels.is_none() {
        let all: serde_json::Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        return vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "labels"]),
            value: Value::Object(all),
        })];
    }
    pairs
        .iter()
        .map(|(k, v)| {
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "labels", k]),
                value: Value::String(v.to_string()),
            })
        })
        .collect()
}

/// Patch operation appending the tunnel sidecar
pub fn sidecar_operation(image: &str, peer_config: &str) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(["spec", "containers", "-"]),
        value: json!({
            "name": SIDECAR_NAME,
            "image": image,
            "env": [{"name": PEER_CONFIG_ENV, "value": STANDARD.encode(peer_config)}],
            "securityContext": {"capabilities": {"add": ["NET_ADMIN"]}},
        }),
    })
}

fn has_sidecar(pod: &DynamicObject) -> bool {
    pod.data
        .pointer("/spec/containers")
        .and_then(Value::as_array)
        .is_some_and(|containers| {
            containers
                .iter()
                .any(|c| c.get("name").and_then(Value::as_str) == Some(SIDECAR_NAME))
        })
}

fn respond(request: &AdmissionRequest<DynamicObject>, ops: Vec<PatchOperation>) -> AdmissionResponse {
    let allowed = AdmissionResponse::from(request);
    if ops.is_empty() {
        return allowed;
    }
    match allowed.with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Failed to serialize patch, admitting unchanged");
            AdmissionResponse::from(request)
        }
    }
}

async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, Handled) {
    match request.operation {
        Operation::Create => {
            let Some(pod) = &request.object else {
                return (AdmissionResponse::from(request), Handled::Skipped);
            };
            let labels = pod.metadata.labels.as_ref();
            if binding_from_labels(labels).is_some() || has_sidecar(pod) {
                debug!(uid = %request.uid, "Pod already bound, admitting unchanged");
                return (AdmissionResponse::from(request), Handled::Skipped);
            }
            let registration = PodRegistration {
                namespace: request.namespace.clone().unwrap_or_default(),
                name: pod
                    .metadata
                    .name
                    .clone()
                    .or_else(|| pod.metadata.generate_name.clone())
                    .unwrap_or_default(),
            };
            match state.gateway.register_pod(&registration).await {
                Ok(bound) => {
                    info!(pod = %registration.name, namespace = %registration.namespace, ip = %bound.binding.ip, "Registered pod with gateway");
                    let mut ops = label_operations(labels, &bound.binding);
                    ops.push(sidecar_operation(&state.sidecar_image, &bound.peer_config));
                    (respond(request, ops), Handled::Mutated)
                }
                Err(e) => {
                    warn!(pod = %registration.name, error = %e, "Gateway registration failed, admitting unchanged");
                    (AdmissionResponse::from(request), Handled::FailedOpen)
                }
            }
        }
        Operation::Delete => {
            let binding = request
                .old_object
                .as_ref()
                .and_then(|old| binding_from_labels(old.metadata.labels.as_ref()));
            let Some(binding) = binding else {
                return (AdmissionResponse::from(request), Handled::Skipped);
            };
            match state.gateway.release_pod(&binding).await {
                Ok(()) => {
                    info!(ip = %binding.ip, uid = %binding.uid, "Released pod binding");
                    (AdmissionResponse::from(request), Handled::Released)
                }
                Err(e) => {
                    warn!(ip = %binding.ip, error = %e, "Failed to release pod binding");
                    (AdmissionResponse::from(request), Handled::FailedOpen)
                }
            }
        }
        _ => (AdmissionResponse::from(request), Handled::Skipped),
    }
}

async fn mutate_service(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, Handled) {
    match request.operation {
        Operation::Create => {
            let Some(service) = &request.object else {
                return (AdmissionResponse::from(request), Handled::Skipped);
            };
            let labels = service.metadata.labels.as_ref();
            if binding_from_labels(labels).is_some() {
                return (AdmissionResponse::from(request), Handled::Skipped);
            }
            let namespace = request.namespace.clone().unwrap_or_default();
            let name = service.metadata.name.clone().unwrap_or_else(|| request.name.clone());
            match state.gateway.register_service(&namespace, &name).await {
                Ok(binding) => {
                    info!(service = %name, namespace = %namespace, ip = %binding.ip, "Registered service with gateway");
                    (respond(request, label_operations(labels, &binding)), Handled::Mutated)
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Gateway registration failed, admitting unchanged");
                    (AdmissionResponse::from(request), Handled::FailedOpen)
                }
            }
        }
        Operation::Delete => {
            let binding = request
                .old_object
                .as_ref()
                .and_then(|old| binding_from_labels(old.metadata.labels.as_ref()));
            let Some(binding) = binding else {
                return (AdmissionResponse::from(request), Handled::Skipped);
            };
            match state.gateway.release_service(&binding).await {
                Ok(()) => (AdmissionResponse::from(request), Handled::Released),
                Err(e) => {
                    warn!(ip = %binding.ip, error = %e, "Failed to release service binding");
                    (AdmissionResponse::from(request), Handled::FailedOpen)
                }
            }
        }
        _ => (AdmissionResponse::from(request), Handled::Skipped),
    }
}

#[derive(Clone, Copy)]
enum Target {
    Pod,
    Service,
}

impl Target {
    fn kind(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "service",
        }
    }
}

async fn review(
    target: Target,
    state: &WebhookState,
    body: AdmissionReview<DynamicObject>,
) -> Json<AdmissionReview<DynamicObject>> {
    let kind = target.kind();
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, kind, "Failed to parse admission request");
            metrics::record_admission(kind, "unknown", "invalid");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    let operation = operation_name(&request.operation);
    let (response, handled) = match target {
        Target::Pod => mutate_pod(state, &request).await,
        Target::Service => mutate_service(state, &request).await,
    };
    metrics::record_admission(kind, operation, handled.as_str());
    Json(response.into_review())
}

/// `POST /mutate/pod`
pub async fn pod_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(Target::Pod, &state, body).await
}

/// `POST /mutate/service`
pub async fn service_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    review(Target::Service, &state, body).await
}
