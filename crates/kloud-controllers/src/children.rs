//! Rendering owned children from templates

use serde::Serialize;
use serde_json::{json, Value};

use kloud_common::apply::{split_manifest, Applier, ObjectId};
use kloud_common::condition::Condition;
use kloud_common::crd::ManagedObject;
use kloud_common::kind_registry::KindRegistry;
use kloud_common::template::TemplateEngine;
use kloud_common::watch_graph::owner_reference;
use kloud_common::Error;

/// Render `template` with `values` and make every document owned by `owner`
pub fn render_owned<K, S>(
    engine: &TemplateEngine,
    template: &str,
    values: &S,
    owner: &K,
) -> Result<Vec<Value>, Error>
where
    K: ManagedObject,
    S: Serialize,
{
    let rendered = engine.render(template, values)?;
    let reference = owner_reference(owner).ok_or_else(|| {
        Error::internal_with_context("render", "owner has no uid yet")
    })?;
    split_manifest(&rendered)?
        .into_iter()
        .map(|(_, mut doc)| {
            doc["metadata"]["ownerReferences"] = json!([reference]);
            Ok(doc)
        })
        .collect()
}

/// Apply documents in order
pub async fn apply_all(applier: &dyn Applier, docs: &[Value]) -> Result<Vec<ObjectId>, Error> {
    let mut applied = Vec::with_capacity(docs.len());
    for doc in docs {
        applied.push(applier.apply_object(doc).await?);
    }
    Ok(applied)
}

/// Conditions of an unstructured child plus a `ready_type` condition summarising it
///
/// The child's own conditions are prefixed with its kind. A missing child
/// yields only a `False` `ready_type` condition.
pub async fn child_conditions(
    applier: &dyn Applier,
    registry: &KindRegistry,
    id: &ObjectId,
    ready_type: &str,
) -> Result<Vec<Condition>, Error> {
    let schema = registry.resolve(&id.api_version, &id.kind).await?;
    let Some(child) = applier.get_object(id).await? else {
        return Ok(vec![Condition::failed(
            ready_type,
            "NotFound",
            format!("{} {} does not exist", id.kind, id.name),
        )]);
    };
    let mut conditions = schema.conditions(&child);
    conditions.retain(|c| c.type_ != ready_type);
    conditions.push(if schema.is_ready(&child) {
        Condition::ok(ready_type)
    } else {
        Condition::failed(
            ready_type,
            "NotReady",
            format!("{} {} is not ready", id.kind, id.name),
        )
    });
    Ok(conditions)
}
