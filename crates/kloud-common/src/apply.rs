//! Applying rendered manifests to the cluster
//!
//! Two paths exist. Typed children (Namespace, Secret) go through
//! [`create_or_update`], a read-modify-write that relies on the object's
//! `resourceVersion` for optimistic concurrency. Rendered manifests of
//! arbitrary kinds go through an [`Applier`]: each `---` document is
//! server-side applied under [`FIELD_MANAGER`]. Fields dropped from a
//! rendered document are pruned from the live object on the next apply.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(any(test, feature = "mocks"))]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::kind_registry::{KindRegistry, KindSchema};
use crate::yaml::parse_yaml_multi;
use crate::Error;

/// Field manager recorded on objects written by the apply layer
pub const FIELD_MANAGER: &str = "kloud-operator";

/// Identity of an unstructured object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectId {
    /// apiVersion of the object
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name of the object
    pub name: String,
}

impl ObjectId {
    /// Identity of a namespaced object
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Read the identity of a manifest document
    pub fn from_value(doc: &Value) -> Result<Self, Error> {
        let field = |pointer: &str, what: &str| {
            doc.pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::internal_with_context("apply", format!("manifest missing {what}")))
        };
        Ok(Self {
            api_version: field("/apiVersion", "apiVersion")?,
            kind: field("/kind", "kind")?,
            name: field("/metadata/name", "metadata.name")?,
            namespace: doc
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Split a multi-document manifest into validated documents
///
/// Empty documents are skipped. Every remaining document must carry
/// `apiVersion`, `kind` and `metadata.name`.
pub fn split_manifest(manifest: &str) -> Result<Vec<(ObjectId, Value)>, Error> {
    let docs = parse_yaml_multi(manifest)
        .map_err(|e| Error::internal_with_context("apply", format!("invalid YAML: {e}")))?;
    docs.into_iter()
        .map(|doc| Ok((ObjectId::from_value(&doc)?, doc)))
        .collect()
}

/// Applies and reads unstructured objects
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply every document of a rendered manifest, in order
    async fn apply_yaml(&self, manifest: &str) -> Result<Vec<ObjectId>, Error>;

    /// Server-side apply one unstructured object, creating it when missing
    async fn apply_object(&self, obj: &Value) -> Result<ObjectId, Error>;

    /// Fetch an unstructured object as JSON, `None` when missing
    async fn get_object(&self, id: &ObjectId) -> Result<Option<Value>, Error>;

    /// Delete an unstructured object; already-missing objects are fine
    async fn delete_object(&self, id: &ObjectId) -> Result<(), Error>;
}

/// Server-side apply parameters; conflicts with other managers are forced
pub fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// [`Applier`] backed by the Kubernetes API and the kind registry
pub struct KubeApplier {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeApplier {
    /// Create an applier resolving kinds through `registry`
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    fn api_for(
        &self,
        schema: &KindSchema,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let ar = &schema.api_resource;
        match (schema.namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, ar)),
            (true, None) => Err(Error::validation(format!(
                "{} is namespaced but no namespace was given",
                ar.kind
            ))),
            (false, _) => Ok(Api::all_with(self.client.clone(), ar)),
        }
    }
}

#[async_trait]
impl Applier for KubeApplier {
    async fn apply_yaml(&self, manifest: &str) -> Result<Vec<ObjectId>, Error> {
        let mut applied = Vec::new();
        for (_, doc) in split_manifest(manifest)? {
            applied.push(self.apply_object(&doc).await?);
        }
        Ok(applied)
    }

    async fn apply_object(&self, obj: &Value) -> Result<ObjectId, Error> {
        let id = ObjectId::from_value(obj)?;
        let schema = self.registry.resolve(&id.api_version, &id.kind).await?;
        let api = self.api_for(&schema, id.namespace.as_deref())?;

        api.patch(&id.name, &apply_params(), &Patch::Apply(obj)).await?;
        debug!(kind = %id.kind, name = %id.name, namespace = ?id.namespace, "Applied object");
        Ok(id)
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Option<Value>, Error> {
        let schema = self.registry.resolve(&id.api_version, &id.kind).await?;
        let api = self.api_for(&schema, id.namespace.as_deref())?;
        match api.get_opt(&id.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<(), Error> {
        let schema = self.registry.resolve(&id.api_version, &id.kind).await?;
        let api = self.api_for(&schema, id.namespace.as_deref())?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of [`create_or_update`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The object did not exist and was created
    Created,
    /// The object existed and `mutate` changed it
    Updated,
    /// The object existed and already matched
    Unchanged,
}

/// Read-modify-write of a typed object
///
/// `mutate` is applied to the live object (or to a fresh default object named
/// `name`). Unchanged objects are not written. Updates carry the live
/// `resourceVersion`, so a concurrent writer causes a 409 that the caller
/// retries from the top.
pub async fn create_or_update<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<(K, Applied), Error>
where
    K: Resource + Clone + Default + Serialize + DeserializeOwned + std::fmt::Debug,
    F: Fn(&mut K),
{
    match api.get_opt(name).await? {
        Some(mut live) => {
            let before = serde_json::to_value(&live)?;
            mutate(&mut live);
            if serde_json::to_value(&live)? == before {
                return Ok((live, Applied::Unchanged));
            }
            let updated = api.replace(name, &PostParams::default(), &live).await?;
            debug!(name = %updated.name_any(), "Updated object");
            Ok((updated, Applied::Updated))
        }
        None => {
            let mut fresh = K::default();
            fresh.meta_mut().name = Some(name.to_string());
            mutate(&mut fresh);
            let created = api.create(&PostParams::default(), &fresh).await?;
            info!(name = %created.name_any(), "Created object");
            Ok((created, Applied::Created))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_manifest_validates_every_document() {
        let docs = split_manifest(
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\n  namespace: acme\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: api\n  namespace: acme\n",
        )
        .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].0,
            ObjectId {
                api_version: "v1".into(),
                kind: "Secret".into(),
                namespace: Some("acme".into()),
                name: "creds".into(),
            }
        );
        assert_eq!(docs[1].1["kind"], "Deployment");
    }

    #[test]
    fn split_manifest_rejects_documents_without_identity() {
        let err = split_manifest("apiVersion: v1\nkind: Secret\nmetadata: {}\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));

        let err = split_manifest("kind: Secret\nmetadata:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
    }

    #[test]
    fn split_manifest_rejects_bad_yaml() {
        assert!(split_manifest("a: [").is_err());
    }

    #[test]
    fn rendered_objects_are_server_side_applied_by_the_operator() {
        let params = apply_params();
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(params.force);
        assert!(!params.dry_run);
    }

    #[test]
    fn cluster_scoped_objects_have_no_namespace() {
        let docs = split_manifest("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: acme\n").unwrap();
        assert_eq!(docs[0].0.namespace, None);
    }
}
