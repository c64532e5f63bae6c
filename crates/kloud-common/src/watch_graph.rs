//! Owner references and child -> parent watch mapping
//!
//! Each controller declares a [`WatchGraph`]: one edge per child kind, with a
//! predicate deciding which child events matter and a [`ParentMapping`]
//! naming the parent to reconcile. Edges are plain data evaluated against
//! the child's metadata; duplicate requests are left to the controller's
//! work queue, which already de-duplicates per object.

use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use tracing::debug;

/// Build a controller owner reference pointing at `owner`
///
/// Children carrying it are garbage collected with the owner, and foreground
/// deletion of the owner waits for them.
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let mut reference = owner.controller_owner_ref(&())?;
    reference.block_owner_deletion = Some(true);
    Some(reference)
}

/// The controller owner reference of `meta` if it points at `kind`
pub fn controller_owner<'a>(meta: &'a ObjectMeta, kind: &str) -> Option<&'a OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == kind)
}

/// Whether `meta` is owned by an object of `kind` named `name`
pub fn is_owned_by(meta: &ObjectMeta, kind: &str, name: &str) -> bool {
    controller_owner(meta, kind).is_some_and(|r| r.name == name)
}

/// How a child event names the parent to reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentMapping {
    /// The child's controller owner reference
    ControllerOwner,
    /// A label on the child holding the parent's name
    Label(&'static str),
    /// The parent has the same name as the child
    SameName,
}

/// Predicate over child metadata
pub type ChildPredicate = fn(&ObjectMeta) -> bool;

/// Accept every child event
pub fn any_child(_: &ObjectMeta) -> bool {
    true
}

/// One edge of the graph
#[derive(Clone, Debug)]
pub struct WatchEdge {
    /// Kind of the watched child
    pub child_kind: String,
    /// Which child events are relevant
    pub predicate: ChildPredicate,
    /// How to find the parent
    pub mapping: ParentMapping,
}

/// Adjacency from child kinds to parent reconcile requests for parent kind `P`
pub struct WatchGraph<P> {
    parent_namespaced: bool,
    edges: Vec<WatchEdge>,
    _parent: PhantomData<fn() -> P>,
}

impl<P> WatchGraph<P>
where
    P: Resource<DynamicType = ()> + 'static,
{
    /// Graph for a namespaced parent; children map to parents in their own namespace
    pub fn namespaced() -> Self {
        Self {
            parent_namespaced: true,
            edges: Vec::new(),
            _parent: PhantomData,
        }
    }

    /// Graph for a cluster-scoped parent
    pub fn cluster() -> Self {
        Self {
            parent_namespaced: false,
            edges: Vec::new(),
            _parent: PhantomData,
        }
    }

    /// Add an edge for child kind `C`
    pub fn edge<C>(mut self, mapping: ParentMapping, predicate: ChildPredicate) -> Self
    where
        C: Resource<DynamicType = ()>,
    {
        self.edges.push(WatchEdge {
            child_kind: C::kind(&()).into_owned(),
            predicate,
            mapping,
        });
        self
    }

    /// Child kinds with an edge in this graph
    pub fn child_kinds(&self) -> Vec<&str> {
        self.edges.iter().map(|e| e.child_kind.as_str()).collect()
    }

    /// Parent reconcile requests for an event on a child of `child_kind`
    pub fn requests_for(&self, child_kind: &str, meta: &ObjectMeta) -> Vec<ObjectRef<P>> {
        let parent_kind = P::kind(&());
        let mut requests: Vec<ObjectRef<P>> = self
            .edges
            .iter()
            .filter(|e| e.child_kind == child_kind && (e.predicate)(meta))
            .filter_map(|e| {
                let name = match &e.mapping {
                    ParentMapping::ControllerOwner => controller_owner(meta, &parent_kind)?.name.clone(),
                    ParentMapping::Label(key) => meta.labels.as_ref()?.get(*key)?.clone(),
                    ParentMapping::SameName => meta.name.clone()?,
                };
                let reference = ObjectRef::new(&name);
                Some(match (self.parent_namespaced, meta.namespace.as_deref()) {
                    (true, Some(ns)) => reference.within(ns),
                    _ => reference,
                })
            })
            .collect();
        requests.dedup();
        if !requests.is_empty() {
            debug!(child_kind, parent_kind = %parent_kind, count = requests.len(), "Mapped child event to parents");
        }
        requests
    }

    /// Mapper for `Controller::watches` on child kind `C`
    pub fn mapper<C>(self: &Arc<Self>) -> impl Fn(C) -> Vec<ObjectRef<P>> + Send + Sync + 'static
    where
        C: Resource<DynamicType = ()>,
    {
        let graph = Arc::clone(self);
        let kind = C::kind(&()).into_owned();
        move |child: C| graph.requests_for(&kind, child.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{App, AppSpec, Project};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Namespace, Pod};
    use std::collections::BTreeMap;

    fn app() -> App {
        let mut app = App::new("api", AppSpec::default());
        app.metadata.namespace = Some("acme".into());
        app.metadata.uid = Some("uid-1".into());
        app
    }

    fn owned_by_app(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some("acme".into()),
            owner_references: owner_reference(&app()).map(|r| vec![r]),
            ..Default::default()
        }
    }

    #[test]
    fn owner_reference_is_a_blocking_controller_reference() {
        let reference = owner_reference(&app()).unwrap();
        assert_eq!(reference.kind, "App");
        assert_eq!(reference.name, "api");
        assert_eq!(reference.controller, Some(true));
        assert_eq!(reference.block_owner_deletion, Some(true));
        assert!(is_owned_by(&owned_by_app("api"), "App", "api"));
        assert!(!is_owned_by(&owned_by_app("api"), "Router", "api"));
    }

    #[test]
    fn owner_reference_needs_a_uid() {
        assert!(owner_reference(&App::new("api", AppSpec::default())).is_none());
    }

    #[test]
    fn controller_owner_edges_map_within_the_child_namespace() {
        let graph = WatchGraph::<App>::namespaced()
            .edge::<Deployment>(ParentMapping::ControllerOwner, any_child);

        let requests = graph.requests_for("Deployment", &owned_by_app("api"));
        assert_eq!(requests, vec![ObjectRef::<App>::new("api").within("acme")]);
        assert!(graph.requests_for("Pod", &owned_by_app("api")).is_empty());
    }

    #[test]
    fn label_edges_respect_predicates() {
        fn running(meta: &ObjectMeta) -> bool {
            meta.deletion_timestamp.is_none()
        }
        let graph = WatchGraph::<App>::namespaced()
            .edge::<Pod>(ParentMapping::Label("kloud.dev/app.name"), running);

        let labelled = ObjectMeta {
            name: Some("api-7d9f".into()),
            namespace: Some("acme".into()),
            labels: Some(BTreeMap::from([(
                "kloud.dev/app.name".to_string(),
                "api".to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(graph.requests_for("Pod", &labelled).len(), 1);
        assert!(graph
            .requests_for("Pod", &ObjectMeta { labels: None, ..labelled })
            .is_empty());
    }

    #[test]
    fn cluster_scoped_parents_ignore_child_namespace() {
        let graph = Arc::new(
            WatchGraph::<Project>::cluster()
                .edge::<Namespace>(ParentMapping::Label("kloud.dev/project.name"), any_child),
        );
        let mut ns = Namespace::default();
        ns.metadata.name = Some("acme".into());
        ns.metadata.labels = Some(BTreeMap::from([(
            "kloud.dev/project.name".to_string(),
            "acme".to_string(),
        )]));

        let map = graph.mapper::<Namespace>();
        assert_eq!(map(ns), vec![ObjectRef::<Project>::new("acme")]);
        assert_eq!(graph.child_kinds(), vec!["Namespace"]);
    }
}
