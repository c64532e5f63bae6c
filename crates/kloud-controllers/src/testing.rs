//! In-memory object store for multi-pass controller tests
//!
//! Behaves like the API server where the loop can observe it: writes check
//! and bump `resourceVersion`, status writes are applied as JSON merge
//! patches, and a deleting object disappears once its last finalizer is
//! removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kloud_common::crd::{ManagedObject, ResourceStatus};
use kloud_common::Error;

use crate::engine::{status_patch, MetadataPatch, ObjectKey, ObjectStore};

pub(crate) fn api_error(code: u16) -> Error {
    Error::from(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("api error {code}"),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}

pub(crate) struct FakeStore<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    metadata_writes: AtomicUsize,
    status_writes: AtomicUsize,
    conflict_next_status: AtomicBool,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            metadata_writes: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
            conflict_next_status: AtomicBool::new(false),
        }
    }
}

impl<K: ManagedObject> FakeStore<K> {
    /// Store a new object as the API server would after a create
    pub(crate) fn insert(&self, mut obj: K) -> ObjectKey {
        let meta = obj.meta_mut();
        meta.generation.get_or_insert(1);
        meta.resource_version.get_or_insert_with(|| "1".to_string());
        meta.uid.get_or_insert_with(|| "uid-1".to_string());
        let key = ObjectKey::of(&obj);
        self.objects.lock().unwrap().insert(key.clone(), obj);
        key
    }

    pub(crate) fn object(&self, key: &ObjectKey) -> Option<K> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn metadata_writes(&self) -> usize {
        self.metadata_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Simulate a spec edit
    pub(crate) fn bump_generation(&self, key: &ObjectKey) {
        self.edit(key, |obj| {
            let meta = obj.meta_mut();
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        });
    }

    /// Simulate a delete request
    pub(crate) fn request_deletion(&self, key: &ObjectKey) {
        self.edit(key, |obj| {
            obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        });
    }

    /// Add a finalizer the way the API server does for foreground deletion
    pub(crate) fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) {
        self.edit(key, |obj| {
            obj.meta_mut()
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
        });
    }

    pub(crate) fn fail_next_status_write_with_conflict(&self) {
        self.conflict_next_status.store(true, Ordering::SeqCst);
    }

    fn edit(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(key).expect("object exists");
        f(obj);
        bump_version(obj);
    }

    fn write(&self, obj: &K, f: impl FnOnce(&mut K)) -> Result<(), Error> {
        let key = ObjectKey::of(obj);
        let mut objects = self.objects.lock().unwrap();
        let Some(live) = objects.get_mut(&key) else {
            return Err(api_error(404));
        };
        if live.meta().resource_version != obj.meta().resource_version {
            return Err(api_error(409));
        }
        f(live);
        bump_version(live);

        let released = live.meta().deletion_timestamp.is_some()
            && live.meta().finalizers.as_ref().is_none_or(|f| f.is_empty());
        if released {
            objects.remove(&key);
        }
        Ok(())
    }
}

fn bump_version<K: ManagedObject>(obj: &mut K) {
    let meta = obj.meta_mut();
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

#[async_trait]
impl<K: ManagedObject> ObjectStore<K> for FakeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        Ok(self.object(key))
    }

    async fn patch_metadata(&self, obj: &K, patch: MetadataPatch) -> Result<(), Error> {
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        self.write(obj, |live| {
            let meta = live.meta_mut();
            if let Some(finalizers) = patch.finalizers {
                meta.finalizers = Some(finalizers);
            }
            if let Some(labels) = patch.labels {
                meta.labels.get_or_insert_with(BTreeMap::new).extend(labels);
            }
        })
    }

    async fn patch_status(&self, obj: &K, status: &ResourceStatus) -> Result<(), Error> {
        if self.conflict_next_status.swap(false, Ordering::SeqCst) {
            return Err(api_error(409));
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let body = status_patch(obj, status)?;
        self.write(obj, |live| {
            let mut doc = serde_json::to_value(&*live).expect("object serializes");
            json_patch::merge(&mut doc, &serde_json::json!({ "status": body["status"] }));
            *live = serde_json::from_value(doc).expect("patched object deserializes");
        })
    }
}
