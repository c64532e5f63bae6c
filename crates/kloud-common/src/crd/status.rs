//! Status shared by every kloud custom resource

use std::collections::BTreeMap;
use std::fmt::Debug;

use kube::Resource;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Status block of every managed object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Controller-computed readiness
    #[serde(default)]
    pub is_ready: bool,

    /// Generation the conditions were computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Values published for display (load balancer IPs, namespace, secret names)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub display_vars: BTreeMap<String, String>,

    /// Summary of failing conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A custom resource reconciled by a kloud controller
pub trait ManagedObject:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Current status, if any was written
    fn status(&self) -> Option<&ResourceStatus>;

    /// Mutable status, created empty when missing
    fn status_mut(&mut self) -> &mut ResourceStatus;

    /// `status.observedGeneration`, 0 when never observed
    fn observed_generation(&self) -> i64 {
        self.status()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0)
    }

    /// `metadata.generation`, 0 when unset
    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    /// Current conditions
    fn conditions(&self) -> &[Condition] {
        self.status().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }
}

macro_rules! managed_object {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl $crate::crd::ManagedObject for $kind {
                fn status(&self) -> Option<&$crate::crd::ResourceStatus> {
                    self.status.as_ref()
                }

                fn status_mut(&mut self) -> &mut $crate::crd::ResourceStatus {
                    self.status.get_or_insert_with(Default::default)
                }
            }
        )+
    };
}

pub(crate) use managed_object;
