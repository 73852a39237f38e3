//! Generic machinery that realizes desired objects in the cluster.

pub mod kinds;
pub mod multistep;
pub mod ownership;
pub mod reconciler;
pub mod store;
pub mod versioning;


use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};

pub use multistep::{Step, Strategy, execute};
pub use ownership::is_owned_by;
pub use reconciler::{Desired, KindReconciler, ensure_deployed, ensure_updated};
pub use store::{KubeStore, ObjectStore};
pub use versioning::{Dependency, stamp_versions};

/// A namespaced object kind the controller creates and owns.
pub trait ManagedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Copies the fields this controller owns from `desired` into `self`,
    /// leaving everything else as other writers left it.
    fn copy_owned_fields(&mut self, desired: &Self);

    /// Metadata of the embedded pod template, for workload kinds.
    fn template_meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        None
    }
}

/// `Kind namespace/name`, used in logs and error messages.
pub fn describe<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{} {}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}
