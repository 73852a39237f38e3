use std::marker::PhantomData;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::engine::ownership::is_owned_by;
use crate::engine::versioning::{Dependency, read_version_map, stamp_versions};
use crate::engine::{ManagedResource, ObjectStore, describe};
use crate::{Error, Result};

#[derive(Debug)]
pub enum Deployed<K> {
    Existing(K),
    Created(K),
}

#[derive(Debug)]
pub enum Updated<K> {
    Replaced(K),
    Unchanged(K),
}

/// What the controller wants for one object of a kind.
#[derive(Debug)]
pub enum Desired<K> {
    Present(K),
    /// Not needed: remove the object at this key if the owner created it.
    Absent { namespace: String, name: String },
}

fn object_key<K: ManagedResource>(obj: &K) -> Result<(String, String)> {
    let meta = obj.meta();
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| Error::missing(describe(obj), "metadata.namespace"))?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| Error::missing(describe(obj), "metadata.name"))?;
    Ok((namespace, name))
}

fn set_controller_ref(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| r.uid != owner.uid && r.controller != Some(true));
    refs.push(owner.clone());
}

/// Creates `desired` unless an object already exists at its key.
pub async fn ensure_deployed<K, S>(
    store: &S,
    desired: &mut K,
    owner: &OwnerReference,
    deps: &[Dependency],
) -> Result<Deployed<K>>
where
    K: ManagedResource,
    S: ObjectStore<K> + ?Sized,
{
    let (namespace, name) = object_key(desired)?;
    if let Some(existing) = store.get(&namespace, &name).await? {
        return Ok(Deployed::Existing(existing));
    }

    set_controller_ref(desired.meta_mut(), owner);
    if !deps.is_empty() {
        stamp_versions(desired, deps)?;
    }
    let created = store.create(desired).await?;
    info!(resource = %describe(desired), "created");
    Ok(Deployed::Created(created))
}

/// Replaces the live object with `desired` when the dependency versions
/// differ; does nothing otherwise.
pub async fn ensure_updated<K, S>(
    store: &S,
    desired: &mut K,
    owner: &OwnerReference,
    deps: &[Dependency],
) -> Result<Updated<K>>
where
    K: ManagedResource,
    S: ObjectStore<K> + ?Sized,
{
    let (namespace, name) = object_key(desired)?;
    let resource = describe(desired);
    let existing = store
        .get(&namespace, &name)
        .await?
        .ok_or_else(|| Error::internal(format!("{resource} not found")))?;

    stamp_versions(desired, deps)?;
    let current = read_version_map(existing.meta(), &resource)?;
    let wanted = read_version_map(desired.meta(), &resource)?;
    if current == wanted {
        return Ok(Updated::Unchanged(existing));
    }

    set_controller_ref(desired.meta_mut(), owner);
    desired.meta_mut().resource_version = existing.resource_version();
    let replaced = store.replace(desired).await?;
    info!(%resource, "dependency versions changed, replaced");
    Ok(Updated::Replaced(replaced))
}

/// Deletes the object at the key only if `owner` is among its owners.
/// Returns whether a delete was issued.
pub async fn delete_if_owned<K, S>(
    store: &S,
    namespace: &str,
    name: &str,
    owner: &OwnerReference,
) -> Result<bool>
where
    K: ManagedResource,
    S: ObjectStore<K> + ?Sized,
{
    let Some(obj) = store.get(namespace, name).await? else {
        return Ok(false);
    };
    if !is_owned_by(obj.meta(), &owner.kind, &owner.name) {
        debug!(
            resource = %describe(&obj),
            owner = %owner.name,
            "not owned by this cluster, leaving it alone"
        );
        return Ok(false);
    }
    store.delete(namespace, name).await?;
    info!(resource = %describe(&obj), "deleted unneeded object");
    Ok(true)
}

/// JSON patch that applies the owned fields of `desired` onto `existing`.
pub fn owned_fields_patch<K: ManagedResource>(
    existing: &K,
    desired: &K,
) -> Result<json_patch::Patch> {
    let before = serde_json::to_value(existing)?;
    let mut patched = existing.clone();
    patched.copy_owned_fields(desired);
    let after = serde_json::to_value(&patched)?;
    Ok(json_patch::diff(&before, &after))
}

/// Create, patch owned fields, then gate a full update on dependency
/// versions, for objects of kind `K`.
pub struct KindReconciler<'a, K, S: ?Sized> {
    store: &'a S,
    owner: &'a OwnerReference,
    _kind: PhantomData<fn() -> K>,
}

impl<'a, K, S> KindReconciler<'a, K, S>
where
    K: ManagedResource,
    S: ObjectStore<K> + ?Sized,
{
    pub fn new(store: &'a S, owner: &'a OwnerReference) -> Self {
        Self {
            store,
            owner,
            _kind: PhantomData,
        }
    }

    pub async fn reconcile(
        &self,
        desired: Desired<K>,
        deps: &[Dependency],
    ) -> Result<()> {
        let mut desired = match desired {
            Desired::Present(obj) => obj,
            Desired::Absent { namespace, name } => {
                delete_if_owned::<K, S>(self.store, &namespace, &name, self.owner)
                    .await?;
                return Ok(());
            }
        };

        let existing = match ensure_deployed(
            self.store,
            &mut desired.clone(),
            self.owner,
            deps,
        )
        .await?
        {
            Deployed::Created(_) => return Ok(()),
            Deployed::Existing(existing) => existing,
        };

        let patch = owned_fields_patch(&existing, &desired)?;
        if !patch.0.is_empty() {
            let (namespace, name) = object_key(&desired)?;
            debug!(
                resource = %describe(&desired),
                ops = patch.0.len(),
                "patching owned fields"
            );
            self.store.patch(&namespace, &name, &patch).await?;
        }

        ensure_updated(self.store, &mut desired, self.owner, deps).await?;
        Ok(())
    }
}
