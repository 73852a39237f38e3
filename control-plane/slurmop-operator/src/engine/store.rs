use async_trait::async_trait;
use kube::{
    Client, Resource,
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
};
#[cfg(test)]
use mockall::automock;

use crate::Result;
use crate::engine::ManagedResource;

/// Minimal CRUD contract the reconcile engine needs from the cluster API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: ManagedResource>: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Full replacement, guarded by the resource version carried in `obj`.
    async fn replace(&self, obj: &K) -> Result<K>;

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<K>;

    /// Deleting an object that is already gone succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ManagedResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K: ManagedResource> ObjectStore<K> for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        Ok(self.api::<K>(&ns).create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let ns = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        Ok(self
            .api::<K>(&ns)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::<()>::Json(patch.clone()),
            )
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
