#![allow(dead_code)]

use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use slurmop_operator::crd::{SlurmCluster, SlurmClusterSpec};
use slurmop_operator::crd::slurm_cluster::WorkersSpec;
use tokio::task::JoinHandle;

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

// Env guard utilities
pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}
impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}
pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}

pub fn cluster(name: &str, workers: i32) -> SlurmCluster {
    SlurmCluster::new(
        name,
        SlurmClusterSpec {
            image: "ghcr.io/nebius/slurm:24.05".into(),
            workers: WorkersSpec {
                size: workers,
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

/// Polls until `name` exists in `ns`.
pub async fn wait_for<K>(client: Client, ns: &str, name: &str) -> K
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client, ns);
    for _ in 0..60 {
        if let Ok(Some(obj)) = api.get_opt(name).await {
            return obj;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("{} {ns}/{name} not found in time", K::kind(&()));
}

/// Aborts the spawned controller and removes the test cluster on drop.
pub struct ControllerGuard {
    pub handle: JoinHandle<anyhow::Result<()>>,
    api: Api<SlurmCluster>,
    name: String,
}

impl ControllerGuard {
    pub fn new(
        handle: JoinHandle<anyhow::Result<()>>,
        client: Client,
        ns: &str,
        name: &str,
    ) -> Self {
        Self {
            handle,
            api: Api::namespaced(client, ns),
            name: name.to_string(),
        }
    }
}

impl Drop for ControllerGuard {
    fn drop(&mut self) {
        self.handle.abort();
        let api = self.api.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let _ = api.delete(&name, &Default::default()).await;
        });
    }
}
