//! Two-phase scheduler drain of the worker pods running on a Kubernetes
//! node: request the drain, then confirm every backing scheduler node is
//! fully drained before recording anything on the Kubernetes side.

use std::sync::{Arc, LazyLock};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use regex::Regex;
use slurmop_node::{ConditionUpdate, NodeClient, set_node_condition};
use slurmop_slurm::{ClientSet, ClusterKey, SlurmApi};
use tracing::{debug, info, warn};

use crate::templates::LABEL_INSTANCE;
use crate::{Error, Result};

static WORKER_POD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^worker-\d+$").expect("valid regex"));

pub fn is_worker_pod(name: &str) -> bool {
    WORKER_POD.is_match(name)
}

/// A scheduler node backed by a worker pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingNode {
    pub cluster: ClusterKey,
    pub name: String,
}

/// The scheduler node a pod backs, if it is a worker pod. The cluster comes
/// from the pod namespace and its instance label.
pub fn backing_node(pod: &Pod) -> Option<BackingNode> {
    let name = pod.name_any();
    if !is_worker_pod(&name) {
        return None;
    }
    let cluster = ClusterKey::new(
        pod.namespace().unwrap_or_default(),
        pod.labels().get(LABEL_INSTANCE)?.clone(),
    );
    Some(BackingNode { cluster, name })
}

/// Worker pods among `pods` as scheduler nodes. With `scope` set, pods of
/// other clusters are left out.
pub fn backing_nodes(
    pods: &[Pod],
    scope: Option<&ClusterKey>,
) -> Vec<BackingNode> {
    pods.iter()
        .filter_map(backing_node)
        .filter(|node| scope.is_none_or(|s| *s == node.cluster))
        .collect()
}

pub struct Drainer<'a> {
    nodes: &'a dyn NodeClient,
    clients: &'a ClientSet,
}

impl<'a> Drainer<'a> {
    pub fn new(nodes: &'a dyn NodeClient, clients: &'a ClientSet) -> Self {
        Self { nodes, clients }
    }

    async fn client(&self, cluster: &ClusterKey) -> Result<Arc<dyn SlurmApi>> {
        self.clients.get(cluster).await.ok_or_else(|| {
            Error::internal(format!("no scheduler client for cluster {cluster}"))
        })
    }

    /// Drains every scheduler node backed by `k8s_node` with `reason` and,
    /// once all of them report fully drained, writes `on_drained` to the
    /// Kubernetes node. Returns whether the drain is complete.
    pub async fn drain_and_confirm(
        &self,
        k8s_node: &str,
        reason: &str,
        scope: Option<&ClusterKey>,
        on_drained: Option<&ConditionUpdate>,
    ) -> Result<bool> {
        let pods = self.nodes.list_pods_on_node(k8s_node).await?;
        let backing = backing_nodes(&pods, scope);

        let mut first_err = None;
        for node in &backing {
            let res = match self.client(&node.cluster).await {
                Ok(api) => {
                    api.drain_node(&node.name, reason).await.map_err(Error::from)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!(
                    k8s_node,
                    slurm_node = %node.name,
                    error = %e,
                    "drain request failed"
                );
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        for node in &backing {
            let api = self.client(&node.cluster).await?;
            let current = api.get_node(&node.name).await?;
            if !current.is_fully_drained() {
                debug!(
                    k8s_node,
                    slurm_node = %node.name,
                    states = ?current.states,
                    "not fully drained yet"
                );
                return Ok(false);
            }
        }

        info!(
            k8s_node,
            nodes = backing.len(),
            %reason,
            "scheduler nodes fully drained"
        );
        if let Some(update) = on_drained {
            set_node_condition(self.nodes, k8s_node, update).await?;
        }
        Ok(true)
    }

    pub async fn resume(
        &self,
        cluster: &ClusterKey,
        slurm_node: &str,
    ) -> Result<()> {
        self.client(cluster).await?.resume_node(slurm_node).await?;
        info!(%cluster, slurm_node, "scheduler node resumed");
        Ok(())
    }

    /// Holds `slurm_node` in a maintenance reservation named
    /// `<prefix>-<slurm_node>`.
    pub async fn reserve(
        &self,
        cluster: &ClusterKey,
        slurm_node: &str,
        prefix: &str,
    ) -> Result<()> {
        let reservation = format!("{prefix}-{slurm_node}");
        self.client(cluster)
            .await?
            .create_reservation(&reservation, slurm_node)
            .await?;
        info!(%cluster, slurm_node, %reservation, "scheduler node reserved");
        Ok(())
    }
}
