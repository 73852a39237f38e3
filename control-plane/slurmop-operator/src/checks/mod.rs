//! Node health checks: the Kubernetes node state machine, its scheduler-side
//! counterpart and the registry of per-cluster scheduler clients.

pub mod api_clients;
pub mod drain;
pub mod k8s_nodes;
pub mod slurm_nodes;
pub mod storage;


use std::sync::Arc;

use kube::Client;
use slurmop_node::{KubeNodeClient, NodeClient};
use slurmop_slurm::ClientSet;
use tokio::try_join;

use crate::config::OperatorConfig;
use crate::controller::Backoff;

/// Shared state of one checks controller. Each controller gets its own so
/// that backoff keys of different controllers never collide.
pub struct ChecksContext {
    pub client: Client,
    pub nodes: Arc<dyn NodeClient>,
    pub clients: ClientSet,
    pub cfg: OperatorConfig,
    pub backoff: Backoff,
}

impl ChecksContext {
    pub fn new(client: Client, clients: ClientSet, cfg: OperatorConfig) -> Self {
        Self {
            nodes: Arc::new(KubeNodeClient::new(client.clone())),
            client,
            clients,
            cfg,
            backoff: Backoff::default(),
        }
    }
}

/// Runs the checks controllers until shutdown.
pub async fn run_checks(
    client: Client,
    cfg: OperatorConfig,
    clients: ClientSet,
) -> anyhow::Result<()> {
    let ctx = || {
        Arc::new(ChecksContext::new(
            client.clone(),
            clients.clone(),
            cfg.clone(),
        ))
    };
    try_join!(
        api_clients::run(ctx()),
        k8s_nodes::run(ctx()),
        slurm_nodes::run(ctx()),
    )?;
    Ok(())
}
