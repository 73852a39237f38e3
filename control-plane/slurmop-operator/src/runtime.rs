use kube::Client;
use slurmop_slurm::ClientSet;
use tokio::{task::JoinHandle, try_join};

use crate::{
    checks::run_checks, config::OperatorConfig, controller::run_controller,
};

/// Spawn the `SlurmCluster` controller loop.
pub fn spawn_controller(
    client: Client,
    cfg: OperatorConfig,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controller(client, cfg).await })
}

/// Spawn the node checks, sharing `clients` between them.
pub fn spawn_checks(
    client: Client,
    cfg: OperatorConfig,
    clients: ClientSet,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_checks(client, cfg, clients).await })
}

async fn flatten(task: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    task.await?
}

/// Waits for both tasks. The first one to fail, by error or panic, ends the
/// wait with its error; otherwise returns once both have finished.
pub async fn join_tasks(
    a: JoinHandle<anyhow::Result<()>>,
    b: JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    try_join!(flatten(a), flatten(b))?;
    Ok(())
}

/// Start the cluster controller and the checks. Returns when both have shut
/// down or as soon as either fails.
pub async fn run_all(client: Client, cfg: OperatorConfig) -> anyhow::Result<()> {
    let clients = ClientSet::new();

    let controller = spawn_controller(client.clone(), cfg.clone());
    let checks = spawn_checks(client, cfg, clients);
    join_tasks(controller, checks).await
}
