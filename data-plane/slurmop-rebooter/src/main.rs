use envconfig::Envconfig;
use kube::Client;
use slurmop_rebooter::{agent, config::RebooterConfig, init_tracing};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = RebooterConfig::init_from_env()?;
    init_tracing("info", cfg.json_logs());

    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(?e, "CryptoProvider already installed; proceeding");
    }

    info!(node = %cfg.node_name, "starting reboot agent");

    let client = Client::try_default().await?;
    agent::run(client, cfg).await
}
