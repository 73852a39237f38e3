use envconfig::Envconfig;
use kube::Client;
use slurmop_operator::{config::OperatorConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = OperatorConfig::init_from_env()?;
    init_tracing("info", cfg.json_logs());

    // rustls needs an explicit provider when more than one is compiled in.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(?e, "CryptoProvider already installed; proceeding");
    }

    info!(?cfg, "starting slurm operator");

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}
