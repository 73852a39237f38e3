use kube::core::CustomResourceExt;
use slurmop_operator::crd::SlurmCluster;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&SlurmCluster::crd())?;
    println!("{yaml}");
    Ok(())
}
