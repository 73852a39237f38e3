pub mod external;
pub mod slurm_cluster;

pub use slurm_cluster::{
    ClusterCondition, ConditionStatus, ConditionType, Phase, RestApiSpec,
    SecretKeyRef, SlurmCluster, SlurmClusterSpec, SlurmClusterStatus,
};
