//! Subset of the kubelet `/stats/summary` document.

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct StatsSummary {
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodRef,
    #[serde(rename = "ephemeral-storage", default)]
    pub ephemeral_storage: Option<FsStats>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FsStats {
    pub used_bytes: Option<u64>,
    pub capacity_bytes: Option<u64>,
}
