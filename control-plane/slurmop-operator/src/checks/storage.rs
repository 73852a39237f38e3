//! Ephemeral storage pressure of worker pods, from the kubelet stats summary.

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use slurmop_node::stats::StatsSummary;

const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

#[derive(Clone, Debug, PartialEq)]
pub struct StorageUsage {
    pub pod: String,
    pub namespace: String,
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub percent: f64,
}

const SUFFIXES: [(&str, f64); 14] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
    ("", 1.0),
];

/// Parses a resource quantity such as `10Gi`, `500M` or `1e9` into bytes.
pub fn quantity_bytes(quantity: &str) -> Option<u64> {
    let q = quantity.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| q.strip_suffix(suffix).map(|n| (n, *m)))?;
    let value: f64 = number.parse().ok()?;
    (value >= 0.0).then(|| (value * multiplier).ceil() as u64)
}

/// Sum of the ephemeral-storage limits of all containers, init containers
/// included. Zero when no container sets one.
pub fn ephemeral_limit(pod: &Pod) -> u64 {
    let Some(spec) = &pod.spec else {
        return 0;
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter_map(|c| {
            c.resources.as_ref()?.limits.as_ref()?.get(EPHEMERAL_STORAGE)
        })
        .filter_map(|q| quantity_bytes(&q.0))
        .sum()
}

/// Usage of every pod in `pods` that has a limit and appears in `summary`.
pub fn usage(pods: &[&Pod], summary: &StatsSummary) -> Vec<StorageUsage> {
    let by_uid: HashMap<String, &Pod> = pods
        .iter()
        .filter_map(|p| Some((p.uid()?, *p)))
        .collect();

    summary
        .pods
        .iter()
        .filter_map(|stats| {
            let pod = by_uid.get(&stats.pod_ref.uid)?;
            let limit_bytes = ephemeral_limit(pod);
            if limit_bytes == 0 {
                return None;
            }
            let used_bytes = stats
                .ephemeral_storage
                .as_ref()
                .and_then(|fs| fs.used_bytes)
                .unwrap_or(0);
            Some(StorageUsage {
                pod: stats.pod_ref.name.clone(),
                namespace: stats.pod_ref.namespace.clone(),
                used_bytes,
                limit_bytes,
                percent: used_bytes as f64 / limit_bytes as f64 * 100.0,
            })
        })
        .collect()
}
