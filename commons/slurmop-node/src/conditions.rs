use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Node condition types written and read by the node health checks.
pub mod types {
    pub const DRAIN: &str = "SlurmNodeDrain";
    pub const REBOOT: &str = "SlurmNodeReboot";
    pub const HARDWARE_ISSUES_SUSPECTED: &str = "HardwareIssuesSuspected";
    pub const DEGRADED: &str = "SoperatorChecksK8SNodeDegraded";
    pub const READY: &str = "Ready";
    /// Written once the scheduler confirms every node on a host that is due
    /// for maintenance or replacement is drained. Drives the drain flow.
    pub const MAINTENANCE: &str = "SoperatorChecksK8SNodeMaintenance";
    /// Set by the infrastructure provider; the operator only reads it.
    pub const DEFAULT_MAINTENANCE: &str = "MaintenanceScheduled";
}

pub mod reasons {
    pub const NEED_DRAIN: &str = "NodeNeedDrain";
    pub const DRAINING: &str = "NodeDraining";
    pub const DRAINED: &str = "NodeDrained";
    pub const UNDRAINED: &str = "NodeUndrained";
    pub const NEED_REBOOT: &str = "NodeNeedReboot";
    pub const REBOOTING: &str = "NodeRebooting";
    pub const REBOOTED: &str = "NodeRebooted";
    pub const NO_REBOOT_NEEDED: &str = "NodeNoRebootNeeded";
    pub const GPU_HEALTH_CHECK_FAILED: &str = "GPUHealthCheckFailed";
    pub const SLURM_NODE_DEGRADED: &str = "SlurmNodeDegraded";
}

pub mod messages {
    pub const MAINTENANCE_SCHEDULED: &str = "Maintenance scheduled";
    pub const HARDWARE_ISSUES_SUSPECTED: &str = "Hardware issues suspected";
    pub const DRAINING: &str = "Node is draining";
    pub const DRAINED: &str = "Node has been drained";
    pub const UNDRAINED: &str = "Node has been undrained";
    pub const REBOOTING: &str = "Node is rebooting";
    pub const REBOOTED: &str = "Node has been rebooted";
    pub const SLURM_NODE_DEGRADED: &str = "Slurm node degraded";
}

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

pub fn find_condition<'a>(
    node: &'a Node,
    type_: &str,
) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

pub fn is_true(condition: Option<&NodeCondition>) -> bool {
    condition.is_some_and(|c| c.status == STATUS_TRUE)
}

pub fn has_reason(condition: Option<&NodeCondition>, reason: &str) -> bool {
    condition.is_some_and(|c| c.reason.as_deref() == Some(reason))
}

pub fn transition_time(condition: &NodeCondition) -> Option<DateTime<Utc>> {
    condition.last_transition_time.as_ref().map(|t| t.0)
}

/// A desired condition value, independent of timestamps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(
        type_: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    fn status_str(&self) -> &'static str {
        if self.status { STATUS_TRUE } else { STATUS_FALSE }
    }

    pub fn to_condition(&self, now: DateTime<Utc>) -> NodeCondition {
        NodeCondition {
            type_: self.type_.clone(),
            status: self.status_str().to_string(),
            reason: Some(self.reason.clone()),
            message: Some(self.message.clone()),
            last_heartbeat_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
        }
    }
}

/// Merges `update` into `conditions`.
///
/// An existing entry with the same status and reason only gets its heartbeat
/// refreshed. Otherwise the entry is replaced, or appended, with a transition
/// time of `now`.
pub fn apply_condition(
    conditions: &mut Vec<NodeCondition>,
    update: &ConditionUpdate,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        Some(existing)
            if existing.status == update.status_str()
                && existing.reason.as_deref() == Some(update.reason.as_str()) =>
        {
            existing.last_heartbeat_time = Some(Time(now));
        }
        Some(existing) => *existing = update.to_condition(now),
        None => conditions.push(update.to_condition(now)),
    }
}

/// Hash of the tracked condition types on a node, leaving heartbeat times
/// out so that heartbeat-only updates do not change it.
pub fn conditions_fingerprint(node: &Node, tracked: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for type_ in tracked {
        type_.hash(&mut hasher);
        if let Some(c) = find_condition(node, type_) {
            c.status.hash(&mut hasher);
            c.reason.hash(&mut hasher);
            c.message.hash(&mut hasher);
            c.last_transition_time.as_ref().map(|t| t.0).hash(&mut hasher);
        }
    }
    hasher.finish()
}
