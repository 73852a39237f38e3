//! What the agent should do with its node, decided from node conditions
//! alone.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use slurmop_node::conditions::{find_condition, is_true, transition_time, types};

pub const NO_EXECUTE_TAINT_KEY: &str = "node.kubernetes.io/NoExecute";
const NO_EXECUTE: &str = "NoExecute";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeActions {
    pub drain: bool,
    pub reboot: bool,
    /// The host came back after the requested reboot.
    pub report_rebooted: bool,
    pub undrain: bool,
}

/// Picks the actions for `node` given when the host last booted.
///
/// A requested reboot is pending while the host booted before the reboot
/// condition last transitioned. Rebooting implies draining first.
pub fn select_actions(node: &Node, booted_at: DateTime<Utc>) -> NodeActions {
    let mut actions = NodeActions {
        drain: is_true(find_condition(node, types::DRAIN)),
        ..Default::default()
    };

    let reboot = find_condition(node, types::REBOOT);
    if let Some(reboot) = reboot.filter(|c| is_true(Some(*c))) {
        let requested_at = transition_time(reboot);
        if requested_at.is_none_or(|at| booted_at < at) {
            actions.drain = true;
            actions.reboot = true;
        } else {
            actions.report_rebooted = true;
        }
    }

    actions.undrain = !actions.drain && !actions.reboot;
    actions
}

pub fn no_execute_taint() -> Taint {
    Taint {
        key: NO_EXECUTE_TAINT_KEY.into(),
        value: Some("true".into()),
        effect: NO_EXECUTE.into(),
        time_added: None,
    }
}

pub fn has_no_execute_taint(node: &Node) -> bool {
    taints(node).iter().any(|t| t.key == NO_EXECUTE_TAINT_KEY)
}

/// The node's taints with the agent's taint added, or `None` if present.
pub fn with_no_execute_taint(node: &Node) -> Option<Vec<Taint>> {
    if has_no_execute_taint(node) {
        return None;
    }
    let mut taints = taints(node).to_vec();
    taints.push(no_execute_taint());
    Some(taints)
}

/// The node's taints with the agent's taint removed, or `None` if absent.
pub fn without_no_execute_taint(node: &Node) -> Option<Vec<Taint>> {
    let kept: Vec<Taint> = taints(node)
        .iter()
        .filter(|t| !(t.key == NO_EXECUTE_TAINT_KEY && t.effect == NO_EXECUTE))
        .cloned()
        .collect();
    (kept.len() != taints(node).len()).then_some(kept)
}

fn taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_deref())
        .unwrap_or_default()
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == "DaemonSet")
}

pub fn tolerates_no_execute(pod: &Pod) -> bool {
    pod.spec
        .iter()
        .flat_map(|s| s.tolerations.iter().flatten())
        .any(|t| t.effect.as_deref() == Some(NO_EXECUTE))
}

/// Pods that still keep the node from counting as drained.
pub fn blocking_pods(pods: &[Pod]) -> Vec<&Pod> {
    pods.iter()
        .filter(|p| !is_daemonset_pod(p) && !tolerates_no_execute(p))
        .collect()
}
