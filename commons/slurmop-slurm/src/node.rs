use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a Slurm cluster: the namespace and name of its
/// `SlurmCluster` object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Down,
    Error,
    Future,
    Drain,
    Completing,
    Fail,
    Maint,
    Planned,
    Reboot,
    RebootRequested,
    RebootIssued,
    NotResponding,
    PowerDown,
    PoweredDown,
    Reserved,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReason {
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

/// A node as reported by the scheduler itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlurmNode {
    pub name: String,
    pub cluster: ClusterKey,
    /// Identifier of the Kubernetes node backing this scheduler node.
    pub instance_id: String,
    pub states: BTreeSet<NodeState>,
    pub reason: Option<NodeReason>,
    pub comment: String,
}

impl SlurmNode {
    pub fn has_state(&self, state: NodeState) -> bool {
        self.states.contains(&state)
    }

    pub fn is_drain(&self) -> bool {
        self.has_state(NodeState::Drain)
    }

    /// No outstanding or in-progress work remains on the node: it is drained
    /// and idle, and not still completing a job.
    pub fn is_fully_drained(&self) -> bool {
        self.has_state(NodeState::Drain)
            && self.has_state(NodeState::Idle)
            && !self.has_state(NodeState::Completing)
    }
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct NodesResponse {
    #[serde(default)]
    pub nodes: Vec<ApiNode>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct UpdateResponse {
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub description: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.error.is_empty(), self.description.is_empty()) {
            (false, false) => write!(f, "{}: {}", self.error, self.description),
            (false, true) => f.write_str(&self.error),
            _ => f.write_str(&self.description),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct NoValNumber {
    #[serde(default)]
    pub set: bool,
    #[serde(default)]
    pub number: i64,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiNode {
    pub name: String,
    #[serde(default)]
    pub state: Vec<NodeState>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub reason_changed_at: NoValNumber,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub comment: String,
}

impl ApiNode {
    pub(crate) fn into_node(self, cluster: &ClusterKey) -> SlurmNode {
        let reason = if self.reason.is_empty() {
            None
        } else {
            let changed_at = if self.reason_changed_at.set {
                Utc.timestamp_opt(self.reason_changed_at.number, 0)
                    .single()
                    .unwrap_or_default()
            } else {
                DateTime::<Utc>::default()
            };
            Some(NodeReason {
                reason: self.reason,
                changed_at,
            })
        };
        SlurmNode {
            name: self.name,
            cluster: cluster.clone(),
            instance_id: self.instance_id,
            states: self.state.into_iter().collect(),
            reason,
            comment: self.comment,
        }
    }
}
