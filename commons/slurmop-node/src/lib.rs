//! Node condition vocabulary and node access shared by the operator and the
//! node-local reboot agent.

pub mod client;
pub mod conditions;
pub mod stats;

pub use client::{KubeNodeClient, NodeClient, set_node_condition};
#[cfg(any(test, feature = "mock"))]
pub use client::MockNodeClient;
pub use conditions::{ConditionUpdate, find_condition, is_true};
