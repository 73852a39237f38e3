//! Job-scheduler (Slurm) REST contract used by the node health checks.
//!
//! Only the node query and drain/resume operations are modelled here.

mod client;
mod error;
mod node;
mod registry;

pub use client::{RestClient, RestClientConfig, SlurmApi};
#[cfg(any(test, feature = "mock"))]
pub use client::MockSlurmApi;
pub use error::Error;
pub use node::{ClusterKey, NodeReason, NodeState, SlurmNode};
pub use registry::ClientSet;
