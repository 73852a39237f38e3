use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("scheduler api error: {0}")]
    Slurm(#[from] slurmop_slurm::Error),

    #[error("malformed versions annotation on {resource}: {source}")]
    VersionsAnnotation {
        resource: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid execution strategy {0:?}")]
    InvalidStrategy(String),

    #[error("{0}")]
    Steps(String),

    #[error("unrecognized scheduler reason {reason:?} on node {node}")]
    UnknownReason { node: String, reason: String },

    #[error("cannot parse health check reason {0:?}")]
    HealthCheckReason(String),

    #[error("missing field {field} on {resource}")]
    MissingField {
        resource: String,
        field: &'static str,
    },

    #[error("reconcile exceeded deadline of {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn missing(resource: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            resource: resource.into(),
            field,
        }
    }

    /// True for optimistic-concurrency failures on writes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }
}
