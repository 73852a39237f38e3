pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cannot read uptime from {path}: {source}")]
    Uptime {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed uptime {0:?}")]
    MalformedUptime(String),

    #[error("reboot command {command:?} failed: {reason}")]
    RebootCommand { command: String, reason: String },
}
