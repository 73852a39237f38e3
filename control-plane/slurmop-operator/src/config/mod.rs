mod types;

pub use types::{ChecksConfig, OperatorConfig, SlurmConfig};
