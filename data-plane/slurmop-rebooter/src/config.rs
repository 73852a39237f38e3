use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct RebooterConfig {
    /// Name of the node this agent runs on, injected through the downward API.
    #[envconfig(from = "NODE_NAME")]
    pub node_name: String,

    /// Whitespace separated program and arguments.
    #[envconfig(from = "SLURMOP_REBOOTER_REBOOT_COMMAND", default = "reboot now")]
    pub reboot_command: String,

    /// Recheck interval while pods are still being evicted.
    #[envconfig(from = "SLURMOP_REBOOTER_EVICTION_REQUEUE_SECS", default = "10")]
    pub eviction_requeue_secs: u64,

    #[envconfig(from = "SLURMOP_REBOOTER_UPTIME_PATH", default = "/proc/uptime")]
    pub uptime_path: String,

    /// text | json
    #[envconfig(from = "SLURMOP_LOG_FORMAT", default = "text")]
    pub log_format: String,
}

impl RebooterConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    pub fn eviction_requeue(&self) -> Duration {
        Duration::from_secs(self.eviction_requeue_secs)
    }
}
