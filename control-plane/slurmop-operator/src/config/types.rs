use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; empty means all namespaces.
    /// Env: SLURMOP_WATCH_NAMESPACE
    #[envconfig(from = "SLURMOP_WATCH_NAMESPACE", default = "")]
    pub watch_namespace: String,

    /// Upper bound on concurrent reconciles per controller.
    #[envconfig(from = "SLURMOP_CONCURRENCY", default = "4")]
    pub concurrency: u16,

    /// Per-reconcile deadline in seconds.
    #[envconfig(from = "SLURMOP_RECONCILE_TIMEOUT_SECS", default = "120")]
    pub reconcile_timeout_secs: u64,

    /// Steady-state requeue for SlurmCluster reconciles.
    #[envconfig(from = "SLURMOP_REQUEUE_SECS", default = "60")]
    pub requeue_secs: u64,

    #[envconfig(from = "SLURMOP_STATUS_RETRY_ATTEMPTS", default = "5")]
    pub status_retry_attempts: u32,

    /// text | json
    #[envconfig(from = "SLURMOP_LOG_FORMAT", default = "text")]
    pub log_format: String,

    #[envconfig(nested)]
    pub checks: ChecksConfig,

    #[envconfig(nested)]
    pub slurm: SlurmConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ChecksConfig {
    /// How long a node may stay NotReady before its object is deleted.
    #[envconfig(
        from = "SLURMOP_CHECKS_NOT_READY_TIMEOUT_SECS",
        default = "900"
    )]
    pub not_ready_timeout_secs: u64,

    #[envconfig(
        from = "SLURMOP_CHECKS_DELETE_NOT_READY_NODES",
        default = "true"
    )]
    pub delete_not_ready_nodes: bool,

    /// Condition type the infrastructure sets ahead of host maintenance.
    #[envconfig(
        from = "SLURMOP_CHECKS_MAINTENANCE_CONDITION_TYPE",
        default = "MaintenanceScheduled"
    )]
    pub maintenance_condition_type: String,

    #[envconfig(
        from = "SLURMOP_CHECKS_ENABLE_NODE_REPLACEMENT",
        default = "true"
    )]
    pub enable_node_replacement: bool,

    /// Mark nodes failing a `[node_problem]` health check as hardware
    /// suspects right away instead of reserving them for re-checks.
    #[envconfig(
        from = "SLURMOP_CHECKS_DISABLE_EXTENSIVE_CHECK",
        default = "false"
    )]
    pub disable_extensive_check: bool,

    #[envconfig(
        from = "SLURMOP_CHECKS_SLURM_NODES_REQUEUE_SECS",
        default = "60"
    )]
    pub slurm_nodes_requeue_secs: u64,

    #[envconfig(
        from = "SLURMOP_CHECKS_EPHEMERAL_STORAGE_THRESHOLD_PCT",
        default = "90"
    )]
    pub ephemeral_storage_threshold_pct: f64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct SlurmConfig {
    #[envconfig(from = "SLURMOP_SLURM_REST_PORT", default = "6820")]
    pub rest_port: u16,

    #[envconfig(from = "SLURMOP_SLURM_API_VERSION", default = "v0.0.41")]
    pub api_version: String,

    #[envconfig(from = "SLURMOP_SLURM_TIMEOUT_SECS", default = "10")]
    pub timeout_secs: u64,
}

impl OperatorConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(self.watch_namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}

impl ChecksConfig {
    pub fn not_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.not_ready_timeout_secs)
    }
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            not_ready_timeout_secs: 900,
            delete_not_ready_nodes: true,
            maintenance_condition_type: slurmop_node::conditions::types::DEFAULT_MAINTENANCE
                .to_string(),
            enable_node_replacement: true,
            disable_extensive_check: false,
            slurm_nodes_requeue_secs: 60,
            ephemeral_storage_threshold_pct: 90.0,
        }
    }
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            rest_port: 6820,
            api_version: "v0.0.41".into(),
            timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_from_empty_env() {
        let cfg = OperatorConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(cfg.namespace(), None);
        assert_eq!(cfg.concurrency, 4);
        assert!(!cfg.json_logs());
        assert_eq!(cfg.checks.not_ready_timeout(), Duration::from_secs(900));
        assert_eq!(cfg.checks.maintenance_condition_type, "MaintenanceScheduled");
        assert!(!cfg.checks.disable_extensive_check);
        assert_eq!(cfg.slurm.rest_port, 6820);
    }

    #[test]
    fn overrides_are_honored() {
        let env = HashMap::from([
            ("SLURMOP_WATCH_NAMESPACE".to_string(), "soperator".to_string()),
            ("SLURMOP_LOG_FORMAT".to_string(), "JSON".to_string()),
            (
                "SLURMOP_CHECKS_MAINTENANCE_CONDITION_TYPE".to_string(),
                "NebiusMaintenanceScheduled".to_string(),
            ),
            (
                "SLURMOP_CHECKS_DELETE_NOT_READY_NODES".to_string(),
                "false".to_string(),
            ),
        ]);
        let cfg = OperatorConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(cfg.namespace(), Some("soperator"));
        assert!(cfg.json_logs());
        assert!(!cfg.checks.delete_not_ready_nodes);
        assert_eq!(
            cfg.checks.maintenance_condition_type,
            "NebiusMaintenanceScheduled"
        );
    }
}
