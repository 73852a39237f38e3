use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema,
)]
#[kube(
    group = "slurm.soperator.io",
    version = "v1alpha1",
    kind = "SlurmCluster",
    plural = "slurmclusters",
    shortname = "slurm",
    namespaced,
    status = "SlurmClusterStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SlurmClusterSpec {
    /// Image carrying slurmctld, slurmd and slurmrestd
    pub image: String,
    #[serde(default)]
    pub controller: ControllerSpec,
    pub workers: WorkersSpec,
    /// Extra `key=value` lines appended to slurm.conf
    #[serde(default)]
    pub slurm_config: BTreeMap<String, String>,
    pub rest_api: Option<RestApiSpec>,
    pub accounting: Option<AccountingSpec>,
    pub telemetry: Option<TelemetrySpec>,
    /// Cron schedule of the periodic health check job; none disables it
    pub health_check_schedule: Option<String>,
    /// Create a service account and role for worker pods
    #[serde(default)]
    pub rbac: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSpec {
    #[serde(default = "default_controller_replicas")]
    pub replicas: i32,
    /// Size of the state volume claim, e.g. "10Gi"
    pub state_size: Option<String>,
}

impl Default for ControllerSpec {
    fn default() -> Self {
        Self {
            replicas: default_controller_replicas(),
            state_size: None,
        }
    }
}

fn default_controller_replicas() -> i32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkersSpec {
    pub size: i32,
    /// GPUs requested per worker pod
    pub gpus: Option<i32>,
    pub ephemeral_storage_limit: Option<String>,
    pub node_selector: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestApiSpec {
    pub enabled: bool,
    pub port: Option<u16>,
    /// Secret holding the JWT used for scheduler API calls
    pub token_secret: Option<SecretKeyRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountingSpec {
    pub enabled: bool,
    pub database_image: Option<String>,
    pub storage_size: Option<String>,
    /// Secret with the accounting database user password
    pub password_secret: Option<SecretKeyRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySpec {
    #[serde(default)]
    pub otel_collector: bool,
    pub otel_collector_image: Option<String>,
    #[serde(default)]
    pub pod_monitor: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SlurmClusterStatus {
    pub phase: Option<Phase>,
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    Reconciling,
    Available,
    NotAvailable,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    CommonAvailable,
    ControllersAvailable,
    WorkersAvailable,
    RestApiAvailable,
    AccountingAvailable,
    TelemetryAvailable,
    RbacAvailable,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl SlurmClusterSpec {
    pub fn rest_api_enabled(&self) -> bool {
        self.rest_api.as_ref().is_some_and(|r| r.enabled)
    }

    pub fn accounting_enabled(&self) -> bool {
        self.accounting.as_ref().is_some_and(|a| a.enabled)
    }
}
