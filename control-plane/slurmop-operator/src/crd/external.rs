//! Custom resources owned by other operators that a cluster creates:
//! mariadb-operator databases and grants, OpenTelemetry collectors and
//! Prometheus pod monitors. Only the fields the controller sets are modelled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::slurm_cluster::SecretKeyRef;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "MariaDB",
    plural = "mariadbs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbSpec {
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub port: Option<i32>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password_secret_key_ref: Option<SecretKeyRef>,
    pub root_password_secret_key_ref: Option<SecretKeyRef>,
    pub resources: Option<ResourceRequirements>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
    pub storage: Option<MariaDbStorage>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbStorage {
    pub size: Option<String>,
    pub storage_class_name: Option<String>,
    pub ephemeral: Option<bool>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "Grant",
    plural = "grants",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub maria_db_ref: ObjectRef,
    pub privileges: Vec<String>,
    pub database: String,
    pub table: String,
    pub username: String,
    pub host: Option<String>,
    pub grant_option: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ObjectRef {
    pub name: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "opentelemetry.io",
    version = "v1beta1",
    kind = "OpenTelemetryCollector",
    plural = "opentelemetrycollectors",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OpenTelemetryCollectorSpec {
    pub mode: Option<String>,
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub config: Option<serde_json::Value>,
    pub node_selector: Option<BTreeMap<String, String>>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "PodMonitor",
    plural = "podmonitors",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodMonitorSpec {
    pub job_label: Option<String>,
    #[serde(default)]
    pub pod_metrics_endpoints: Vec<PodMetricsEndpoint>,
    pub selector: LabelSelector,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodMetricsEndpoint {
    pub port: Option<String>,
    pub path: Option<String>,
    pub interval: Option<String>,
    pub scheme: Option<String>,
}
