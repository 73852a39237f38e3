//! Built-in rendering of the objects that make up a Slurm cluster.
//!
//! Rendering is pure: the same `SlurmCluster` always yields the same objects.
//! Pod-bearing workloads use fixed names (`controller`, `worker`), so one
//! cluster is expected per namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde_json::json;

use crate::crd::SlurmCluster;
use crate::crd::external::{
    Grant, GrantSpec, MariaDB, MariaDbSpec, MariaDbStorage, ObjectRef,
    OpenTelemetryCollector, OpenTelemetryCollectorSpec, PodMetricsEndpoint,
    PodMonitor, PodMonitorSpec,
};
use crate::engine::Desired;
use crate::{Error, Result};

pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "soperator";

pub const CONTROLLER_NAME: &str = "controller";
pub const WORKER_NAME: &str = "worker";
pub const DEFAULT_REST_PORT: u16 = 6820;
const SLURMCTLD_PORT: i32 = 6817;
const SLURMD_PORT: i32 = 6818;
const MARIADB_PORT: i32 = 3306;

pub mod names {
    pub fn slurm_configs(cluster: &str) -> String {
        format!("{cluster}-slurm-configs")
    }
    pub fn controller_service(cluster: &str) -> String {
        format!("{cluster}-controller")
    }
    pub fn worker_service(cluster: &str) -> String {
        format!("{cluster}-worker")
    }
    pub fn rest(cluster: &str) -> String {
        format!("{cluster}-rest")
    }
    pub fn health_check(cluster: &str) -> String {
        format!("{cluster}-health-check")
    }
    pub fn accounting_db(cluster: &str) -> String {
        format!("{cluster}-accounting-db")
    }
    pub fn accounting_grant(cluster: &str) -> String {
        format!("{cluster}-accounting")
    }
    pub fn collector(cluster: &str) -> String {
        format!("{cluster}-collector")
    }
    pub fn pod_monitor(cluster: &str) -> String {
        format!("{cluster}-workers")
    }
    pub fn worker_rbac(cluster: &str) -> String {
        format!("{cluster}-worker")
    }
}

/// Everything a cluster consists of, grouped the way it is reconciled.
#[derive(Debug)]
pub struct RenderedCluster {
    pub slurm_configs: ConfigMap,
    pub controller_service: Service,
    pub controller: StatefulSet,
    pub worker_service: Service,
    pub workers: StatefulSet,
    pub health_check: Desired<CronJob>,
    pub rest_service: Desired<Service>,
    pub rest: Desired<Deployment>,
    pub accounting_db: Desired<MariaDB>,
    pub accounting_grant: Desired<Grant>,
    pub collector: Desired<OpenTelemetryCollector>,
    pub pod_monitor: Desired<PodMonitor>,
    pub service_account: Desired<ServiceAccount>,
    pub role: Desired<Role>,
    pub role_binding: Desired<RoleBinding>,
}

struct Ctx<'a> {
    cluster: &'a SlurmCluster,
    name: String,
    namespace: String,
}

impl Ctx<'_> {
    fn labels(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_INSTANCE.to_string(), self.name.clone()),
            (LABEL_COMPONENT.to_string(), component.to_string()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        ])
    }

    fn selector(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_INSTANCE.to_string(), self.name.clone()),
            (LABEL_COMPONENT.to_string(), component.to_string()),
        ])
    }

    fn meta(&self, name: String, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(component)),
            ..Default::default()
        }
    }

    fn absent<K>(&self, name: String) -> Desired<K> {
        Desired::Absent {
            namespace: self.namespace.clone(),
            name,
        }
    }
}

pub fn render(cluster: &SlurmCluster) -> Result<RenderedCluster> {
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::missing(cluster.name_any(), "metadata.namespace"))?;
    let ctx = Ctx {
        cluster,
        name: cluster.name_any(),
        namespace,
    };
    let spec = &cluster.spec;
    let rest_enabled = spec.rest_api_enabled();
    let accounting_enabled = spec.accounting_enabled();
    let telemetry = spec.telemetry.clone().unwrap_or_default();

    Ok(RenderedCluster {
        slurm_configs: slurm_configs(&ctx),
        controller_service: headless_service(
            &ctx,
            names::controller_service(&ctx.name),
            CONTROLLER_NAME,
            SLURMCTLD_PORT,
        ),
        controller: controller(&ctx)?,
        worker_service: headless_service(
            &ctx,
            names::worker_service(&ctx.name),
            WORKER_NAME,
            SLURMD_PORT,
        ),
        workers: workers(&ctx)?,
        health_check: match &spec.health_check_schedule {
            Some(schedule) => Desired::Present(health_check(&ctx, schedule)),
            None => ctx.absent(names::health_check(&ctx.name)),
        },
        rest_service: if rest_enabled {
            Desired::Present(rest_service(&ctx))
        } else {
            ctx.absent(names::rest(&ctx.name))
        },
        rest: if rest_enabled {
            Desired::Present(rest(&ctx))
        } else {
            ctx.absent(names::rest(&ctx.name))
        },
        accounting_db: if accounting_enabled {
            Desired::Present(accounting_db(&ctx))
        } else {
            ctx.absent(names::accounting_db(&ctx.name))
        },
        accounting_grant: if accounting_enabled {
            Desired::Present(accounting_grant(&ctx))
        } else {
            ctx.absent(names::accounting_grant(&ctx.name))
        },
        collector: if telemetry.otel_collector {
            Desired::Present(collector(&ctx, telemetry.otel_collector_image))
        } else {
            ctx.absent(names::collector(&ctx.name))
        },
        pod_monitor: if telemetry.pod_monitor {
            Desired::Present(pod_monitor(&ctx))
        } else {
            ctx.absent(names::pod_monitor(&ctx.name))
        },
        service_account: if spec.rbac {
            Desired::Present(ServiceAccount {
                metadata: ctx.meta(names::worker_rbac(&ctx.name), WORKER_NAME),
                ..Default::default()
            })
        } else {
            ctx.absent(names::worker_rbac(&ctx.name))
        },
        role: if spec.rbac {
            Desired::Present(worker_role(&ctx))
        } else {
            ctx.absent(names::worker_rbac(&ctx.name))
        },
        role_binding: if spec.rbac {
            Desired::Present(worker_role_binding(&ctx))
        } else {
            ctx.absent(names::worker_rbac(&ctx.name))
        },
    })
}

fn slurm_conf(ctx: &Ctx<'_>) -> String {
    let spec = &ctx.cluster.spec;
    let controller_host = format!(
        "{CONTROLLER_NAME}-0({}.{}.svc)",
        names::controller_service(&ctx.name),
        ctx.namespace
    );
    let mut lines = vec![
        format!("ClusterName={}", ctx.name),
        format!("SlurmctldHost={controller_host}"),
        format!("SlurmctldPort={SLURMCTLD_PORT}"),
        format!("SlurmdPort={SLURMD_PORT}"),
        "AuthType=auth/munge".to_string(),
        "StateSaveLocation=/var/spool/slurmctld".to_string(),
        "SlurmdSpoolDir=/var/spool/slurmd".to_string(),
        "ReturnToService=2".to_string(),
    ];
    if spec.accounting_enabled() {
        lines.push("AccountingStorageType=accounting_storage/slurmdbd".into());
    }
    if spec.workers.size > 0 {
        let gres = spec
            .workers
            .gpus
            .filter(|g| *g > 0)
            .map(|g| format!(" Gres=gpu:{g}"))
            .unwrap_or_default();
        lines.push(format!(
            "NodeName={WORKER_NAME}-[0-{}] State=CLOUD{gres}",
            spec.workers.size - 1
        ));
    }
    lines.push(
        "PartitionName=main Nodes=ALL Default=YES MaxTime=INFINITE State=UP"
            .to_string(),
    );
    lines.extend(spec.slurm_config.iter().map(|(k, v)| format!("{k}={v}")));
    lines.join("\n") + "\n"
}

fn slurm_configs(ctx: &Ctx<'_>) -> ConfigMap {
    ConfigMap {
        metadata: ctx.meta(names::slurm_configs(&ctx.name), "config"),
        data: Some(BTreeMap::from([
            ("slurm.conf".to_string(), slurm_conf(ctx)),
            (
                "cgroup.conf".to_string(),
                "CgroupPlugin=cgroup/v2\nConstrainDevices=yes\n".to_string(),
            ),
        ])),
        ..Default::default()
    }
}

fn headless_service(
    ctx: &Ctx<'_>,
    name: String,
    component: &str,
    port: i32,
) -> Service {
    Service {
        metadata: ctx.meta(name, component),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            selector: Some(ctx.selector(component)),
            ports: Some(vec![ServicePort {
                name: Some(component.to_string()),
                port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_volume(ctx: &Ctx<'_>) -> (Volume, VolumeMount) {
    (
        Volume {
            name: "slurm-configs".into(),
            config_map: Some(ConfigMapVolumeSource {
                name: names::slurm_configs(&ctx.name),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: "slurm-configs".into(),
            mount_path: "/etc/slurm".into(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

fn quantity(field: &'static str, value: &str) -> Result<Quantity> {
    if value.trim().is_empty() {
        return Err(Error::missing(format!("spec.{field}"), field));
    }
    Ok(Quantity(value.to_string()))
}

fn controller(ctx: &Ctx<'_>) -> Result<StatefulSet> {
    let spec = &ctx.cluster.spec.controller;
    let (volume, mount) = config_volume(ctx);
    let state_size = spec.state_size.as_deref().unwrap_or("10Gi");
    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("state".into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    quantity("controller.stateSize", state_size)?,
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: ctx.meta(CONTROLLER_NAME.into(), CONTROLLER_NAME),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            service_name: names::controller_service(&ctx.name),
            selector: LabelSelector {
                match_labels: Some(ctx.selector(CONTROLLER_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels(CONTROLLER_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "slurmctld".into(),
                        image: Some(ctx.cluster.spec.image.clone()),
                        args: Some(vec!["slurmctld".into(), "-D".into()]),
                        ports: Some(vec![ContainerPort {
                            container_port: SLURMCTLD_PORT,
                            name: Some("slurmctld".into()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![
                            mount,
                            VolumeMount {
                                name: "state".into(),
                                mount_path: "/var/spool/slurmctld".into(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![claim]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn workers(ctx: &Ctx<'_>) -> Result<StatefulSet> {
    let spec = &ctx.cluster.spec.workers;
    let (volume, mount) = config_volume(ctx);
    let mut limits = BTreeMap::new();
    if let Some(gpus) = spec.gpus.filter(|g| *g > 0) {
        limits.insert("nvidia.com/gpu".to_string(), Quantity(gpus.to_string()));
    }
    if let Some(storage) = &spec.ephemeral_storage_limit {
        limits.insert(
            "ephemeral-storage".to_string(),
            quantity("workers.ephemeralStorageLimit", storage)?,
        );
    }

    Ok(StatefulSet {
        metadata: ctx.meta(WORKER_NAME.into(), WORKER_NAME),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.size),
            service_name: names::worker_service(&ctx.name),
            pod_management_policy: Some("Parallel".into()),
            selector: LabelSelector {
                match_labels: Some(ctx.selector(WORKER_NAME)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels(WORKER_NAME)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "slurmd".into(),
                        image: Some(ctx.cluster.spec.image.clone()),
                        args: Some(vec!["slurmd".into(), "-D".into()]),
                        ports: Some(vec![ContainerPort {
                            container_port: SLURMD_PORT,
                            name: Some("slurmd".into()),
                            ..Default::default()
                        }]),
                        resources: (!limits.is_empty()).then(|| {
                            ResourceRequirements {
                                limits: Some(limits),
                                ..Default::default()
                            }
                        }),
                        volume_mounts: Some(vec![mount]),
                        ..Default::default()
                    }],
                    node_selector: spec.node_selector.clone(),
                    service_account_name: ctx
                        .cluster
                        .spec
                        .rbac
                        .then(|| names::worker_rbac(&ctx.name)),
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn health_check(ctx: &Ctx<'_>, schedule: &str) -> CronJob {
    CronJob {
        metadata: ctx.meta(names::health_check(&ctx.name), "health-check"),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".into()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(3),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".into()),
                            containers: vec![Container {
                                name: "health-check".into(),
                                image: Some(ctx.cluster.spec.image.clone()),
                                args: Some(vec![
                                    "sinfo".into(),
                                    "--noheader".into(),
                                ]),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn rest_port(ctx: &Ctx<'_>) -> i32 {
    ctx.cluster
        .spec
        .rest_api
        .as_ref()
        .and_then(|r| r.port)
        .unwrap_or(DEFAULT_REST_PORT) as i32
}

fn rest_service(ctx: &Ctx<'_>) -> Service {
    Service {
        metadata: ctx.meta(names::rest(&ctx.name), "rest"),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(ctx.selector("rest")),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: rest_port(ctx),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn rest(ctx: &Ctx<'_>) -> Deployment {
    let (volume, mount) = config_volume(ctx);
    Deployment {
        metadata: ctx.meta(names::rest(&ctx.name), "rest"),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ctx.selector("rest")),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels("rest")),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "slurmrestd".into(),
                        image: Some(ctx.cluster.spec.image.clone()),
                        args: Some(vec![
                            "slurmrestd".into(),
                            format!("0.0.0.0:{}", rest_port(ctx)),
                        ]),
                        volume_mounts: Some(vec![mount]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn accounting_db(ctx: &Ctx<'_>) -> MariaDB {
    let acc = ctx.cluster.spec.accounting.clone().unwrap_or_default();
    MariaDB {
        metadata: ctx.meta(names::accounting_db(&ctx.name), "accounting"),
        spec: MariaDbSpec {
            image: acc.database_image,
            replicas: Some(1),
            port: Some(MARIADB_PORT),
            database: Some("slurm_acct_db".into()),
            username: Some("slurm".into()),
            password_secret_key_ref: acc.password_secret,
            storage: Some(MariaDbStorage {
                size: Some(acc.storage_size.unwrap_or_else(|| "10Gi".into())),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn accounting_grant(ctx: &Ctx<'_>) -> Grant {
    Grant {
        metadata: ctx.meta(names::accounting_grant(&ctx.name), "accounting"),
        spec: GrantSpec {
            maria_db_ref: ObjectRef {
                name: names::accounting_db(&ctx.name),
            },
            privileges: vec!["ALL PRIVILEGES".into()],
            database: "slurm_acct_db".into(),
            table: "*".into(),
            username: "slurm".into(),
            host: Some("%".into()),
            grant_option: false,
        },
    }
}

fn collector(ctx: &Ctx<'_>, image: Option<String>) -> OpenTelemetryCollector {
    OpenTelemetryCollector {
        metadata: ctx.meta(names::collector(&ctx.name), "telemetry"),
        spec: OpenTelemetryCollectorSpec {
            mode: Some("deployment".into()),
            image,
            replicas: Some(1),
            config: Some(json!({
                "receivers": {"otlp": {"protocols": {"grpc": {}, "http": {}}}},
                "exporters": {"debug": {}},
                "service": {"pipelines": {"metrics": {
                    "receivers": ["otlp"],
                    "exporters": ["debug"]
                }}}
            })),
            node_selector: None,
        },
    }
}

fn pod_monitor(ctx: &Ctx<'_>) -> PodMonitor {
    PodMonitor {
        metadata: ctx.meta(names::pod_monitor(&ctx.name), "telemetry"),
        spec: PodMonitorSpec {
            job_label: Some(LABEL_COMPONENT.into()),
            pod_metrics_endpoints: vec![PodMetricsEndpoint {
                port: Some("slurmd".into()),
                path: Some("/metrics".into()),
                interval: Some("30s".into()),
                scheme: Some("http".into()),
            }],
            selector: LabelSelector {
                match_labels: Some(ctx.selector(WORKER_NAME)),
                ..Default::default()
            },
        },
    }
}

fn worker_role(ctx: &Ctx<'_>) -> Role {
    Role {
        metadata: ctx.meta(names::worker_rbac(&ctx.name), WORKER_NAME),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["".into()]),
            resources: Some(vec!["pods".into()]),
            verbs: vec!["get".into(), "list".into(), "watch".into()],
            ..Default::default()
        }]),
    }
}

fn worker_role_binding(ctx: &Ctx<'_>) -> RoleBinding {
    let name = names::worker_rbac(&ctx.name);
    RoleBinding {
        metadata: ctx.meta(name.clone(), WORKER_NAME),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name,
            namespace: Some(ctx.namespace.clone()),
            ..Default::default()
        }]),
    }
}
