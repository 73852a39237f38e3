//! Per-cluster pass over the scheduler's view of its nodes.
//!
//! Each run drains scheduler nodes whose Kubernetes node is up for
//! replacement, checks worker pod ephemeral storage, then correlates every
//! drained scheduler node that carries a known reason with its Kubernetes
//! node.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::controller::Action;
use kube::runtime::{
    Controller, WatchStreamExt, controller, predicates, reflector, watcher,
};
use kube::{Resource, ResourceExt};
use regex::Regex;
use slurmop_node::conditions::{
    find_condition, is_true, messages, reasons as condition_reasons,
    transition_time, types,
};
use slurmop_node::{ConditionUpdate, NodeClient, set_node_condition};
use slurmop_slurm::{ClientSet, ClusterKey, NodeReason, SlurmNode};
use tracing::{Span, debug, info, instrument, warn};

use crate::checks::ChecksContext;
use crate::checks::drain::{Drainer, backing_node};
use crate::checks::storage;
use crate::config::ChecksConfig;
use crate::controller::{
    object_key, requeue_with_backoff, scoped, with_deadline,
};
use crate::crd::SlurmCluster;
use crate::engine::{Step, Strategy, execute};
use crate::{Error, Result};

/// Drain reasons the scheduler reports, as written by the operator, by
/// health checks or by the scheduler itself.
pub mod reasons {
    pub const KILL_TASK_FAILED: &str = "Kill task failed";
    pub const NODE_REBOOT: &str = "Soperator auto-healing: node reboot";
    pub const NODE_REPLACEMENT: &str =
        "Soperator auto-healing: node replacement";
    pub const HARDWARE_PROBLEM: &str = "[hardware_problem]";
    pub const NODE_PROBLEM: &str = "[node_problem]";

    pub(super) const OPERATOR_PREFIX: &str = "Soperator auto-healing:";
}

/// What a known drain reason means for the backing Kubernetes node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cause {
    Degraded,
    Replacement,
    HardwareProblem,
    NodeProblem,
}

const KNOWN_REASONS: [(&str, Cause); 5] = [
    (reasons::KILL_TASK_FAILED, Cause::Degraded),
    (reasons::NODE_REBOOT, Cause::Degraded),
    (reasons::NODE_REPLACEMENT, Cause::Replacement),
    (reasons::HARDWARE_PROBLEM, Cause::HardwareProblem),
    (reasons::NODE_PROBLEM, Cause::NodeProblem),
];

static TAGGED_REASON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[a-z_]+\]").expect("valid regex"));

static CONDITION_REASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z]([A-Za-z0-9_,:]*[A-Za-z0-9_])?$")
        .expect("valid regex")
});

/// Upper bounds of `reason` and `message` on a node condition.
const MAX_REASON_LEN: usize = 1024;
const MAX_MESSAGE_LEN: usize = 32768;

const NO_CLIENT_REQUEUE: Duration = Duration::from_secs(10);

/// Reservations holding nodes that failed a health check are named
/// `suspicious-node-<node>`.
pub const MAINTENANCE_RESERVATION_PREFIX: &str = "suspicious-node";

pub fn classify(reason: &str) -> Option<Cause> {
    KNOWN_REASONS
        .iter()
        .find(|(known, _)| reason.contains(known))
        .map(|(_, cause)| *cause)
}

/// Whether `reason` was written by the operator or its health checks, as
/// opposed to an administrator.
pub fn is_operator_reason(reason: &str) -> bool {
    reason.starts_with(reasons::OPERATOR_PREFIX)
        || TAGGED_REASON.is_match(reason)
}

/// Joins the alphanumeric words of `input` into `PascalCase`, dropping
/// leading digits of every word.
pub fn to_pascal_case(input: &str) -> String {
    let input = input.trim();
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_alphanumeric()) {
        let mut chars = input.chars();
        if let Some(first) = chars.next().filter(char::is_ascii_alphabetic) {
            return first.to_ascii_uppercase().to_string() + chars.as_str();
        }
    }

    input
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(|word| word.trim_start_matches(|c: char| c.is_ascii_digit()))
        .filter(|word| !word.is_empty())
        .map(|word| {
            let (head, tail) = word.split_at(1);
            head.to_ascii_uppercase() + &tail.to_ascii_lowercase()
        })
        .collect()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Splits `[node_problem] <reason>: <message>` into a condition reason and
/// message.
pub fn parse_health_check_reason(raw: &str) -> Result<(String, String)> {
    let invalid = || Error::HealthCheckReason(raw.to_string());
    let (head, message) = raw.split_once(": ").ok_or_else(invalid)?;
    let head = head
        .strip_prefix(reasons::NODE_PROBLEM)
        .map(str::trim_start)
        .unwrap_or(head);

    let reason = to_pascal_case(head);
    let reason = truncate(&reason, MAX_REASON_LEN);
    if !CONDITION_REASON.is_match(reason) {
        return Err(invalid());
    }
    Ok((
        reason.to_string(),
        truncate(message, MAX_MESSAGE_LEN).to_string(),
    ))
}

/// Maintenance or a suspected hardware fault: the node is on its way out.
fn replacement_pending(node: &Node, maintenance: &str) -> bool {
    is_true(find_condition(node, maintenance))
        || is_true(find_condition(node, types::HARDWARE_ISSUES_SUSPECTED))
}

fn maintenance_confirmed() -> ConditionUpdate {
    ConditionUpdate::new(
        types::MAINTENANCE,
        true,
        condition_reasons::DRAINING,
        messages::MAINTENANCE_SCHEDULED,
    )
}

fn needs_reboot() -> ConditionUpdate {
    ConditionUpdate::new(
        types::DEGRADED,
        true,
        condition_reasons::NEED_REBOOT,
        messages::SLURM_NODE_DEGRADED,
    )
}

struct ClusterChecks<'a> {
    cluster: &'a ClusterKey,
    nodes: &'a dyn NodeClient,
    cfg: &'a ChecksConfig,
    drainer: Drainer<'a>,
}

impl<'a> ClusterChecks<'a> {
    fn new(
        cluster: &'a ClusterKey,
        nodes: &'a dyn NodeClient,
        clients: &'a ClientSet,
        cfg: &'a ChecksConfig,
    ) -> Self {
        Self {
            cluster,
            nodes,
            cfg,
            drainer: Drainer::new(nodes, clients),
        }
    }

    /// Drains this cluster's scheduler nodes on every Kubernetes node that
    /// is up for replacement and, once drained, marks the node so the drain
    /// flow may evict its pods.
    async fn maintenance(&self, k8s_nodes: &[Node]) -> Result<()> {
        let maintenance = self.cfg.maintenance_condition_type.as_str();
        let confirmed = maintenance_confirmed();
        let confirmed = &confirmed;
        let steps = k8s_nodes
            .iter()
            .filter(|n| replacement_pending(n, maintenance))
            .map(|n| {
                let name = n.name_any();
                Step::new(name.clone(), move || async move {
                    self.drainer
                        .drain_and_confirm(
                            &name,
                            reasons::NODE_REPLACEMENT,
                            Some(self.cluster),
                            Some(confirmed),
                        )
                        .await
                        .map(|_| ())
                })
            })
            .collect();
        execute("maintenance", Strategy::CollectErrors, steps).await
    }

    /// Flags Kubernetes nodes whose worker pods are running out of
    /// ephemeral storage for a reboot.
    async fn ephemeral_storage(&self, k8s_nodes: &[Node]) -> Result<()> {
        let steps = k8s_nodes
            .iter()
            .map(|n| {
                let name = n.name_any();
                Step::new(name.clone(), move || async move {
                    self.storage_on(&name).await
                })
            })
            .collect();
        execute("ephemeral-storage", Strategy::CollectErrors, steps).await
    }

    async fn storage_on(&self, k8s_node: &str) -> Result<()> {
        let pods = self.nodes.list_pods_on_node(k8s_node).await?;
        let workers: Vec<&Pod> = pods
            .iter()
            .filter(|p| {
                backing_node(p).is_some_and(|b| b.cluster == *self.cluster)
            })
            .collect();
        if workers.is_empty() {
            return Ok(());
        }

        let summary = self.nodes.stats_summary(k8s_node).await?;
        let threshold = self.cfg.ephemeral_storage_threshold_pct;
        let offenders: Vec<_> = storage::usage(&workers, &summary)
            .into_iter()
            .filter(|u| u.percent > threshold)
            .collect();
        if offenders.is_empty() {
            return Ok(());
        }
        for u in &offenders {
            warn!(
                k8s_node,
                pod = %u.pod,
                namespace = %u.namespace,
                used_bytes = u.used_bytes,
                limit_bytes = u.limit_bytes,
                percent = u.percent,
                threshold,
                "ephemeral storage usage above threshold"
            );
        }
        self.drainer
            .drain_and_confirm(
                k8s_node,
                reasons::NODE_REBOOT,
                Some(self.cluster),
                Some(&needs_reboot()),
            )
            .await
            .map(|_| ())
    }

    #[instrument(
        skip_all,
        fields(slurm_node = %node.name, instance = %node.instance_id)
    )]
    async fn correlate(&self, node: &SlurmNode) -> Result<()> {
        let Some(reason) = &node.reason else {
            return Ok(());
        };
        let cause = match classify(&reason.reason) {
            Some(cause) => cause,
            None if is_operator_reason(&reason.reason) => {
                return Err(Error::UnknownReason {
                    node: node.name.clone(),
                    reason: reason.reason.clone(),
                });
            }
            None => {
                debug!(
                    reason = %reason.reason,
                    "foreign drain reason, leaving node alone"
                );
                return Ok(());
            }
        };

        let Some(k8s_node) = self.nodes.get_node(&node.instance_id).await?
        else {
            info!("backing kubernetes node is gone, resuming");
            return self.drainer.resume(self.cluster, &node.name).await;
        };

        match cause {
            Cause::Degraded => self.degraded(node, reason, &k8s_node).await,
            Cause::Replacement => {
                let maintenance = &self.cfg.maintenance_condition_type;
                if replacement_pending(&k8s_node, maintenance) {
                    Ok(())
                } else {
                    info!("replacement no longer pending, resuming");
                    self.drainer.resume(self.cluster, &node.name).await
                }
            }
            Cause::HardwareProblem => {
                self.set_unhealthy(node, reason, &k8s_node).await
            }
            Cause::NodeProblem => {
                self.node_problem(node, reason, &k8s_node).await
            }
        }
    }

    async fn degraded(
        &self,
        node: &SlurmNode,
        reason: &NodeReason,
        k8s_node: &Node,
    ) -> Result<()> {
        let drain = move || async move {
            self.drainer
                .drain_and_confirm(
                    &node.instance_id,
                    reasons::NODE_REBOOT,
                    Some(self.cluster),
                    Some(&needs_reboot()),
                )
                .await
                .map(|_| ())
        };

        match find_condition(k8s_node, types::DEGRADED) {
            None => drain().await,
            Some(c) if is_true(Some(c)) => {
                debug!("reboot still in progress");
                Ok(())
            }
            Some(c)
                if transition_time(c)
                    .is_some_and(|t| reason.changed_at < t) =>
            {
                info!("drained before the last reboot, resuming");
                self.drainer.resume(self.cluster, &node.name).await
            }
            Some(_) => drain().await,
        }
    }

    /// Resumes the node if it was drained before the Kubernetes node
    /// existed. Returns whether it did.
    async fn resume_if_stale(
        &self,
        node: &SlurmNode,
        reason: &NodeReason,
        k8s_node: &Node,
    ) -> Result<bool> {
        let created = k8s_node.meta().creation_timestamp.as_ref().map(|t| t.0);
        if !created.is_some_and(|c| reason.changed_at < c) {
            return Ok(false);
        }
        info!("drained before the kubernetes node was created, resuming");
        self.drainer.resume(self.cluster, &node.name).await?;
        Ok(true)
    }

    async fn set_unhealthy(
        &self,
        node: &SlurmNode,
        reason: &NodeReason,
        k8s_node: &Node,
    ) -> Result<()> {
        if !self.cfg.enable_node_replacement {
            debug!("node replacement disabled, skipping");
            return Ok(());
        }
        if self.resume_if_stale(node, reason, k8s_node).await? {
            return Ok(());
        }
        if is_true(find_condition(k8s_node, types::HARDWARE_ISSUES_SUSPECTED)) {
            return Ok(());
        }
        let update = ConditionUpdate::new(
            types::HARDWARE_ISSUES_SUSPECTED,
            true,
            condition_reasons::GPU_HEALTH_CHECK_FAILED,
            node.comment.clone(),
        );
        set_node_condition(self.nodes, &k8s_node.name_any(), &update).await?;
        Ok(())
    }

    /// A failed health check moves the node into a maintenance reservation
    /// and resumes it, so the checks can run again without new jobs landing
    /// on it.
    async fn node_problem(
        &self,
        node: &SlurmNode,
        reason: &NodeReason,
        k8s_node: &Node,
    ) -> Result<()> {
        if !self.cfg.enable_node_replacement {
            debug!("node replacement disabled, skipping");
            return Ok(());
        }
        if self.cfg.disable_extensive_check {
            return self.set_unhealthy(node, reason, k8s_node).await;
        }
        if self.resume_if_stale(node, reason, k8s_node).await? {
            return Ok(());
        }
        let (check, detail) = parse_health_check_reason(&reason.reason)?;
        if is_true(find_condition(k8s_node, types::HARDWARE_ISSUES_SUSPECTED)) {
            debug!("hardware issues already suspected, leaving drained");
            return Ok(());
        }
        info!(%check, %detail, "health check failed, reserving node");
        self.drainer
            .reserve(self.cluster, &node.name, MAINTENANCE_RESERVATION_PREFIX)
            .await?;
        self.drainer.resume(self.cluster, &node.name).await
    }
}

/// One full pass for `cluster`.
pub async fn check_cluster(
    nodes: &dyn NodeClient,
    clients: &ClientSet,
    cfg: &ChecksConfig,
    cluster: &ClusterKey,
) -> Result<Action> {
    let Some(api) = clients.get(cluster).await else {
        debug!(%cluster, "no scheduler client registered yet");
        return Ok(Action::requeue(NO_CLIENT_REQUEUE));
    };

    let k8s_nodes = nodes.list_nodes().await?;
    let slurm_nodes = api.list_nodes().await?;
    let checks = ClusterChecks::new(cluster, nodes, clients, cfg);
    let checks = &checks;
    let k8s_nodes = k8s_nodes.as_slice();

    let mut steps = vec![
        Step::new("maintenance", move || checks.maintenance(k8s_nodes)),
        Step::new("ephemeral-storage", move || {
            checks.ephemeral_storage(k8s_nodes)
        }),
    ];
    steps.extend(
        slurm_nodes
            .iter()
            .filter(|n| n.is_drain() && n.reason.is_some())
            .map(|n| Step::new(n.name.clone(), move || checks.correlate(n))),
    );
    execute(&cluster.to_string(), Strategy::CollectErrors, steps).await?;

    Ok(Action::requeue(Duration::from_secs(cfg.slurm_nodes_requeue_secs)))
}

#[instrument(skip_all, fields(ns, name))]
async fn reconcile(
    cluster: Arc<SlurmCluster>,
    ctx: Arc<ChecksContext>,
) -> Result<Action> {
    let name = cluster.name_any();
    let ns = cluster
        .namespace()
        .ok_or_else(|| Error::missing(&name, "metadata.namespace"))?;
    Span::current().record("ns", ns.as_str()).record("name", name.as_str());
    if cluster.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let key = ClusterKey::new(ns, name);
    let action = with_deadline(
        ctx.cfg.reconcile_timeout(),
        check_cluster(ctx.nodes.as_ref(), &ctx.clients, &ctx.cfg.checks, &key),
    )
    .await?;
    ctx.backoff.reset(&object_key(cluster.as_ref()));
    Ok(action)
}

fn error_policy(
    cluster: Arc<SlurmCluster>,
    error: &Error,
    ctx: Arc<ChecksContext>,
) -> Action {
    requeue_with_backoff(cluster.as_ref(), error, &ctx.backoff)
}

pub async fn run(ctx: Arc<ChecksContext>) -> anyhow::Result<()> {
    let api = scoped::<SlurmCluster>(&ctx.client, ctx.cfg.namespace());
    let (reader, writer) = reflector::store();
    let clusters = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);

    let concurrency = ctx.cfg.concurrency;
    Controller::for_stream(clusters, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => {
                    debug!(cluster = %obj, ?action, "scheduler nodes checked")
                }
                Err(e) => warn!(error = %e, "scheduler nodes check failed"),
            }
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, Utc};
    use k8s_openapi::api::core::v1::{
        Container, NodeStatus, PodSpec, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use slurmop_node::MockNodeClient;
    use slurmop_node::stats::StatsSummary;
    use slurmop_slurm::{MockSlurmApi, NodeState};
    use std::collections::BTreeMap;

    use crate::templates::LABEL_INSTANCE;

    fn key() -> ClusterKey {
        ClusterKey::new("soperator", "slurm1")
    }

    fn drained(reason: &str, changed_at: DateTime<Utc>) -> SlurmNode {
        SlurmNode {
            name: "worker-0".into(),
            cluster: key(),
            instance_id: "node-a".into(),
            states: [NodeState::Idle, NodeState::Drain].into_iter().collect(),
            reason: Some(NodeReason {
                reason: reason.into(),
                changed_at,
            }),
            comment: "xid 79 on gpu 3".into(),
        }
    }

    fn k8s_node(conditions: Vec<ConditionUpdate>, at: DateTime<Utc>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".into()),
                creation_timestamp: Some(Time(Utc::now() - TimeDelta::days(1))),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(
                    conditions.iter().map(|c| c.to_condition(at)).collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker-0".into()),
                namespace: Some("soperator".into()),
                labels: Some(BTreeMap::from([(
                    LABEL_INSTANCE.to_string(),
                    "slurm1".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn serving(node: Option<Node>) -> MockNodeClient {
        let mut nodes = MockNodeClient::new();
        nodes
            .expect_get_node()
            .withf(|name| name == "node-a")
            .returning(move |_| Ok(node.clone()));
        nodes
    }

    async fn clients_with(api: MockSlurmApi) -> ClientSet {
        let clients = ClientSet::new();
        clients.add(key(), Arc::new(api)).await;
        clients
    }

    async fn correlate(
        nodes: &MockNodeClient,
        api: MockSlurmApi,
        cfg: &ChecksConfig,
        node: &SlurmNode,
    ) -> Result<()> {
        let clients = clients_with(api).await;
        let cluster = key();
        ClusterChecks::new(&cluster, nodes, &clients, cfg)
            .correlate(node)
            .await
    }

    #[test]
    fn reasons_are_classified_by_substring() {
        assert_eq!(classify("Kill task failed"), Some(Cause::Degraded));
        assert_eq!(
            classify("Soperator auto-healing: node reboot"),
            Some(Cause::Degraded)
        );
        assert_eq!(
            classify("Soperator auto-healing: node replacement"),
            Some(Cause::Replacement)
        );
        assert_eq!(
            classify("[hardware_problem] gpu fell off the bus"),
            Some(Cause::HardwareProblem)
        );
        assert_eq!(
            classify("[node_problem] disk full: /var at 100%"),
            Some(Cause::NodeProblem)
        );
        assert_eq!(classify("planned maintenance by admin"), None);
    }

    #[test]
    fn operator_markers_are_recognized() {
        assert!(is_operator_reason("Soperator auto-healing: node upgrade"));
        assert!(is_operator_reason("[power_problem] psu"));
        assert!(!is_operator_reason("planned maintenance by admin"));
        assert!(!is_operator_reason("[ticket-42] reseat cables"));
    }

    #[test]
    fn pascal_case_conversion() {
        assert_eq!(to_pascal_case("xidError"), "XidError");
        assert_eq!(to_pascal_case("gpu xid error"), "GpuXidError");
        assert_eq!(to_pascal_case("  ib-link_DOWN  "), "IbLinkDown");
        assert_eq!(to_pascal_case("3 gpus 2missing"), "GpusMissing");
        assert_eq!(to_pascal_case("!!!"), "");
    }

    #[test]
    fn health_check_reason_parsing() {
        let (reason, message) =
            parse_health_check_reason("[node_problem] gpu xid error: XID 79 on GPU 3")
                .unwrap();
        assert_eq!(reason, "GpuXidError");
        assert_eq!(message, "XID 79 on GPU 3");

        assert!(matches!(
            parse_health_check_reason("[node_problem] no separator"),
            Err(Error::HealthCheckReason(_))
        ));
        assert!(parse_health_check_reason("[node_problem] ???: boom").is_err());

        let long = format!("[node_problem] disk: {}", "x".repeat(40_000));
        let (_, message) = parse_health_check_reason(&long).unwrap();
        assert_eq!(message.len(), MAX_MESSAGE_LEN);
    }

    #[test_log::test(tokio::test)]
    async fn kill_task_failed_drains_then_marks_degraded() {
        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes
            .expect_list_pods_on_node()
            .withf(|name| name == "node-a")
            .returning(|_| Ok(vec![worker_pod()]));
        nodes
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::DEGRADED).is_some_and(|c| {
                    c.status == "True"
                        && c.reason.as_deref() == Some(condition_reasons::NEED_REBOOT)
                })
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut api = MockSlurmApi::new();
        api.expect_drain_node()
            .withf(|name, reason| name == "worker-0" && reason == reasons::NODE_REBOOT)
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_get_node()
            .returning(|_| Ok(drained(reasons::KILL_TASK_FAILED, Utc::now())));

        let node = drained("Kill task failed", Utc::now());
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn drained_before_last_reboot_is_resumed() {
        let now = Utc::now();
        let degraded = ConditionUpdate::new(
            types::DEGRADED,
            false,
            condition_reasons::REBOOTED,
            messages::REBOOTED,
        );
        let nodes = serving(Some(k8s_node(vec![degraded], now)));

        let mut api = MockSlurmApi::new();
        api.expect_drain_node().never();
        api.expect_resume_node()
            .withf(|name| name == "worker-0")
            .times(1)
            .returning(|_| Ok(()));

        let node = drained(reasons::NODE_REBOOT, now - TimeDelta::minutes(30));
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn degraded_node_is_left_alone_while_rebooting() {
        let degraded = needs_reboot();
        let mut nodes = serving(Some(k8s_node(vec![degraded], Utc::now())));
        nodes.expect_update_conditions().never();

        let mut api = MockSlurmApi::new();
        api.expect_drain_node().never();
        api.expect_resume_node().never();

        let node = drained(reasons::KILL_TASK_FAILED, Utc::now());
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_kubernetes_node_resumes_scheduler_node() {
        let nodes = serving(None);
        let mut api = MockSlurmApi::new();
        api.expect_resume_node().times(1).returning(|_| Ok(()));

        let node = drained(reasons::NODE_REPLACEMENT, Utc::now());
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finished_replacement_resumes_and_pending_one_waits() {
        let node = drained(reasons::NODE_REPLACEMENT, Utc::now());

        let nodes = serving(Some(k8s_node(vec![], Utc::now())));
        let mut api = MockSlurmApi::new();
        api.expect_resume_node().times(1).returning(|_| Ok(()));
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();

        let maintenance = ConditionUpdate::new(
            types::DEFAULT_MAINTENANCE,
            true,
            "Planned",
            "",
        );
        let nodes = serving(Some(k8s_node(vec![maintenance], Utc::now())));
        let mut api = MockSlurmApi::new();
        api.expect_resume_node().never();
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hardware_problem_marks_node_with_comment() {
        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::HARDWARE_ISSUES_SUSPECTED).is_some_and(|c| {
                    c.reason.as_deref()
                        == Some(condition_reasons::GPU_HEALTH_CHECK_FAILED)
                        && c.message.as_deref() == Some("xid 79 on gpu 3")
                })
            })
            .times(1)
            .returning(|_| Ok(()));

        let node = drained("[hardware_problem] gpu", Utc::now());
        correlate(&nodes, MockSlurmApi::new(), &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn node_problem_reserves_then_resumes() {
        let node = drained("[node_problem] disk full: /var at 100%", Utc::now());

        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes.expect_update_conditions().never();
        let mut api = MockSlurmApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_create_reservation()
            .withf(|reservation, node| {
                reservation == "suspicious-node-worker-0" && node == "worker-0"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_resume_node()
            .withf(|name| name == "worker-0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn node_problem_stays_drained_while_hardware_suspected() {
        let node = drained("[node_problem] disk full: /var at 100%", Utc::now());
        let suspected = ConditionUpdate::new(
            types::HARDWARE_ISSUES_SUSPECTED,
            true,
            condition_reasons::GPU_HEALTH_CHECK_FAILED,
            "",
        );
        let mut nodes = serving(Some(k8s_node(vec![suspected], Utc::now())));
        nodes.expect_update_conditions().never();
        let mut api = MockSlurmApi::new();
        api.expect_create_reservation().never();
        api.expect_resume_node().never();

        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_node_problem_is_an_error() {
        let node = drained("[node_problem] no separator", Utc::now());
        let nodes = serving(Some(k8s_node(vec![], Utc::now())));
        let mut api = MockSlurmApi::new();
        api.expect_create_reservation().never();
        api.expect_resume_node().never();

        let err = correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HealthCheckReason(_)), "{err}");
    }

    #[tokio::test]
    async fn node_problem_without_extensive_check_marks_hardware() {
        let node = drained("[node_problem] disk full: /var at 100%", Utc::now());
        let cfg = ChecksConfig {
            disable_extensive_check: true,
            ..Default::default()
        };
        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::HARDWARE_ISSUES_SUSPECTED).is_some_and(|c| {
                    c.reason.as_deref()
                        == Some(condition_reasons::GPU_HEALTH_CHECK_FAILED)
                        && c.message.as_deref() == Some("xid 79 on gpu 3")
                })
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut api = MockSlurmApi::new();
        api.expect_create_reservation().never();

        correlate(&nodes, api, &cfg, &node).await.unwrap();
    }

    #[tokio::test]
    async fn node_problem_ignored_when_replacement_disabled() {
        let node = drained("[node_problem] disk full: /var at 100%", Utc::now());
        let cfg = ChecksConfig {
            enable_node_replacement: false,
            ..Default::default()
        };
        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes.expect_update_conditions().never();
        let mut api = MockSlurmApi::new();
        api.expect_create_reservation().never();
        api.expect_resume_node().never();

        correlate(&nodes, api, &cfg, &node).await.unwrap();
    }

    fn scheduled() -> ConditionUpdate {
        ConditionUpdate::new(types::DEFAULT_MAINTENANCE, true, "Planned", "")
    }

    #[test_log::test(tokio::test)]
    async fn maintenance_is_confirmed_once_scheduler_drained() {
        let host = k8s_node(vec![scheduled()], Utc::now());
        let mut nodes = serving(Some(host.clone()));
        nodes
            .expect_list_pods_on_node()
            .withf(|name| name == "node-a")
            .returning(|_| Ok(vec![worker_pod()]));
        nodes
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::MAINTENANCE).is_some_and(|c| {
                    c.status == "True"
                        && c.reason.as_deref() == Some(condition_reasons::DRAINING)
                        && c.message.as_deref() == Some(messages::MAINTENANCE_SCHEDULED)
                })
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut api = MockSlurmApi::new();
        api.expect_drain_node()
            .withf(|name, reason| {
                name == "worker-0" && reason == reasons::NODE_REPLACEMENT
            })
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_get_node()
            .returning(|_| Ok(drained(reasons::NODE_REPLACEMENT, Utc::now())));
        let clients = clients_with(api).await;

        let cluster = key();
        let cfg = ChecksConfig::default();
        ClusterChecks::new(&cluster, &nodes, &clients, &cfg)
            .maintenance(&[host, k8s_node(vec![], Utc::now())])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn maintenance_is_not_confirmed_while_jobs_run() {
        let host = k8s_node(vec![scheduled()], Utc::now());
        let mut nodes = MockNodeClient::new();
        nodes
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![worker_pod()]));
        nodes.expect_update_conditions().never();

        let mut api = MockSlurmApi::new();
        api.expect_drain_node().times(1).returning(|_, _| Ok(()));
        api.expect_get_node().returning(|_| {
            let mut busy = drained(reasons::NODE_REPLACEMENT, Utc::now());
            busy.states = [NodeState::Allocated, NodeState::Drain].into_iter().collect();
            Ok(busy)
        });
        let clients = clients_with(api).await;

        let cluster = key();
        let cfg = ChecksConfig::default();
        ClusterChecks::new(&cluster, &nodes, &clients, &cfg)
            .maintenance(&[host])
            .await
            .unwrap();
    }

    const STORAGE_LIMIT: &str = "1000";

    fn storage_worker(instance: &str) -> Pod {
        let mut pod = worker_pod();
        pod.metadata.uid = Some("uid-0".into());
        pod.metadata.labels = Some(BTreeMap::from([(
            LABEL_INSTANCE.to_string(),
            instance.to_string(),
        )]));
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "slurmd".into(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        "ephemeral-storage".to_string(),
                        Quantity(STORAGE_LIMIT.into()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod
    }

    fn summary(used_bytes: u64) -> StatsSummary {
        serde_json::from_value(serde_json::json!({
            "pods": [{
                "podRef": {"name": "worker-0", "namespace": "soperator", "uid": "uid-0"},
                "ephemeral-storage": {"usedBytes": used_bytes}
            }]
        }))
        .unwrap()
    }

    fn storage_config() -> ChecksConfig {
        ChecksConfig {
            ephemeral_storage_threshold_pct: 50.0,
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn storage_above_threshold_drains_for_reboot() {
        let mut nodes = serving(Some(k8s_node(vec![], Utc::now())));
        nodes
            .expect_list_pods_on_node()
            .withf(|name| name == "node-a")
            .returning(|_| Ok(vec![storage_worker("slurm1")]));
        nodes
            .expect_stats_summary()
            .times(1)
            .returning(|_| Ok(summary(600)));
        nodes
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::DEGRADED).is_some_and(|c| {
                    c.status == "True"
                        && c.reason.as_deref() == Some(condition_reasons::NEED_REBOOT)
                })
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut api = MockSlurmApi::new();
        api.expect_drain_node()
            .withf(|name, reason| name == "worker-0" && reason == reasons::NODE_REBOOT)
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_get_node()
            .returning(|_| Ok(drained(reasons::NODE_REBOOT, Utc::now())));
        let clients = clients_with(api).await;

        let cluster = key();
        let cfg = storage_config();
        ClusterChecks::new(&cluster, &nodes, &clients, &cfg)
            .storage_on("node-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn storage_at_or_below_threshold_is_left_alone() {
        for used in [500, 400] {
            let mut nodes = MockNodeClient::new();
            nodes
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![storage_worker("slurm1")]));
            nodes
                .expect_stats_summary()
                .times(1)
                .returning(move |_| Ok(summary(used)));
            nodes.expect_update_conditions().never();
            let mut api = MockSlurmApi::new();
            api.expect_drain_node().never();
            let clients = clients_with(api).await;

            let cluster = key();
            let cfg = storage_config();
            ClusterChecks::new(&cluster, &nodes, &clients, &cfg)
                .storage_on("node-a")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn storage_of_other_clusters_is_not_inspected() {
        let mut nodes = MockNodeClient::new();
        nodes
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![storage_worker("slurm2")]));
        nodes.expect_stats_summary().never();
        let mut api = MockSlurmApi::new();
        api.expect_drain_node().never();
        let clients = clients_with(api).await;

        let cluster = key();
        let cfg = storage_config();
        ClusterChecks::new(&cluster, &nodes, &clients, &cfg)
            .storage_on("node-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drained_before_node_creation_is_resumed() {
        let nodes = serving(Some(k8s_node(vec![], Utc::now())));
        let mut api = MockSlurmApi::new();
        api.expect_resume_node().times(1).returning(|_| Ok(()));

        let node = drained("[hardware_problem] gpu", Utc::now() - TimeDelta::days(2));
        correlate(&nodes, api, &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmapped_operator_reason_is_an_error_and_foreign_is_ignored() {
        let mut nodes = MockNodeClient::new();
        nodes.expect_get_node().never();

        let node = drained("Soperator auto-healing: node upgrade", Utc::now());
        let err = correlate(&nodes, MockSlurmApi::new(), &ChecksConfig::default(), &node)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownReason { .. }), "{err}");

        let node = drained("cable swap by admin", Utc::now());
        correlate(&nodes, MockSlurmApi::new(), &ChecksConfig::default(), &node)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cluster_without_client_is_requeued_shortly() {
        let mut nodes = MockNodeClient::new();
        nodes.expect_list_nodes().never();
        let action = check_cluster(
            &nodes,
            &ClientSet::new(),
            &ChecksConfig::default(),
            &key(),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(NO_CLIENT_REQUEUE));
    }

    #[test_log::test(tokio::test)]
    async fn full_pass_reports_failing_nodes_and_keeps_going() {
        let mut nodes = MockNodeClient::new();
        nodes
            .expect_list_nodes()
            .returning(|| Ok(vec![k8s_node(vec![], Utc::now())]));
        nodes.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        nodes
            .expect_get_node()
            .returning(|_| Ok(Some(k8s_node(vec![], Utc::now()))));

        let mut api = MockSlurmApi::new();
        api.expect_list_nodes().returning(|| {
            let mut unknown = drained("Soperator auto-healing: upgrade", Utc::now());
            unknown.name = "worker-1".into();
            let mut idle = drained("", Utc::now());
            idle.name = "worker-2".into();
            idle.reason = None;
            Ok(vec![drained(reasons::NODE_REPLACEMENT, Utc::now()), unknown, idle])
        });
        api.expect_resume_node()
            .withf(|name| name == "worker-0")
            .times(1)
            .returning(|_| Ok(()));
        let clients = clients_with(api).await;

        let err = check_cluster(&nodes, &clients, &ChecksConfig::default(), &key())
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("worker-1"), "{text}");
        assert!(!text.contains("worker-0"), "{text}");
    }
}
