//! The per-node controller: watches only its own node and carries out the
//! drain, reboot and undrain the operator requests.

use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, WatchStreamExt, reflector, watcher};
use kube::{Api, Client, ResourceExt};
use slurmop_node::conditions::{
    STATUS_FALSE, conditions_fingerprint, find_condition, has_reason, messages,
    reasons, types,
};
use slurmop_node::{ConditionUpdate, KubeNodeClient, NodeClient, set_node_condition};
use tracing::{debug, info, instrument, warn};

use crate::actions::{
    blocking_pods, is_unschedulable, select_actions, with_no_execute_taint,
    without_no_execute_taint,
};
use crate::config::RebooterConfig;
use crate::host::{Host, SystemHost};
use crate::{Error, Result};

const TRACKED: [&str; 2] = [types::DRAIN, types::REBOOT];

pub struct Agent {
    nodes: Arc<dyn NodeClient>,
    host: Arc<dyn Host>,
    cfg: RebooterConfig,
}

impl Agent {
    pub fn new(
        nodes: Arc<dyn NodeClient>,
        host: Arc<dyn Host>,
        cfg: RebooterConfig,
    ) -> Self {
        Self { nodes, host, cfg }
    }

    pub fn node_name(&self) -> &str {
        &self.cfg.node_name
    }

    /// One pass over the agent's node.
    pub async fn reconcile_node(&self) -> Result<Action> {
        let Some(node) = self.nodes.get_node(self.node_name()).await? else {
            debug!("node is gone");
            return Ok(Action::await_change());
        };
        let booted_at = self.host.boot_time().await?;
        let actions = select_actions(&node, booted_at);
        debug!(?actions, %booted_at, "actions selected");

        if actions.drain && !self.drain(&node).await? {
            return Ok(Action::requeue(self.cfg.eviction_requeue()));
        }
        if actions.reboot {
            self.set(types::REBOOT, true, reasons::REBOOTING, messages::REBOOTING)
                .await?;
            self.host.reboot().await?;
            return Ok(Action::await_change());
        }
        if actions.report_rebooted
            && !has_reason(find_condition(&node, types::REBOOT), reasons::REBOOTED)
        {
            self.set(types::REBOOT, true, reasons::REBOOTED, messages::REBOOTED)
                .await?;
        }
        if actions.undrain {
            self.undrain(&node).await?;
        }
        Ok(Action::await_change())
    }

    /// Cordons and taints the node, then checks that every pod that has to
    /// leave has left. Returns `false` while some are still running.
    async fn drain(&self, node: &Node) -> Result<bool> {
        let drain = find_condition(node, types::DRAIN);
        if !has_reason(drain, reasons::DRAINING) && !has_reason(drain, reasons::DRAINED) {
            self.set(types::DRAIN, true, reasons::DRAINING, messages::DRAINING)
                .await?;
        }
        if !is_unschedulable(node) {
            info!("cordoning node");
            self.nodes.set_unschedulable(self.node_name(), true).await?;
        }
        if let Some(taints) = with_no_execute_taint(node) {
            info!("adding NoExecute taint");
            self.nodes.set_taints(self.node_name(), taints).await?;
        }

        let pods = self.nodes.list_pods_on_node(self.node_name()).await?;
        let blocking = blocking_pods(&pods);
        if let Some(first) = blocking.first() {
            info!(
                pods = blocking.len(),
                first = %first.name_any(),
                "waiting for pods to be evicted"
            );
            return Ok(false);
        }

        if !has_reason(drain, reasons::DRAINED) {
            self.set(types::DRAIN, true, reasons::DRAINED, messages::DRAINED)
                .await?;
        }
        Ok(true)
    }

    async fn undrain(&self, node: &Node) -> Result<()> {
        if is_unschedulable(node) {
            info!("uncordoning node");
            self.nodes.set_unschedulable(self.node_name(), false).await?;
        }
        if let Some(taints) = without_no_execute_taint(node) {
            info!("removing NoExecute taint");
            self.nodes.set_taints(self.node_name(), taints).await?;
        }
        let settled = find_condition(node, types::DRAIN)
            .is_some_and(|c| c.status == STATUS_FALSE);
        if !settled {
            self.set(types::DRAIN, false, reasons::UNDRAINED, messages::UNDRAINED)
                .await?;
        }
        Ok(())
    }

    async fn set(
        &self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let update = ConditionUpdate::new(type_, status, reason, message);
        set_node_condition(self.nodes.as_ref(), self.node_name(), &update).await?;
        Ok(())
    }
}

/// Filter on the drain and reboot conditions; heartbeats do not pass.
pub fn drain_or_reboot_changed(node: &Node) -> Option<u64> {
    Some(conditions_fingerprint(node, &TRACKED))
}

#[instrument(skip_all, fields(node = %node.name_any()))]
async fn reconcile(node: Arc<Node>, agent: Arc<Agent>) -> Result<Action> {
    agent.reconcile_node().await
}

fn error_policy(_node: Arc<Node>, error: &Error, agent: Arc<Agent>) -> Action {
    warn!(%error, "reconcile failed");
    Action::requeue(agent.cfg.eviction_requeue())
}

/// Watches the agent's own node until shutdown.
pub async fn run(client: Client, cfg: RebooterConfig) -> anyhow::Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    let own_node =
        watcher::Config::default().fields(&format!("metadata.name={}", cfg.node_name));
    let agent = Arc::new(Agent::new(
        Arc::new(KubeNodeClient::new(client)),
        Arc::new(SystemHost::new(&cfg.uptime_path, &cfg.reboot_command)),
        cfg,
    ));

    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, own_node))
        .default_backoff()
        .applied_objects()
        .predicate_filter(drain_or_reboot_changed);

    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, agent)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(node = %obj, ?action, "node reconciled"),
                Err(e) => warn!(error = %e, "node reconcile failed"),
            }
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;
    use chrono::{DateTime, TimeDelta, Utc};
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use mockall::Sequence;
    use slurmop_node::MockNodeClient;
    use slurmop_node::conditions::STATUS_TRUE;
    use std::time::Duration;

    use crate::actions::{NO_EXECUTE_TAINT_KEY, no_execute_taint};

    fn ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - TimeDelta::minutes(minutes)
    }

    fn cfg() -> RebooterConfig {
        RebooterConfig {
            node_name: "node-a".into(),
            reboot_command: "true".into(),
            eviction_requeue_secs: 10,
            uptime_path: "/proc/uptime".into(),
            log_format: "text".into(),
        }
    }

    fn node(conds: &[(&str, bool, &str, DateTime<Utc>)], cordoned: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".into()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(cordoned),
                taints: cordoned.then(|| vec![no_execute_taint()]),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(
                    conds
                        .iter()
                        .map(|(t, s, r, at)| {
                            ConditionUpdate::new(*t, *s, *r, "").to_condition(*at)
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    fn worker_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("worker-0".into()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn booted(minutes: i64) -> MockHost {
        let mut host = MockHost::new();
        host.expect_boot_time().returning(move || Ok(ago(minutes)));
        host
    }

    fn serving(n: Node) -> MockNodeClient {
        let mut client = MockNodeClient::new();
        client
            .expect_get_node()
            .withf(|name| name == "node-a")
            .returning(move |_| Ok(Some(n.clone())));
        client
    }

    fn agent(client: MockNodeClient, host: MockHost) -> Agent {
        Agent::new(Arc::new(client), Arc::new(host), cfg())
    }

    fn writes(reason: &'static str) -> impl Fn(&Node) -> bool {
        move |n: &Node| {
            n.status
                .iter()
                .flat_map(|s| s.conditions.iter().flatten())
                .any(|c| c.reason.as_deref() == Some(reason))
        }
    }

    #[test_log::test(tokio::test)]
    async fn drain_waits_for_evictions() {
        let n = node(&[(types::DRAIN, true, reasons::NEED_DRAIN, ago(1))], false);
        let mut client = serving(n);
        client
            .expect_update_conditions()
            .withf(writes(reasons::DRAINING))
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_set_unschedulable()
            .withf(|name, on| name == "node-a" && *on)
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_set_taints()
            .withf(|_, taints| taints.iter().any(|t| t.key == NO_EXECUTE_TAINT_KEY))
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![worker_pod()]));

        let action = agent(client, booted(60)).reconcile_node().await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }

    #[test_log::test(tokio::test)]
    async fn evicted_node_is_marked_drained() {
        let n = node(&[(types::DRAIN, true, reasons::DRAINING, ago(1))], true);
        let mut client = serving(n);
        client.expect_set_unschedulable().never();
        client.expect_set_taints().never();
        client.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        client
            .expect_update_conditions()
            .withf(writes(reasons::DRAINED))
            .times(1)
            .returning(|_| Ok(()));

        let action = agent(client, booted(60)).reconcile_node().await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test_log::test(tokio::test)]
    async fn drained_node_is_left_alone() {
        let n = node(&[(types::DRAIN, true, reasons::DRAINED, ago(1))], true);
        let mut client = serving(n);
        client.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        client.expect_update_conditions().never();
        client.expect_set_unschedulable().never();
        client.expect_set_taints().never();

        agent(client, booted(60)).reconcile_node().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn pending_reboot_marks_and_reboots_after_drain() {
        let n = node(
            &[
                (types::DRAIN, true, reasons::DRAINED, ago(3)),
                (types::REBOOT, true, reasons::NEED_REBOOT, ago(5)),
            ],
            true,
        );
        let mut seq = Sequence::new();
        let mut client = serving(n);
        client.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        client
            .expect_update_conditions()
            .withf(writes(reasons::REBOOTING))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut host = booted(60);
        host.expect_reboot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let action = agent(client, host).reconcile_node().await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test_log::test(tokio::test)]
    async fn reboot_waits_for_evictions() {
        let n = node(
            &[(types::REBOOT, true, reasons::NEED_REBOOT, ago(5))],
            true,
        );
        let mut client = serving(n);
        client
            .expect_update_conditions()
            .withf(writes(reasons::DRAINING))
            .returning(|_| Ok(()));
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![worker_pod()]));
        let mut host = booted(60);
        host.expect_reboot().never();

        let action = agent(client, host).reconcile_node().await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }

    #[test_log::test(tokio::test)]
    async fn host_back_from_reboot_reports_rebooted() {
        let n = node(
            &[
                (types::DRAIN, true, reasons::DRAINED, ago(10)),
                (types::REBOOT, true, reasons::REBOOTING, ago(10)),
            ],
            true,
        );
        let mut client = serving(n);
        client.expect_list_pods_on_node().returning(|_| Ok(vec![]));
        client
            .expect_update_conditions()
            .withf(|n| {
                find_condition(n, types::REBOOT).is_some_and(|c| {
                    c.status == STATUS_TRUE
                        && c.reason.as_deref() == Some(reasons::REBOOTED)
                })
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut host = booted(2);
        host.expect_reboot().never();

        agent(client, host).reconcile_node().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn released_node_is_uncordoned_and_untainted() {
        let n = node(
            &[
                (types::DRAIN, false, reasons::REBOOTED, ago(1)),
                (types::REBOOT, false, reasons::REBOOTED, ago(1)),
            ],
            true,
        );
        let mut client = serving(n);
        client
            .expect_set_unschedulable()
            .withf(|_, on| !*on)
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_set_taints()
            .withf(|_, taints| taints.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_update_conditions().never();
        client.expect_list_pods_on_node().never();

        agent(client, booted(60)).reconcile_node().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn fresh_node_records_undrained() {
        let mut client = serving(node(&[], false));
        client
            .expect_update_conditions()
            .withf(writes(reasons::UNDRAINED))
            .times(1)
            .returning(|_| Ok(()));
        client.expect_set_unschedulable().never();
        client.expect_set_taints().never();

        agent(client, booted(60)).reconcile_node().await.unwrap();
    }

    #[tokio::test]
    async fn missing_node_is_a_no_op() {
        let mut client = MockNodeClient::new();
        client.expect_get_node().returning(|_| Ok(None));
        let mut host = MockHost::new();
        host.expect_boot_time().never();

        let action = agent(client, host).reconcile_node().await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn filter_tracks_only_drain_and_reboot() {
        let base = node(&[(types::DRAIN, true, reasons::DRAINING, ago(5))], false);

        let mut heartbeat = base.clone();
        let mut other = base.clone();
        for n in [&mut heartbeat, &mut other] {
            let conds = n
                .status
                .as_mut()
                .and_then(|s| s.conditions.as_mut())
                .unwrap();
            conds[0].last_heartbeat_time = Some(Time(Utc::now()));
        }
        other
            .status
            .as_mut()
            .and_then(|s| s.conditions.as_mut())
            .unwrap()
            .push(ConditionUpdate::new("Ready", true, "KubeletReady", "").to_condition(ago(1)));
        assert_eq!(drain_or_reboot_changed(&base), drain_or_reboot_changed(&heartbeat));
        assert_eq!(drain_or_reboot_changed(&base), drain_or_reboot_changed(&other));

        let rebooting = node(
            &[
                (types::DRAIN, true, reasons::DRAINING, ago(5)),
                (types::REBOOT, true, reasons::NEED_REBOOT, ago(1)),
            ],
            false,
        );
        assert_ne!(drain_or_reboot_changed(&base), drain_or_reboot_changed(&rebooting));
    }
}
