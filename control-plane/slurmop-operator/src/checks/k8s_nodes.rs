//! Drain, reboot and not-ready flows of a Kubernetes node.
//!
//! Each flow is a pure decision over the node's conditions; the reconcile
//! applies the decisions through the [`NodeClient`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, WatchStreamExt, controller, reflector, watcher};
use kube::{Api, ResourceExt};
use slurmop_node::conditions::{
    conditions_fingerprint, find_condition, has_reason, is_true, messages,
    reasons, transition_time, types,
};
use slurmop_node::{ConditionUpdate, NodeClient, set_node_condition};
use tracing::{Span, debug, info, instrument, warn};

use crate::Result;
use crate::checks::ChecksContext;
use crate::config::ChecksConfig;
use crate::controller::{object_key, requeue_with_backoff, with_deadline};

/// Slack added to not-ready requeues so the deadline has passed on wake-up.
const NOT_READY_BUFFER: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Nothing,
    Set(Vec<ConditionUpdate>),
    DeleteNode,
    RequeueAfter(Duration),
}

/// Acts only on the scheduler-confirmed maintenance condition, so no pod is
/// evicted before the scheduler has stopped placing work on the node.
pub fn drain_decision(node: &Node) -> Decision {
    let drain = find_condition(node, types::DRAIN);
    let maintenance_due = is_true(find_condition(node, types::MAINTENANCE));

    if !is_true(drain) {
        if !maintenance_due {
            return Decision::Nothing;
        }
        let message = if is_true(find_condition(
            node,
            types::HARDWARE_ISSUES_SUSPECTED,
        )) {
            messages::HARDWARE_ISSUES_SUSPECTED
        } else {
            messages::MAINTENANCE_SCHEDULED
        };
        return Decision::Set(vec![ConditionUpdate::new(
            types::DRAIN,
            true,
            reasons::NEED_DRAIN,
            message,
        )]);
    }

    // Still draining; the drain is confirmed elsewhere.
    if !has_reason(drain, reasons::DRAINED) {
        return Decision::Nothing;
    }
    if maintenance_due {
        Decision::DeleteNode
    } else {
        Decision::Set(vec![ConditionUpdate::new(
            types::DRAIN,
            false,
            reasons::REBOOTED,
            messages::REBOOTED,
        )])
    }
}

pub fn reboot_decision(node: &Node) -> Decision {
    let reboot = find_condition(node, types::REBOOT);
    let degraded = find_condition(node, types::DEGRADED);

    if !is_true(reboot) {
        let Some(degraded) = degraded.filter(|c| is_true(Some(*c))) else {
            return Decision::Nothing;
        };
        let rebooted_since = reboot
            .and_then(transition_time)
            .zip(transition_time(degraded))
            .is_some_and(|(rebooted, degraded)| rebooted > degraded);
        if rebooted_since {
            return Decision::Nothing;
        }
        return Decision::Set(vec![ConditionUpdate::new(
            types::REBOOT,
            true,
            reasons::NEED_REBOOT,
            messages::SLURM_NODE_DEGRADED,
        )]);
    }

    if !has_reason(reboot, reasons::REBOOTED) {
        return Decision::Nothing;
    }
    Decision::Set(
        [types::REBOOT, types::DRAIN, types::DEGRADED]
            .into_iter()
            .map(|t| {
                ConditionUpdate::new(t, false, reasons::REBOOTED, messages::REBOOTED)
            })
            .collect(),
    )
}

/// A node is not ready when its `Ready` condition is anything but `True`.
/// Nodes without the condition are left alone.
pub fn not_ready_decision(
    node: &Node,
    timeout: Duration,
    delete_enabled: bool,
    now: DateTime<Utc>,
) -> Decision {
    let Some(ready) = find_condition(node, types::READY) else {
        return Decision::Nothing;
    };
    if is_true(Some(ready)) {
        return Decision::Nothing;
    }
    let since = transition_time(ready).unwrap_or(now);
    let elapsed = (now - since).to_std().unwrap_or_default();
    if elapsed < timeout {
        return Decision::RequeueAfter(timeout - elapsed + NOT_READY_BUFFER);
    }
    if delete_enabled {
        Decision::DeleteNode
    } else {
        Decision::Nothing
    }
}

/// Condition types whose changes re-trigger a node reconcile.
pub const TRACKED_TYPES: [&str; 6] = [
    types::DRAIN,
    types::REBOOT,
    types::HARDWARE_ISSUES_SUSPECTED,
    types::DEGRADED,
    types::READY,
    types::MAINTENANCE,
];

/// Watch filter for nodes: only changes to the tracked conditions pass,
/// heartbeat-only updates do not.
pub fn tracked_conditions(node: &Node) -> Option<u64> {
    Some(conditions_fingerprint(node, &TRACKED_TYPES))
}

/// Evaluates every flow against the live node and applies the outcome.
///
/// A deletion wins over everything else. Otherwise condition updates are
/// written and the shortest requested requeue is returned.
pub async fn reconcile_node(
    nodes: &dyn NodeClient,
    cfg: &ChecksConfig,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Action> {
    let Some(node) = nodes.get_node(name).await? else {
        debug!("node is gone");
        return Ok(Action::await_change());
    };

    let decisions = [
        drain_decision(&node),
        reboot_decision(&node),
        not_ready_decision(
            &node,
            cfg.not_ready_timeout(),
            cfg.delete_not_ready_nodes,
            now,
        ),
    ];

    if decisions.contains(&Decision::DeleteNode) {
        info!("deleting node");
        nodes.delete_node(name).await?;
        return Ok(Action::await_change());
    }

    let mut requeue: Option<Duration> = None;
    for decision in decisions {
        match decision {
            Decision::Set(updates) => {
                for update in &updates {
                    set_node_condition(nodes, name, update).await?;
                }
            }
            Decision::RequeueAfter(after) => {
                requeue = Some(requeue.map_or(after, |r| r.min(after)));
            }
            Decision::Nothing | Decision::DeleteNode => {}
        }
    }
    Ok(requeue.map_or_else(Action::await_change, Action::requeue))
}

#[instrument(skip_all, fields(node))]
async fn reconcile(node: Arc<Node>, ctx: Arc<ChecksContext>) -> Result<Action> {
    let name = node.name_any();
    Span::current().record("node", name.as_str());
    let action = with_deadline(
        ctx.cfg.reconcile_timeout(),
        reconcile_node(ctx.nodes.as_ref(), &ctx.cfg.checks, &name, Utc::now()),
    )
    .await?;
    ctx.backoff.reset(&object_key(node.as_ref()));
    Ok(action)
}

fn error_policy(
    node: Arc<Node>,
    error: &crate::Error,
    ctx: Arc<ChecksContext>,
) -> Action {
    requeue_with_backoff(node.as_ref(), error, &ctx.backoff)
}

pub async fn run(ctx: Arc<ChecksContext>) -> anyhow::Result<()> {
    let api: Api<Node> = Api::all(ctx.client.clone());
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects()
        .predicate_filter(tracked_conditions);

    let concurrency = ctx.cfg.concurrency;
    Controller::for_stream(stream, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(node = %obj, ?action, "node checked"),
                Err(e) => warn!(error = %e, "node check failed"),
            }
        })
        .await;
    Ok(())
}
